// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use slog::{info, o, warn, Drain, Level, Logger};
use tokio_util::sync::CancellationToken;
use vmbroker::vm::VmDynamicState;
use vmbroker::{Collaborators, VmCreator};
use vmbroker_client::Client;
use vmbroker_config_toml::Config;

#[derive(Debug, Parser)]
#[clap(about, version)]
/// A simple CLI tool to create VMs through a host agent
struct Opt {
    /// Host agent address, overriding the one in the configuration
    #[clap(short, long, action)]
    agent: Option<SocketAddr>,

    /// Enable debugging
    #[clap(short, long, action)]
    debug: bool,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the create request a configuration produces, without sending it
    Build {
        /// VM configuration file
        #[clap(action)]
        config: PathBuf,
    },

    /// Create the configured VM and print its dynamic state
    Create {
        /// VM configuration file
        #[clap(action)]
        config: PathBuf,
    },
}

/// Create a top-level logger that outputs to stderr
fn create_logger(opt: &Opt) -> Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let level = if opt.debug { Level::Debug } else { Level::Info };
    let drain = slog::LevelFilter(drain, level).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    Logger::root(drain, o!())
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    vmbroker_config_toml::parse(path)
        .with_context(|| anyhow!("failed to load {}", path.display()))
}

fn creator(
    opt: &Opt,
    config: &Config,
    log: &Logger,
) -> anyhow::Result<VmCreator> {
    let address = opt.agent.unwrap_or(config.agent.address);
    let client = Client::new(address, config.agent.timeout(), log.new(o!()))
        .context("failed to build agent client")?;

    let collaborators = Collaborators {
        features: Arc::new(config.features.clone()),
        ..Collaborators::with_agent(Arc::new(client))
    };
    Ok(VmCreator::new(log.new(o!()), collaborators))
}

fn build(opt: &Opt, path: &Path, log: &Logger) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let request = creator(opt, &config, log)?
        .prepare(&config.create_params())
        .context("failed to build create request")?;

    println!("{}", serde_json::to_string_pretty(&request)?);
    Ok(())
}

async fn create(opt: &Opt, path: &Path, log: &Logger) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let creator = creator(opt, &config, log)?;
    let params = config.create_params();

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    let interrupt_log = log.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(interrupt_log, "interrupted; abandoning creation");
            on_interrupt.cancel();
        }
    });

    let mut dynamic = VmDynamicState::new(params.vm.id);
    creator
        .create(&params, &mut dynamic, &cancel)
        .await
        .with_context(|| anyhow!("failed to create VM {}", params.vm.id))?;

    info!(log, "VM created"; "host" => %params.host.name);
    println!("{}", serde_json::to_string_pretty(&dynamic)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();
    let log = create_logger(&opt);

    match &opt.cmd {
        Command::Build { config } => build(&opt, config, &log)?,
        Command::Create { config } => create(&opt, config, &log).await?,
    }

    Ok(())
}
