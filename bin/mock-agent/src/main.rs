// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::anyhow;
use clap::Parser;
use dropshot::ConfigDropshot;
use slog::{info, Drain};

#[derive(Debug, Parser)]
#[clap(about, version)]
/// A mock host agent that accepts VM creation requests
enum Args {
    /// Generates the OpenAPI specification.
    OpenApi,
    /// Runs the mock agent.
    Run {
        #[clap(name = "AGENT_IP:PORT", action)]
        agent_addr: SocketAddr,

        /// Total guest memory the simulated host can commit, in MiB
        #[clap(long, default_value_t = 64 * 1024, action)]
        memory_capacity_mib: u64,

        /// Delay every successful response by this many milliseconds
        #[clap(long, action)]
        response_delay_ms: Option<u64>,
    },
}

fn build_logger() -> slog::Logger {
    let main_drain = if atty::is(atty::Stream::Stdout) {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    } else {
        let drain =
            slog_bunyan::with_name("vmbroker-mock-agent", std::io::stdout())
                .build()
                .fuse();
        slog_async::Async::new(drain)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build_no_guard()
    };

    let filtered = slog::LevelFilter::new(main_drain, slog::Level::Info);
    slog::Logger::root(filtered.fuse(), slog::o!())
}

fn run_openapi() -> Result<(), String> {
    vmbroker_mock_agent::api()?
        .openapi("Mock VM Host Agent API", semver::Version::new(0, 0, 1))
        .description("API for creating VMs on a simulated host.")
        .write(&mut std::io::stdout())
        .map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args {
        Args::OpenApi => run_openapi()
            .map_err(|e| anyhow!("Cannot generate OpenAPI spec: {}", e)),
        Args::Run { agent_addr, memory_capacity_mib, response_delay_ms } => {
            let config = ConfigDropshot {
                bind_address: agent_addr,
                ..Default::default()
            };
            let settings = vmbroker_mock_agent::Settings {
                memory_capacity_mib,
                response_delay: response_delay_ms.map(Duration::from_millis),
            };

            let log = build_logger();
            info!(log, "Starting mock agent...";
                  "address" => %agent_addr,
                  "memory_capacity_mib" => memory_capacity_mib);

            let server = vmbroker_mock_agent::start(config, settings, log)
                .map_err(|e| anyhow!("Failed to start server: {}", e))?;
            server
                .await
                .map_err(|e| anyhow!("Server exited with an error: {}", e))
        }
    }
}
