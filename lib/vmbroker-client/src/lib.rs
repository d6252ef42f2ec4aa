// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface for making API requests to a VM host agent.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use slog::{debug, o, Logger};
use thiserror::Error;
use vmbroker::agent::{AgentError, HostAgent};
use vmbroker_api_types::runtime::VmRuntimeSnapshot;
use vmbroker_api_types::{AgentErrorBody, CreateRequest};

/// Errors which may be returned from the host agent client.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Request failed: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Bad Status: {status}")]
    Status { status: u16, body: Option<AgentErrorBody> },
}

impl From<Error> for AgentError {
    fn from(e: Error) -> Self {
        match e {
            Error::Reqwest(e) if e.is_timeout() => {
                AgentError::Transport(format!("request timed out: {e}"))
            }
            Error::Reqwest(e) => AgentError::Transport(e.to_string()),

            // The agent refused the request and said why; pass its diagnosis
            // along as-is. A bare server error says nothing about the request.
            Error::Status { status, body: Some(body) }
                if status < 500 || body.error_code.is_some() =>
            {
                AgentError::Rejected {
                    code: body.error_code.unwrap_or_else(|| status.to_string()),
                    message: body.message,
                }
            }
            Error::Status { status, body: Some(body) } => {
                AgentError::Transport(format!(
                    "host agent failed with status {status}: {}",
                    body.message
                ))
            }
            Error::Status { status, body: None } => AgentError::Transport(
                format!("host agent answered with status {status}"),
            ),
        }
    }
}

/// Client-side connection to a host agent.
pub struct Client {
    client: reqwest::Client,
    log: Logger,
    address: SocketAddr,
}

// Sends "request", awaits "response", and parses the body into a
// deserializable type. Error responses are decoded as agent error bodies when
// possible.
async fn send_and_parse_response<T: DeserializeOwned>(
    request: reqwest::RequestBuilder,
) -> Result<T, Error> {
    let response = request.send().await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.json::<AgentErrorBody>().await.ok();
        return Err(Error::Status { status: status.as_u16(), body });
    }

    Ok(response.json().await?)
}

impl Client {
    /// Creates a client for the agent at `address`. Every request, including
    /// connection setup, is abandoned after `timeout`.
    pub fn new(
        address: SocketAddr,
        timeout: Duration,
        log: Logger,
    ) -> Result<Client, Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Client {
            client,
            log: log.new(o!("agent_address" => address.to_string())),
            address,
        })
    }

    /// Asks the agent to create the VM described by `request`.
    pub async fn vm_create(
        &self,
        request: &CreateRequest,
    ) -> Result<VmRuntimeSnapshot, Error> {
        let path = format!("http://{}/vm/create", self.address);
        debug!(self.log, "PUT request to {}", path);
        send_and_parse_response(self.client.put(path).json(request)).await
    }
}

#[async_trait]
impl HostAgent for Client {
    async fn create(
        &self,
        request: &CreateRequest,
    ) -> Result<VmRuntimeSnapshot, AgentError> {
        Ok(self.vm_create(request).await?)
    }
}
