//! Relayer submission client.
//!
//! The relayer is a thin HTTP service that signs and submits ledger
//! transactions on the device's behalf. One request per mutation: the
//! method name selects the contract call, the params carry the part hash
//! and payload, and the response returns the transaction hash.

use std::io::Read;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{Metadata, MutationKind, PartHash};

#[derive(Debug, Error)]
pub enum RelayerError {
    /// Could not reach the relayer at all. Transient: the coordinator
    /// retries with backoff and the attempt counter does the bookkeeping.
    #[error("relayer unavailable: {0}")]
    Unavailable(String),
    /// The relayer understood the request and refused it. Permanent: the
    /// mutation fails immediately without consuming further attempts.
    #[error("relayer rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    /// The relayer itself errored. Transient, same treatment as
    /// `Unavailable`.
    #[error("relayer fault ({status}): {message}")]
    Fault { status: u16, message: String },
    /// The relayer answered 200 but the body was not the expected shape.
    #[error("relayer protocol error: {0}")]
    Protocol(String),
}

impl RelayerError {
    /// Permanent errors short-circuit the retry loop.
    pub fn is_permanent(&self) -> bool {
        matches!(self, RelayerError::Rejected { .. })
    }
}

/// Submission seam. The sync coordinator only ever talks to this trait,
/// which keeps the drain loop testable without a live relayer.
pub trait RelayerClient: Send + Sync {
    /// Submit one mutation; returns the ledger transaction id.
    fn submit(
        &self,
        kind: MutationKind,
        part_hash: &PartHash,
        metadata: &Metadata,
    ) -> Result<String, RelayerError>;
}

#[derive(Serialize)]
struct SubmitRequest<'a> {
    method: &'static str,
    params: SubmitParams<'a>,
}

#[derive(Serialize)]
struct SubmitParams<'a> {
    #[serde(rename = "partHash")]
    part_hash: String,
    metadata: &'a Metadata,
}

#[derive(Deserialize)]
struct SubmitResponse {
    #[serde(rename = "transactionHash")]
    transaction_hash: Option<String>,
    error: Option<String>,
}

/// Blocking HTTP client for a real relayer endpoint.
pub struct HttpRelayer {
    agent: ureq::Agent,
    endpoint: String,
}

impl HttpRelayer {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout(timeout)
            .build();
        Self {
            agent,
            endpoint: endpoint.into(),
        }
    }
}

impl RelayerClient for HttpRelayer {
    fn submit(
        &self,
        kind: MutationKind,
        part_hash: &PartHash,
        metadata: &Metadata,
    ) -> Result<String, RelayerError> {
        let request = SubmitRequest {
            method: kind.method_name(),
            params: SubmitParams {
                part_hash: part_hash.to_hex(),
                metadata,
            },
        };
        let response = match self.agent.post(&self.endpoint).send_json(&request) {
            Ok(response) => response,
            Err(ureq::Error::Status(status, response)) => {
                let message = read_error_body(response);
                return Err(if (400..500).contains(&status) {
                    RelayerError::Rejected { status, message }
                } else {
                    RelayerError::Fault { status, message }
                });
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(RelayerError::Unavailable(err.to_string()));
            }
        };

        let body: SubmitResponse = response
            .into_json()
            .map_err(|err| RelayerError::Protocol(err.to_string()))?;
        if let Some(error) = body.error {
            return Err(RelayerError::Protocol(error));
        }
        match body.transaction_hash {
            Some(hash) if !hash.is_empty() => Ok(hash),
            _ => Err(RelayerError::Protocol(
                "response missing transactionHash".to_string(),
            )),
        }
    }
}

fn read_error_body(response: ureq::Response) -> String {
    let status_text = response.status_text().to_string();
    let mut body = String::new();
    let mut reader = response.into_reader().take(4 * 1024);
    match reader.read_to_string(&mut body) {
        Ok(_) if !body.trim().is_empty() => body.trim().to_string(),
        _ => status_text,
    }
}
