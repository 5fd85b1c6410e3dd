//! JSON-RPC access to the ledger node.
//!
//! The reader and poller talk to the chain through the `LedgerRpc` trait;
//! `HttpRpc` is the blocking JSON-RPC 2.0 implementation used in
//! production.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy_primitives::B256;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::core::PartHash;
use crate::ledger::abi::{self, AbiError, RawPartEvent};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// Node unreachable or the RPC returned an error. Transient from the
    /// caller's point of view.
    #[error("ledger rpc error: {0}")]
    Rpc(String),
    #[error("ledger response malformed: {0}")]
    Decode(String),
    #[error(transparent)]
    Abi(#[from] AbiError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One matched log from `eth_getLogs`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub transaction_hash: String,
    pub block_number: u64,
}

/// Mined-transaction receipt, reduced to what the poller needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Receipt {
    pub success: bool,
    pub block_number: u64,
}

/// Read seam to the chain. Everything the reader and poller need, and
/// nothing else; tests implement this over in-memory fixtures.
pub trait LedgerRpc: Send + Sync {
    /// Current chain head.
    fn block_number(&self) -> Result<u64, LedgerError>;

    /// Canonical history for a part, via the registry contract's view call.
    fn part_history(&self, part_hash: &PartHash) -> Result<Vec<RawPartEvent>, LedgerError>;

    /// Logs for one event topic and part over an inclusive block range.
    fn logs(
        &self,
        topic: B256,
        part_hash: &PartHash,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<LogEntry>, LedgerError>;

    /// Receipt for a transaction id, or None while it is still pending.
    fn transaction_receipt(&self, transaction_id: &str) -> Result<Option<Receipt>, LedgerError>;
}

#[derive(Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// Blocking JSON-RPC 2.0 client against a single node endpoint.
pub struct HttpRpc {
    agent: ureq::Agent,
    endpoint: String,
    contract: String,
    next_id: AtomicU64,
}

impl HttpRpc {
    pub fn new(
        endpoint: impl Into<String>,
        contract: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout(timeout)
            .build();
        Self {
            agent,
            endpoint: endpoint.into(),
            contract: contract.into(),
            next_id: AtomicU64::new(1),
        }
    }

    fn request(&self, method: &str, params: Value) -> Result<Value, LedgerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let response = self
            .agent
            .post(&self.endpoint)
            .send_json(&body)
            .map_err(|err| LedgerError::Rpc(err.to_string()))?;
        let parsed: RpcResponse = response
            .into_json()
            .map_err(|err| LedgerError::Decode(err.to_string()))?;
        if let Some(error) = parsed.error {
            return Err(LedgerError::Rpc(format!(
                "{} (code {})",
                error.message, error.code
            )));
        }
        parsed
            .result
            .ok_or_else(|| LedgerError::Decode(format!("{method} response has no result")))
    }
}

impl LedgerRpc for HttpRpc {
    fn block_number(&self) -> Result<u64, LedgerError> {
        let result = self.request("eth_blockNumber", json!([]))?;
        parse_quantity(&result, "blockNumber")
    }

    fn part_history(&self, part_hash: &PartHash) -> Result<Vec<RawPartEvent>, LedgerError> {
        let call = json!({
            "to": self.contract,
            "data": abi::history_call_data(part_hash),
        });
        let result = self.request("eth_call", json!([call, "latest"]))?;
        let raw = result
            .as_str()
            .ok_or_else(|| LedgerError::Decode("eth_call result is not a string".to_string()))?;
        Ok(abi::decode_history(raw)?)
    }

    fn logs(
        &self,
        topic: B256,
        part_hash: &PartHash,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<LogEntry>, LedgerError> {
        let filter = json!({
            "address": self.contract,
            "fromBlock": format!("{from_block:#x}"),
            "toBlock": format!("{to_block:#x}"),
            "topics": [format!("{topic:#x}"), part_hash.to_hex()],
        });
        let result = self.request("eth_getLogs", json!([filter]))?;
        let entries = result
            .as_array()
            .ok_or_else(|| LedgerError::Decode("eth_getLogs result is not an array".to_string()))?;
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let transaction_hash = entry["transactionHash"]
                .as_str()
                .ok_or_else(|| LedgerError::Decode("log missing transactionHash".to_string()))?
                .to_string();
            let block_number = parse_quantity(&entry["blockNumber"], "log blockNumber")?;
            out.push(LogEntry {
                transaction_hash,
                block_number,
            });
        }
        Ok(out)
    }

    fn transaction_receipt(&self, transaction_id: &str) -> Result<Option<Receipt>, LedgerError> {
        let result = self.request("eth_getTransactionReceipt", json!([transaction_id]))?;
        if result.is_null() {
            return Ok(None);
        }
        let block_number = parse_quantity(&result["blockNumber"], "receipt blockNumber")?;
        let success = match result["status"].as_str() {
            Some(status) => parse_hex_u64(status, "receipt status")? == 1,
            // Pre-Byzantium nodes omit the status field; presence of a
            // receipt is the best signal available.
            None => true,
        };
        Ok(Some(Receipt {
            success,
            block_number,
        }))
    }
}

fn parse_quantity(value: &Value, field: &str) -> Result<u64, LedgerError> {
    let raw = value
        .as_str()
        .ok_or_else(|| LedgerError::Decode(format!("{field} is not a hex string")))?;
    parse_hex_u64(raw, field)
}

fn parse_hex_u64(raw: &str, field: &str) -> Result<u64, LedgerError> {
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    u64::from_str_radix(digits, 16)
        .map_err(|_| LedgerError::Decode(format!("{field} is not a hex quantity: {raw:?}")))
}
