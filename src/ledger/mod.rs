//! Chain read path: ABI plumbing, JSON-RPC transport, and the history
//! reader built on top of them.

pub mod abi;
mod reader;
mod rpc;

pub use abi::{AbiError, RawPartEvent};
pub use reader::{LedgerReader, ScanBudget};
pub use rpc::{HttpRpc, LedgerError, LedgerRpc, LogEntry, Receipt};
