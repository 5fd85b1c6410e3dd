use thiserror::Error;

use crate::config::ConfigError;
use crate::daemon::BroadcastError;
use crate::ledger::LedgerError;
use crate::relayer::RelayerError;
use crate::store::StoreError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// The store failed an integrity guarantee; stop, do not retry.
    Fatal,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over canonical capability errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Relayer(#[from] RelayerError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Broadcast(#[from] BroadcastError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Store(e) if e.is_fatal() => Transience::Fatal,
            Error::Store(_) => Transience::Retryable,
            Error::Relayer(e) if e.is_permanent() => Transience::Permanent,
            Error::Relayer(_) => Transience::Retryable,
            Error::Ledger(LedgerError::Store(e)) if e.is_fatal() => Transience::Fatal,
            Error::Ledger(_) => Transience::Retryable,
            Error::Broadcast(_) => Transience::Permanent,
            Error::Config(_) => Transience::Permanent,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transience_classification() {
        let corrupt: Error = StoreError::Corruption("bad invariant".to_string()).into();
        assert_eq!(corrupt.transience(), Transience::Fatal);

        let rejected: Error = RelayerError::Rejected {
            status: 400,
            message: "no".to_string(),
        }
        .into();
        assert_eq!(rejected.transience(), Transience::Permanent);

        let offline: Error = RelayerError::Unavailable("refused".to_string()).into();
        assert!(offline.transience().is_retryable());

        let rpc: Error = LedgerError::Rpc("timeout".to_string()).into();
        assert!(rpc.transience().is_retryable());
    }
}
