//! Process-wide error taxonomy.
//!
//! Every fallible boundary in the node maps into one of these categories:
//! `Auth`, `Validation` and `State` surface to callers as actionable errors,
//! `Capacity`, `Network` and `Provider` are retryable and recovered locally,
//! `Integrity` and `Fatal` abort the process after logging.

use thiserror::Error;

/// Authentication failures (bad signature, replay, unknown key material).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AuthError {
    #[error("signature verification failed")]
    InvalidSignature,

    #[error("request timestamp outside replay window ({age_secs}s old)")]
    Expired { age_secs: i64 },

    #[error("unknown or malformed public key")]
    UnknownKey,

    #[error("keystore passphrase rejected")]
    BadPassphrase,
}

/// Balance/stake/uniqueness rules evaluated against current chain state.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StateError {
    #[error("insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: u64, available: u64 },

    #[error("duplicate transaction {0}")]
    DuplicateTx(String),

    #[error("validator not in authority set at height {height}")]
    StaleAuthority { height: u64 },
}

/// Failures of the generative capability backing the agent council.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    #[error("provider rate limited")]
    RateLimited,

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider out of capacity")]
    Capacity,
}

impl ProviderError {
    pub fn retryable(&self) -> bool {
        matches!(self, ProviderError::RateLimited | ProviderError::Unavailable(_))
    }
}

/// Top-level node error.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("auth: {0}")]
    Auth(#[from] AuthError),

    #[error("validation: {0}")]
    Validation(String),

    #[error("state: {0}")]
    State(#[from] StateError),

    #[error("capacity: {0}")]
    Capacity(String),

    #[error("network: {0}")]
    Network(String),

    #[error("provider: {0}")]
    Provider(#[from] ProviderError),

    #[error("integrity: {0}")]
    Integrity(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl NodeError {
    pub fn validation(msg: impl Into<String>) -> Self {
        NodeError::Validation(msg.into())
    }

    pub fn backpressure(msg: impl Into<String>) -> Self {
        NodeError::Capacity(msg.into())
    }

    /// HTTP status used by the API boundary when surfacing this error.
    pub fn http_status(&self) -> u16 {
        match self {
            NodeError::Auth(_) => 401,
            NodeError::Validation(_) => 400,
            NodeError::State(StateError::InsufficientFunds { .. }) => 402,
            NodeError::State(StateError::DuplicateTx(_)) => 409,
            NodeError::State(_) => 400,
            NodeError::Capacity(_) => 429,
            NodeError::Network(_) => 502,
            NodeError::Provider(_) => 503,
            NodeError::Integrity(_) | NodeError::Fatal(_) => 500,
        }
    }

    /// Short category tag used in logs and `deliberation.error` events.
    pub fn kind(&self) -> &'static str {
        match self {
            NodeError::Auth(_) => "auth",
            NodeError::Validation(_) => "validation",
            NodeError::State(_) => "state",
            NodeError::Capacity(_) => "capacity",
            NodeError::Network(_) => "network",
            NodeError::Provider(_) => "provider",
            NodeError::Integrity(_) => "integrity",
            NodeError::Fatal(_) => "fatal",
        }
    }
}

pub type NodeResult<T> = Result<T, NodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_mapping_matches_api_contract() {
        assert_eq!(NodeError::Auth(AuthError::InvalidSignature).http_status(), 401);
        assert_eq!(
            NodeError::State(StateError::InsufficientFunds { needed: 5, available: 1 }).http_status(),
            402
        );
        assert_eq!(
            NodeError::State(StateError::DuplicateTx("ab".into())).http_status(),
            409
        );
        assert_eq!(NodeError::backpressure("mempool full").http_status(), 429);
        assert_eq!(NodeError::validation("bad tx").http_status(), 400);
    }

    #[test]
    fn provider_retryability() {
        assert!(ProviderError::RateLimited.retryable());
        assert!(ProviderError::Unavailable("down".into()).retryable());
        assert!(!ProviderError::Capacity.retryable());
    }
}
