use crate::amount::{Amount, RateParseError};
use crate::ledger::Denom;
use crate::stage::Stage;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SnapshotError>;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("query error: {0}")]
    Query(#[from] QueryError),
    #[error("rate error: {0}")]
    Rate(#[from] RateParseError),
    #[error("resolver configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("conservation check failed: {0}")]
    Conservation(#[from] ConservationMismatch),
    #[error("exchange rate for {from} -> {to} is zero")]
    ZeroRate { from: Denom, to: Denom },
    #[error("stage {attempted} is not allowed after {current:?}")]
    StageOrder {
        current: Stage,
        attempted: &'static str,
    },
    #[error("worker failed: {0}")]
    Worker(String),
}

/// A collaborator could not answer. Indistinguishable from a real zero, so
/// callers never treat it as one.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("query against {target} failed: {reason}")]
pub struct QueryError {
    pub target: String,
    pub reason: String,
}

impl QueryError {
    pub fn new(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("conversion {denom} -> {denom} converts a denomination into itself")]
    SelfConversion { denom: Denom },
    #[error("denomination {denom} has more than one conversion step")]
    DuplicateSource { denom: Denom },
    #[error("conversion steps form a cycle through {denoms:?}")]
    Cycle { denoms: Vec<Denom> },
    #[error("denominations {denoms:?} are still unresolved after every step ran")]
    Unresolved { denoms: Vec<Denom> },
    #[error("storage namespace of {len} bytes does not fit a u16 length prefix")]
    NamespaceTooLong { len: usize },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error(
    "{label}: reference {reference}, computed {computed}, delta {delta} exceeds tolerance {tolerance}"
)]
pub struct ConservationMismatch {
    pub label: String,
    pub reference: Amount,
    pub computed: Amount,
    pub delta: Amount,
    pub tolerance: Amount,
}
