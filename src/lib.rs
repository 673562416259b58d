pub mod amount;
pub mod audit;
pub mod chain;
pub mod config;
pub mod error;
pub mod exclusion;
pub mod export;
pub mod extract;
pub mod ledger;
pub mod merge;
pub mod pool;
pub mod probe;
pub mod resolver;
pub mod stage;

pub use error::{Result, SnapshotError};
pub use ledger::{Account, Denom, Ledger, LedgerEntry};
