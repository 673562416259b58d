use crate::amount::{amount_str, Amount, ExchangeRate};
use crate::audit::{Auditor, ReferenceTotal, Severity};
use crate::chain::{ContractQuerier, NativeBalances};
use crate::error::{ConfigError, QueryError};
use crate::exclusion::ExclusionRegistry;
use crate::ledger::{Account, Denom};
use crate::resolver::{ConversionStep, QueryRate, Resolver};
use crate::stage::Checkpoint;
use anyhow::Context;
use serde::Deserialize;
use serde_json::Value;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnapshotConfig {
    /// frozen chain state (json)
    pub state: PathBuf,
    pub partials: Vec<PartialSource>,
    #[serde(default)]
    pub exclusions: Vec<ExclusionConfig>,
    #[serde(default)]
    pub steps: Vec<StepConfig>,
    #[serde(default)]
    pub references: Vec<ReferenceConfig>,
    pub output: PathBuf,
    #[serde(default)]
    pub excluded_output: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum PartialSource {
    /// json lines of ledger entries produced by an external extractor
    Ledger { path: PathBuf },
    TokenHolders {
        contract: String,
        #[serde(default = "default_balance_namespace")]
        namespace: String,
    },
    Positions {
        contract: String,
        denom: Denom,
        ids: Vec<String>,
        #[serde(default = "default_workers")]
        workers: usize,
    },
}

fn default_balance_namespace() -> String {
    "balance".to_string()
}

fn default_workers() -> usize {
    8
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExclusionConfig {
    pub denom: Denom,
    pub accounts: Vec<Account>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StepConfig {
    pub source: Denom,
    pub target: Denom,
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub rate: RateConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateConfig {
    Fixed(ExchangeRate),
    Query {
        contract: String,
        msg: Value,
        field: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReferenceConfig {
    pub label: String,
    pub denom: Denom,
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub total: ReferenceSource,
    #[serde(with = "amount_str")]
    pub tolerance: Amount,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceSource {
    Fixed(#[serde(with = "amount_str")] Amount),
    /// native balance of an account, e.g. the vault holding the underlying
    NativeBalance { account: Account, denom: Denom },
}

impl SnapshotConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Cannot read config file {path}", path = path.display()))?;
        let config: Self = serde_yaml::from_reader(file)
            .with_context(|| format!("Cannot parse config file {path}", path = path.display()))?;
        Ok(config)
    }

    pub fn registry(&self) -> ExclusionRegistry {
        let mut registry = ExclusionRegistry::new();
        for exclusion in self.exclusions.iter() {
            registry.register_all(exclusion.denom.clone(), exclusion.accounts.iter().cloned());
        }
        registry
    }

    pub fn resolver(
        &self,
        querier: Arc<dyn ContractQuerier + Send + Sync>,
    ) -> Result<Resolver, ConfigError> {
        let steps = self
            .steps
            .iter()
            .map(|step| match &step.rate {
                RateConfig::Fixed(rate) => {
                    ConversionStep::fixed(step.source.clone(), step.target.clone(), rate.clone())
                }
                RateConfig::Query {
                    contract,
                    msg,
                    field,
                } => ConversionStep::new(
                    step.source.clone(),
                    step.target.clone(),
                    QueryRate::new(querier.clone(), contract.clone(), msg.clone(), field.clone()),
                ),
            })
            .collect();
        Resolver::new(steps)
    }

    /// Resolves every reference total against the frozen state.
    pub fn auditor<N: NativeBalances + ?Sized>(&self, balances: &N) -> Result<Auditor, QueryError> {
        let mut auditor = Auditor::default();
        for reference in self.references.iter() {
            let amount = match &reference.total {
                ReferenceSource::Fixed(amount) => amount.clone(),
                ReferenceSource::NativeBalance { account, denom } => {
                    balances.native_balance(account, denom)?
                }
            };
            auditor.add_reference(
                ReferenceTotal::new(
                    reference.label.clone(),
                    reference.denom.clone(),
                    amount,
                    reference.tolerance.clone(),
                )
                .with_severity(reference.severity)
                .at(reference.checkpoints.clone()),
            );
        }
        Ok(auditor)
    }
}
