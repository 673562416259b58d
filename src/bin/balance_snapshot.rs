use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

use clap::Parser;

use tracing_subscriber::prelude::*;

use balance_snapshot::chain::FrozenState;
use balance_snapshot::config::{PartialSource, SnapshotConfig};
use balance_snapshot::export::dump_ledger;
use balance_snapshot::extract::{namespace_prefix, positions, token_holders};
use balance_snapshot::ledger::Ledger;
use balance_snapshot::stage::SnapshotRun;

#[derive(Parser, Debug)]
#[clap(version)]
pub struct Cli {
    /// path to config file
    #[clap(long, value_parser)]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() {
    let result = _main().await;
    result.unwrap();
}

async fn load_partials(
    config: &SnapshotConfig,
    state: &Arc<FrozenState>,
) -> anyhow::Result<Vec<Ledger>> {
    let mut partials = Vec::with_capacity(config.partials.len());
    for source in config.partials.iter() {
        let ledger = match source {
            PartialSource::Ledger { path } => Ledger::read_json_lines(path)?,
            PartialSource::TokenHolders {
                contract,
                namespace,
            } => {
                let prefix = namespace_prefix(namespace)?;
                token_holders(state.as_ref(), contract, &prefix)
                    .with_context(|| format!("Cannot read holders of {contract}"))?
            }
            PartialSource::Positions {
                contract,
                denom,
                ids,
                workers,
            } => positions(state.clone(), contract, denom.clone(), ids.clone(), *workers)
                .await
                .with_context(|| format!("Cannot enumerate positions of {contract}"))?,
        };
        tracing::info!("Partial {:?}: {} accounts", source, ledger.len());
        partials.push(ledger);
    }
    Ok(partials)
}

async fn _main() -> anyhow::Result<()> {
    // Start logging setup block
    let fmt_layer = tracing_subscriber::fmt::layer();

    tracing_subscriber::registry().with(fmt_layer).init();

    let Cli { config_path } = Cli::parse();

    tracing::info!("Config file {:?}", config_path);
    let config = SnapshotConfig::load(&config_path)?;

    let state = Arc::new(FrozenState::load(&config.state)?);
    let registry = config.registry();
    if let Some(path) = &config.excluded_output {
        registry.dump(path)?;
    }
    let auditor = config
        .auditor(state.as_ref())
        .context("Cannot resolve reference totals")?;
    let resolver = config
        .resolver(state.clone())
        .context("Invalid conversion steps")?;

    let partials = load_partials(&config, &state).await?;

    let mut run = SnapshotRun::new(state.height(), registry, auditor);
    run.merge(partials)?;
    run.apply_exclusions()?;
    let (report, _) = run.resolve(&resolver)?;
    for step in report.steps.iter() {
        tracing::info!(
            "{} -> {}: {} entries, truncation loss {}",
            step.source,
            step.target,
            step.converted_entries,
            step.truncation_loss()
        );
    }
    let warnings = run.auditor().warnings().len();
    if warnings > 0 {
        tracing::warn!("Snapshot finished with {} conservation warnings", warnings);
    }

    let ledger = run.finish()?;
    dump_ledger(&ledger, &config.output)?;
    Ok(())
}
