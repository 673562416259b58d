use crate::audit::{AuditReport, Auditor};
use crate::error::{Result, SnapshotError};
use crate::exclusion::ExclusionRegistry;
use crate::ledger::{Denom, Ledger};
use crate::merge::merge;
use crate::resolver::{ResolutionReport, Resolver};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Where a snapshot run is. Stages only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Raw,
    Merged,
    ExclusionApplied,
    Resolving { pass: usize },
    Canonical,
    /// A stage aborted. Terminal: the ledger is kept as it was before the
    /// failing stage and every further transition is rejected.
    Failed,
}

impl Stage {
    /// The audit checkpoint reached by entering this stage.
    pub fn checkpoint(&self) -> Option<Checkpoint> {
        match self {
            Stage::Raw => None,
            Stage::Merged => Some(Checkpoint::Merged),
            Stage::ExclusionApplied => Some(Checkpoint::ExclusionApplied),
            Stage::Resolving { .. } => Some(Checkpoint::ResolutionPass),
            Stage::Canonical => Some(Checkpoint::Canonical),
            Stage::Failed => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Raw => f.write_str("raw"),
            Stage::Merged => f.write_str("merged"),
            Stage::ExclusionApplied => f.write_str("exclusion-applied"),
            Stage::Resolving { pass } => write!(f, "resolution pass {pass}"),
            Stage::Canonical => f.write_str("canonical"),
            Stage::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Checkpoint {
    Merged,
    ExclusionApplied,
    ResolutionPass,
    Canonical,
}

/// Lifecycle of a single denomination through the run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DenomState {
    Merged,
    ExclusionApplied,
    /// Produced by a conversion step, may still be rewritten by a later one.
    Resolving,
    /// Consumed as a conversion source, no entries left.
    Converted,
    Canonical,
}

/// Context of one snapshot run: the working ledger, the exclusions and the
/// auditor travel together through merge, exclusion and resolution, and
/// nothing outlives the run.
pub struct SnapshotRun {
    height: u64,
    stage: Stage,
    ledger: Ledger,
    registry: ExclusionRegistry,
    auditor: Auditor,
    lifecycle: BTreeMap<Denom, DenomState>,
    span: tracing::Span,
}

impl SnapshotRun {
    pub fn new(height: u64, registry: ExclusionRegistry, auditor: Auditor) -> Self {
        Self {
            height,
            stage: Stage::Raw,
            ledger: Ledger::new(),
            registry,
            auditor,
            lifecycle: BTreeMap::new(),
            span: tracing::info_span!("snapshot", height),
        }
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn registry(&self) -> &ExclusionRegistry {
        &self.registry
    }

    pub fn auditor(&self) -> &Auditor {
        &self.auditor
    }

    pub fn denom_state(&self, denom: &Denom) -> Option<DenomState> {
        self.lifecycle.get(denom).copied()
    }

    fn require(&self, expected: Stage, attempted: &'static str) -> Result<()> {
        if self.stage != expected {
            return Err(SnapshotError::StageOrder {
                current: self.stage,
                attempted,
            });
        }
        Ok(())
    }

    fn advance(&mut self, stage: Stage) -> Result<AuditReport> {
        self.stage = stage;
        let audit = self.auditor.check(&stage, &self.ledger);
        if let Err(err) = &audit {
            self.fail(err);
        }
        audit
    }

    fn fail(&mut self, err: &SnapshotError) {
        tracing::error!("Snapshot aborted at {}: {}", self.stage, err);
        self.stage = Stage::Failed;
    }

    /// Consolidates the extractor outputs into the working ledger.
    pub fn merge(&mut self, partials: Vec<Ledger>) -> Result<AuditReport> {
        let span = self.span.clone();
        let _enter = span.enter();
        self.require(Stage::Raw, "merge")?;

        let partial_count = partials.len();
        self.ledger = merge(partials);
        for denom in self.ledger.denoms() {
            self.lifecycle.insert(denom, DenomState::Merged);
        }
        tracing::info!(
            "Merged {} partial ledgers: {} accounts, {} denominations",
            partial_count,
            self.ledger.len(),
            self.lifecycle.len()
        );
        self.advance(Stage::Merged)
    }

    /// Strips already attributed contract balances. Only allowed right after
    /// merging: the registry is keyed by pre-resolution denominations.
    pub fn apply_exclusions(&mut self) -> Result<AuditReport> {
        let span = self.span.clone();
        let _enter = span.enter();
        self.require(Stage::Merged, "apply_exclusions")?;

        let removed = self.registry.apply(&mut self.ledger);
        for state in self.lifecycle.values_mut() {
            *state = DenomState::ExclusionApplied;
        }
        tracing::info!("Exclusions removed {} entries", removed);
        self.advance(Stage::ExclusionApplied)
    }

    /// Runs the conversion pipeline, auditing after every pass and once more
    /// when every denomination is canonical. The pipeline works on a copy, so
    /// on error the run is failed with the pre-resolution ledger intact.
    pub fn resolve(&mut self, resolver: &Resolver) -> Result<(ResolutionReport, AuditReport)> {
        let span = self.span.clone();
        let _enter = span.enter();
        self.require(Stage::ExclusionApplied, "resolve")?;

        let auditor = &mut self.auditor;
        let lifecycle = &mut self.lifecycle;
        let result =
            resolver.run_pipeline_with(self.ledger.clone(), |pass, outcome, ledger| {
                if outcome.converted_entries > 0 {
                    lifecycle.insert(outcome.source.clone(), DenomState::Converted);
                    lifecycle.insert(outcome.target.clone(), DenomState::Resolving);
                }
                auditor.retire(outcome.source.clone());
                auditor.check(&Stage::Resolving { pass }, ledger)?;
                Ok(())
            });
        let (ledger, report) = match result {
            Ok(resolved) => resolved,
            Err(err) => {
                self.fail(&err);
                return Err(err);
            }
        };
        self.ledger = ledger;
        self.stage = Stage::Resolving {
            pass: report.steps.len(),
        };

        for state in self.lifecycle.values_mut() {
            if *state != DenomState::Converted {
                *state = DenomState::Canonical;
            }
        }
        let audit = self.advance(Stage::Canonical)?;
        tracing::info!(
            "Snapshot canonical: {} accounts, {} denominations",
            self.ledger.len(),
            self.ledger.denoms().len()
        );
        Ok((report, audit))
    }

    /// The canonical ledger. Fails unless resolution has completed.
    pub fn finish(self) -> Result<Ledger> {
        self.require(Stage::Canonical, "finish")?;
        Ok(self.ledger)
    }
}
