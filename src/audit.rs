use crate::amount::Amount;
use crate::error::{ConservationMismatch, Result};
use crate::ledger::{Denom, Ledger};
use crate::stage::{Checkpoint, Stage};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Passes iff `|reference - computed| <= tolerance`. The tolerance is an
/// absolute amount, sized by the caller for the truncation the stages so
/// far can accumulate.
pub fn assert_almost_equal(
    label: &str,
    reference: &Amount,
    computed: &Amount,
    tolerance: &Amount,
) -> std::result::Result<(), ConservationMismatch> {
    let delta = if reference >= computed {
        reference - computed
    } else {
        computed - reference
    };
    if &delta <= tolerance {
        return Ok(());
    }
    Err(ConservationMismatch {
        label: label.to_string(),
        reference: reference.clone(),
        computed: computed.clone(),
        delta,
        tolerance: tolerance.clone(),
    })
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Fail the run.
    #[default]
    Abort,
    /// Log and record, keep going.
    Warn,
}

/// An authoritative total for one denomination, e.g. a token contract's
/// recorded supply or the native balance of a vault.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReferenceTotal {
    pub label: String,
    pub denom: Denom,
    pub amount: Amount,
    pub tolerance: Amount,
    pub severity: Severity,
    /// Checkpoints this reference applies to; empty means all of them.
    pub checkpoints: Vec<Checkpoint>,
}

impl ReferenceTotal {
    pub fn new(label: impl Into<String>, denom: Denom, amount: Amount, tolerance: Amount) -> Self {
        Self {
            label: label.into(),
            denom,
            amount,
            tolerance,
            severity: Severity::Abort,
            checkpoints: vec![],
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn at(mut self, checkpoints: Vec<Checkpoint>) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    fn applies_to(&self, checkpoint: Checkpoint) -> bool {
        self.checkpoints.is_empty() || self.checkpoints.contains(&checkpoint)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuditReport {
    pub checked: usize,
    pub mismatches: Vec<ConservationMismatch>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Runs every applicable reference total against the ledger after each
/// pipeline stage. Denominations that were consumed by a conversion step are
/// retired and no longer checked.
#[derive(Clone, Debug, Default)]
pub struct Auditor {
    references: Vec<ReferenceTotal>,
    retired: HashSet<Denom>,
    warnings: Vec<ConservationMismatch>,
}

impl Auditor {
    pub fn new(references: Vec<ReferenceTotal>) -> Self {
        Self {
            references,
            ..Default::default()
        }
    }

    pub fn add_reference(&mut self, reference: ReferenceTotal) {
        self.references.push(reference);
    }

    pub fn retire(&mut self, denom: Denom) {
        self.retired.insert(denom);
    }

    pub fn is_retired(&self, denom: &Denom) -> bool {
        self.retired.contains(denom)
    }

    /// Every warn-level mismatch seen so far in the run.
    pub fn warnings(&self) -> &[ConservationMismatch] {
        &self.warnings
    }

    pub fn check(&mut self, stage: &Stage, ledger: &Ledger) -> Result<AuditReport> {
        let checkpoint = match stage.checkpoint() {
            Some(checkpoint) => checkpoint,
            None => return Ok(AuditReport::default()),
        };

        let mut report = AuditReport::default();
        let mut abort = None;
        for reference in self.references.iter() {
            if !reference.applies_to(checkpoint) || self.retired.contains(&reference.denom) {
                continue;
            }
            report.checked += 1;
            let computed = ledger.sum_by_denom(&reference.denom);
            let label = format!("{} [{}] at {}", reference.label, reference.denom, stage);
            let mismatch =
                match assert_almost_equal(&label, &reference.amount, &computed, &reference.tolerance)
                {
                    Ok(()) => continue,
                    Err(mismatch) => mismatch,
                };

            match reference.severity {
                Severity::Warn => {
                    tracing::warn!("{}", mismatch);
                    self.warnings.push(mismatch.clone());
                }
                Severity::Abort => {
                    tracing::error!("{}", mismatch);
                    if abort.is_none() {
                        abort = Some(mismatch.clone());
                    }
                }
            }
            report.mismatches.push(mismatch);
        }

        if let Some(mismatch) = abort {
            return Err(mismatch.into());
        }
        tracing::debug!(
            "Audit at {}: {} checked, {} mismatches",
            stage,
            report.checked,
            report.mismatches.len()
        );
        Ok(report)
    }
}
