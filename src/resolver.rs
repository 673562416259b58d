use crate::amount::{Amount, ExchangeRate};
use crate::chain::ContractQuerier;
use crate::error::{ConfigError, QueryError, Result, SnapshotError};
use crate::ledger::{Denom, Ledger};
use num_traits::Zero;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

/// Fetches "units of target per unit of source" at the snapshot height.
pub trait RateLookup {
    fn exchange_rate(&self) -> std::result::Result<ExchangeRate, QueryError>;
}

impl<F> RateLookup for F
where
    F: Fn() -> std::result::Result<ExchangeRate, QueryError>,
{
    fn exchange_rate(&self) -> std::result::Result<ExchangeRate, QueryError> {
        self()
    }
}

#[derive(Clone, Debug)]
pub struct FixedRate(pub ExchangeRate);

impl RateLookup for FixedRate {
    fn exchange_rate(&self) -> std::result::Result<ExchangeRate, QueryError> {
        Ok(self.0.clone())
    }
}

/// Reads the rate from a contract query response. `field` is a dot separated
/// path into the response, the value may be a decimal string or a number.
pub struct QueryRate {
    querier: Arc<dyn ContractQuerier + Send + Sync>,
    contract: String,
    msg: Value,
    field: String,
}

impl QueryRate {
    pub fn new(
        querier: Arc<dyn ContractQuerier + Send + Sync>,
        contract: impl Into<String>,
        msg: Value,
        field: impl Into<String>,
    ) -> Self {
        Self {
            querier,
            contract: contract.into(),
            msg,
            field: field.into(),
        }
    }
}

impl RateLookup for QueryRate {
    fn exchange_rate(&self) -> std::result::Result<ExchangeRate, QueryError> {
        let response = self.querier.query_contract(&self.contract, &self.msg)?;
        let value = self
            .field
            .split('.')
            .try_fold(&response, |value, part| value.get(part))
            .ok_or_else(|| {
                QueryError::new(
                    self.contract.as_str(),
                    format!("response has no field {:?}", self.field),
                )
            })?;
        let raw = match value {
            Value::String(raw) => raw.clone(),
            Value::Number(number) => plain_decimal(&number.to_string()),
            other => {
                return Err(QueryError::new(
                    self.contract.as_str(),
                    format!("field {:?} is not a rate: {other}", self.field),
                ))
            }
        };
        raw.parse()
            .map_err(|err| QueryError::new(self.contract.as_str(), format!("{err}")))
    }
}

/// Rewrites a json number such as `1.5e-7` without its exponent, since
/// rates only parse from plain decimals. Inputs without an exponent are
/// returned unchanged.
fn plain_decimal(raw: &str) -> String {
    let (mantissa, exponent) = match raw.split_once(['e', 'E']) {
        Some((mantissa, exponent)) => match exponent.parse::<i64>() {
            Ok(exponent) => (mantissa, exponent),
            Err(_) => return raw.to_string(),
        },
        None => return raw.to_string(),
    };
    let (sign, mantissa) = match mantissa.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", mantissa),
    };
    let (whole, fraction) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    let digits = format!("{whole}{fraction}");
    let point = whole.len() as i64 + exponent;

    let expanded = if point <= 0 {
        format!("0.{}{digits}", "0".repeat(point.unsigned_abs() as usize))
    } else if point as usize >= digits.len() {
        format!("{digits}{}", "0".repeat(point as usize - digits.len()))
    } else {
        let (whole, fraction) = digits.split_at(point as usize);
        format!("{whole}.{fraction}")
    };
    format!("{sign}{expanded}")
}

/// One edge of the conversion graph: every `source` balance becomes
/// `floor(rate * balance)` of `target`.
pub struct ConversionStep {
    pub source: Denom,
    pub target: Denom,
    lookup: Box<dyn RateLookup>,
}

impl ConversionStep {
    pub fn new(source: Denom, target: Denom, lookup: impl RateLookup + 'static) -> Self {
        Self {
            source,
            target,
            lookup: Box::new(lookup),
        }
    }

    pub fn fixed(source: Denom, target: Denom, rate: ExchangeRate) -> Self {
        Self::new(source, target, FixedRate(rate))
    }
}

impl fmt::Debug for ConversionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionStep")
            .field("source", &self.source)
            .field("target", &self.target)
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepOutcome {
    pub source: Denom,
    pub target: Denom,
    /// `None` when the step had nothing to convert and no rate was fetched.
    pub rate: Option<ExchangeRate>,
    pub converted_entries: usize,
    pub source_removed: Amount,
    pub target_added: Amount,
}

impl StepOutcome {
    /// `floor(rate * source_removed) - target_added`: what per-entry
    /// truncation cost compared to converting the total at once.
    pub fn truncation_loss(&self) -> Amount {
        match &self.rate {
            Some(rate) => rate.apply(&self.source_removed) - &self.target_added,
            None => Amount::zero(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolutionReport {
    pub steps: Vec<StepOutcome>,
}

impl ResolutionReport {
    pub fn converted_entries(&self) -> usize {
        self.steps.iter().map(|step| step.converted_entries).sum()
    }
}

/// Collapses derivative denominations into canonical ones.
///
/// Steps are kept in dependency order: a step producing denom `X` always
/// runs before the step consuming `X`, whatever order they were configured
/// in. Independent steps keep their configured relative order.
#[derive(Debug)]
pub struct Resolver {
    steps: Vec<ConversionStep>,
}

impl Resolver {
    pub fn new(steps: Vec<ConversionStep>) -> std::result::Result<Self, ConfigError> {
        let mut by_source = HashMap::<Denom, usize>::new();
        for (index, step) in steps.iter().enumerate() {
            if step.source == step.target {
                return Err(ConfigError::SelfConversion {
                    denom: step.source.clone(),
                });
            }
            if by_source.insert(step.source.clone(), index).is_some() {
                return Err(ConfigError::DuplicateSource {
                    denom: step.source.clone(),
                });
            }
        }

        // edge i -> j when step i produces what step j consumes
        let mut indegree = vec![0usize; steps.len()];
        let mut successors = vec![Vec::new(); steps.len()];
        for (index, step) in steps.iter().enumerate() {
            if let Some(&next) = by_source.get(&step.target) {
                indegree[next] += 1;
                successors[index].push(next);
            }
        }

        let mut ready: VecDeque<usize> = (0..steps.len()).filter(|i| indegree[*i] == 0).collect();
        let mut order = Vec::with_capacity(steps.len());
        while let Some(index) = ready.pop_front() {
            order.push(index);
            for &next in successors[index].iter() {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    ready.push_back(next);
                }
            }
        }

        if order.len() != steps.len() {
            let placed: HashSet<usize> = order.iter().copied().collect();
            let mut denoms: Vec<Denom> = (0..steps.len())
                .filter(|i| !placed.contains(i))
                .map(|i| steps[i].source.clone())
                .collect();
            denoms.sort();
            return Err(ConfigError::Cycle { denoms });
        }

        let mut slots: Vec<Option<ConversionStep>> = steps.into_iter().map(Some).collect();
        let steps = order
            .into_iter()
            .filter_map(|index| slots[index].take())
            .collect();
        Ok(Self { steps })
    }

    /// Steps in application order.
    pub fn steps(&self) -> &[ConversionStep] {
        &self.steps
    }

    pub fn is_canonical(&self, denom: &Denom) -> bool {
        !self.steps.iter().any(|step| &step.source == denom)
    }

    pub fn run_pipeline(&self, ledger: Ledger) -> Result<(Ledger, ResolutionReport)> {
        self.run_pipeline_with(ledger, |_, _, _| Ok(()))
    }

    /// Like [`Resolver::run_pipeline`], calling `after_pass` once every step
    /// has rewritten the ledger so drift can be checked right where it was
    /// introduced. An error from `after_pass` aborts the pipeline.
    pub fn run_pipeline_with<F>(
        &self,
        mut ledger: Ledger,
        mut after_pass: F,
    ) -> Result<(Ledger, ResolutionReport)>
    where
        F: FnMut(usize, &StepOutcome, &Ledger) -> Result<()>,
    {
        let mut report = ResolutionReport::default();
        for (pass, step) in self.steps.iter().enumerate() {
            let outcome = Self::apply_step(step, &mut ledger)?;
            after_pass(pass, &outcome, &ledger)?;
            report.steps.push(outcome);
        }

        let unresolved: Vec<Denom> = ledger
            .denoms()
            .into_iter()
            .filter(|denom| !self.is_canonical(denom))
            .collect();
        if !unresolved.is_empty() {
            return Err(ConfigError::Unresolved { denoms: unresolved }.into());
        }

        tracing::info!(
            "Resolution finished: {} steps, {} entries converted",
            report.steps.len(),
            report.converted_entries()
        );
        Ok((ledger, report))
    }

    /// Rewrites every `step.source` entry in place. A step with nothing to
    /// convert never queries its rate; a failing or zero rate fails the run.
    pub fn apply_step(step: &ConversionStep, ledger: &mut Ledger) -> Result<StepOutcome> {
        let mut outcome = StepOutcome {
            source: step.source.clone(),
            target: step.target.clone(),
            rate: None,
            converted_entries: 0,
            source_removed: Amount::zero(),
            target_added: Amount::zero(),
        };

        if !ledger.contains_denom(&step.source) {
            return Ok(outcome);
        }

        let rate = if ledger.sum_by_denom(&step.source).is_zero() {
            // only zero entries: relabel them, floor(rate * 0) is 0 for any rate
            None
        } else {
            let rate = step.lookup.exchange_rate()?;
            if rate.is_zero() {
                return Err(SnapshotError::ZeroRate {
                    from: step.source.clone(),
                    to: step.target.clone(),
                });
            }
            Some(rate)
        };

        for (_, (denom, amount)) in ledger.contributions_mut() {
            if denom != &step.source {
                continue;
            }
            let converted = match &rate {
                Some(rate) => rate.apply(amount),
                None => Amount::zero(),
            };
            outcome.source_removed += &*amount;
            outcome.target_added += &converted;
            outcome.converted_entries += 1;
            *denom = step.target.clone();
            *amount = converted;
        }
        outcome.rate = rate;

        tracing::debug!(
            "{} -> {} at {}: {} entries, {} -> {}",
            outcome.source,
            outcome.target,
            outcome
                .rate
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "-".to_string()),
            outcome.converted_entries,
            outcome.source_removed,
            outcome.target_added
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use crate::amount::ExchangeRate;
    use crate::chain::FrozenState;
    use crate::error::{ConfigError, QueryError, SnapshotError};
    use crate::ledger::{Account, Denom, Ledger};
    use crate::resolver::{plain_decimal, ConversionStep, QueryRate, RateLookup, Resolver};
    use num_bigint::BigUint;
    use serde_json::json;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::sync::Arc;

    fn rate(raw: &str) -> ExchangeRate {
        raw.parse().unwrap()
    }

    fn amount(value: u64) -> BigUint {
        BigUint::from(value)
    }

    fn balances(ledger: &Ledger, account: &str) -> Vec<(Denom, BigUint)> {
        ledger.get(&Account::from(account)).unwrap().to_vec()
    }

    #[test]
    fn btoken_scenario() {
        let mut ledger = Ledger::new();
        ledger.append("alice".into(), "bToken".into(), amount(100));
        ledger.append("bob".into(), "bToken".into(), amount(50));

        let resolver = Resolver::new(vec![ConversionStep::fixed(
            "bToken".into(),
            "uluna".into(),
            rate("1.5"),
        )])
        .unwrap();
        let (ledger, report) = resolver.run_pipeline(ledger).unwrap();

        assert_eq!(balances(&ledger, "alice"), vec![(Denom::from("uluna"), amount(150))]);
        assert_eq!(balances(&ledger, "bob"), vec![(Denom::from("uluna"), amount(75))]);
        assert_eq!(report.converted_entries(), 2);
        assert_eq!(report.steps[0].truncation_loss(), amount(0));
    }

    #[test]
    fn steps_are_ordered_by_dependency() {
        // third order -> second order -> first order -> canonical, configured backwards
        let resolver = Resolver::new(vec![
            ConversionStep::fixed("stluna".into(), "uluna".into(), rate("1.1")),
            ConversionStep::fixed("vault".into(), "lp".into(), rate("2")),
            ConversionStep::fixed("lp".into(), "stluna".into(), rate("3")),
        ])
        .unwrap();
        let order: Vec<_> = resolver
            .steps()
            .iter()
            .map(|step| step.source.as_str().to_string())
            .collect();
        assert_eq!(order, vec!["vault", "lp", "stluna"]);

        let mut ledger = Ledger::new();
        ledger.append("alice".into(), "vault".into(), amount(10));
        ledger.append("alice".into(), "lp".into(), amount(1));
        let (ledger, _) = resolver.run_pipeline(ledger).unwrap();
        // (10*2 + 1)*3 = 63 stluna, 69.3 uluna rounds down per entry: 66 + 3 = 69
        assert_eq!(ledger.sum_by_denom(&"uluna".into()), amount(69));
        assert_eq!(ledger.denoms(), vec![Denom::from("uluna")]);
    }

    #[test]
    fn rejects_bad_graphs() {
        let cycle = Resolver::new(vec![
            ConversionStep::fixed("a".into(), "b".into(), rate("1")),
            ConversionStep::fixed("b".into(), "a".into(), rate("1")),
        ]);
        assert_eq!(
            cycle.unwrap_err(),
            ConfigError::Cycle {
                denoms: vec!["a".into(), "b".into()]
            }
        );

        let duplicate = Resolver::new(vec![
            ConversionStep::fixed("a".into(), "b".into(), rate("1")),
            ConversionStep::fixed("a".into(), "c".into(), rate("1")),
        ]);
        assert!(matches!(
            duplicate.unwrap_err(),
            ConfigError::DuplicateSource { .. }
        ));

        let self_loop =
            Resolver::new(vec![ConversionStep::fixed("a".into(), "a".into(), rate("1"))]);
        assert!(matches!(
            self_loop.unwrap_err(),
            ConfigError::SelfConversion { .. }
        ));
    }

    #[test]
    fn empty_source_skips_rate_lookup() {
        let queried = Rc::new(Cell::new(false));
        let flag = queried.clone();
        let resolver = Resolver::new(vec![ConversionStep::new(
            "ubluna".into(),
            "uluna".into(),
            move || -> Result<ExchangeRate, QueryError> {
                flag.set(true);
                Err(QueryError::new("hub", "unreachable"))
            },
        )])
        .unwrap();

        let mut ledger = Ledger::new();
        ledger.append("alice".into(), "uusd".into(), amount(5));
        ledger.append("bob".into(), "ubluna".into(), amount(0));
        let (resolved, report) = resolver.run_pipeline(ledger).unwrap();

        assert!(!queried.get());
        assert_eq!(report.steps[0].rate, None);
        assert_eq!(balances(&resolved, "bob"), vec![(Denom::from("uluna"), amount(0))]);
        assert_eq!(balances(&resolved, "alice"), vec![(Denom::from("uusd"), amount(5))]);
    }

    #[test]
    fn failed_or_zero_rate_is_fatal() {
        let mut ledger = Ledger::new();
        ledger.append("alice".into(), "ubluna".into(), amount(5));

        let failing = Resolver::new(vec![ConversionStep::new(
            "ubluna".into(),
            "uluna".into(),
            || -> Result<ExchangeRate, QueryError> { Err(QueryError::new("hub", "timeout")) },
        )])
        .unwrap();
        assert!(matches!(
            failing.run_pipeline(ledger.clone()),
            Err(SnapshotError::Query(_))
        ));

        let zero = Resolver::new(vec![ConversionStep::fixed(
            "ubluna".into(),
            "uluna".into(),
            rate("0"),
        )])
        .unwrap();
        assert!(matches!(
            zero.run_pipeline(ledger),
            Err(SnapshotError::ZeroRate { .. })
        ));
    }

    #[test]
    fn idempotent_at_fixed_point() {
        let resolver = Resolver::new(vec![ConversionStep::fixed(
            "ubluna".into(),
            "uluna".into(),
            rate("1.0371"),
        )])
        .unwrap();
        let mut ledger = Ledger::new();
        ledger.append("alice".into(), "ubluna".into(), amount(999_999));
        ledger.append("alice".into(), "uusd".into(), amount(3));

        let (once, _) = resolver.run_pipeline(ledger).unwrap();
        let (twice, report) = resolver.run_pipeline(once.clone()).unwrap();
        assert_eq!(once, twice);
        assert_eq!(report.converted_entries(), 0);
    }

    #[test]
    fn conversion_never_over_credits() {
        let step_rate = rate("0.999999");
        let resolver = Resolver::new(vec![ConversionStep::fixed(
            "ustluna".into(),
            "uluna".into(),
            step_rate.clone(),
        )])
        .unwrap();
        let mut ledger = Ledger::new();
        let mut source_total = amount(0);
        for (index, value) in [7u64, 13, 1_000_001, 3, 99].into_iter().enumerate() {
            ledger.append(format!("holder{index}").into(), "ustluna".into(), amount(value));
            source_total += value;
        }

        let (resolved, report) = resolver.run_pipeline(ledger).unwrap();
        let added = resolved.sum_by_denom(&"uluna".into());
        assert!(added <= step_rate.apply(&source_total));
        assert_eq!(report.steps[0].source_removed, source_total);
        assert_eq!(
            report.steps[0].truncation_loss(),
            step_rate.apply(&source_total) - added
        );
    }

    #[test]
    fn pass_callback_can_abort() {
        let resolver = Resolver::new(vec![ConversionStep::fixed(
            "ubluna".into(),
            "uluna".into(),
            rate("1"),
        )])
        .unwrap();
        let mut ledger = Ledger::new();
        ledger.append("alice".into(), "ubluna".into(), amount(1));

        let result = resolver.run_pipeline_with(ledger, |pass, outcome, _| {
            assert_eq!(pass, 0);
            Err(SnapshotError::Worker(format!("stop after {}", outcome.source)))
        });
        assert!(result.is_err());
    }

    #[test]
    fn query_rate_reads_nested_field() {
        let mut state = FrozenState::new(1);
        state.insert_query(
            "hub",
            json!({"state": {}}),
            json!({"state": {"exchange_rate": "1.02", "total": 5}}),
        );
        let state = Arc::new(state);

        let lookup = QueryRate::new(state.clone(), "hub", json!({"state": {}}), "state.exchange_rate");
        assert_eq!(lookup.exchange_rate().unwrap(), rate("1.02"));

        let number = QueryRate::new(state.clone(), "hub", json!({"state": {}}), "state.total");
        assert_eq!(number.exchange_rate().unwrap(), rate("5"));

        let missing = QueryRate::new(state, "hub", json!({"state": {}}), "state.rate");
        assert!(missing.exchange_rate().is_err());
    }

    #[test]
    fn numeric_rates_in_exponent_form() {
        assert_eq!(plain_decimal("1e-7"), "0.0000001");
        assert_eq!(plain_decimal("1.5E3"), "1500");
        assert_eq!(plain_decimal("2.5e-3"), "0.0025");
        assert_eq!(plain_decimal("1.25e1"), "12.5");
        assert_eq!(plain_decimal("-1e-2"), "-0.01");
        assert_eq!(plain_decimal("1.02"), "1.02");

        let mut state = FrozenState::new(1);
        state.insert_query("hub", json!({"state": {}}), json!({"rate": 1e-7, "big": 1.5e20}));
        let state = Arc::new(state);
        let small = QueryRate::new(state.clone(), "hub", json!({"state": {}}), "rate");
        assert_eq!(small.exchange_rate().unwrap(), rate("0.0000001"));
        let big = QueryRate::new(state, "hub", json!({"state": {}}), "big");
        assert_eq!(big.exchange_rate().unwrap(), rate("150000000000000000000"));
    }
}
