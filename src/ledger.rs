use crate::amount::{amount_str, Amount};
use anyhow::Context;
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

macro_rules! opaque_id {
    ($name:ident) => {
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

// compared by exact string equality, extractors pass canonical encodings
opaque_id!(Account);
opaque_id!(Denom);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    #[serde(rename = "acct")]
    pub account: Account,
    pub denom: Denom,
    #[serde(rename = "amt", with = "amount_str")]
    pub amount: Amount,
}

/// Account -> every (denom, amount) contribution recorded for it.
///
/// The same (account, denom) pair may appear several times: `append` never
/// looks up an existing entry, so every read path reduces over the full
/// sequence. Only [`crate::merge::merge`] collapses pairs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Ledger {
    balances: HashMap<Account, Vec<(Denom, Amount)>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = LedgerEntry>) -> Self {
        let mut ledger = Self::new();
        for entry in entries {
            ledger.append(entry.account, entry.denom, entry.amount);
        }
        ledger
    }

    pub fn append(&mut self, account: Account, denom: Denom, amount: Amount) {
        self.balances
            .entry(account)
            .or_default()
            .push((denom, amount));
    }

    pub fn sum_by_denom(&self, denom: &Denom) -> Amount {
        self.balances
            .values()
            .flatten()
            .filter(|(d, _)| d == denom)
            .fold(Amount::zero(), |acc, (_, amount)| acc + amount)
    }

    pub fn filter_by_denom(&self, denom: &Denom) -> HashMap<Account, Amount> {
        let mut projection = HashMap::<Account, Amount>::new();
        for (account, contributions) in self.balances.iter() {
            for (d, amount) in contributions.iter() {
                if d == denom {
                    *projection.entry(account.clone()).or_default() += amount;
                }
            }
        }
        projection
    }

    /// Per-denomination totals over the whole ledger.
    pub fn totals(&self) -> HashMap<Denom, Amount> {
        let mut totals = HashMap::<Denom, Amount>::new();
        for (denom, amount) in self.balances.values().flatten() {
            *totals.entry(denom.clone()).or_default() += amount;
        }
        totals
    }

    /// Accounts holding a non-zero reduced balance of `denom`.
    pub fn holder_count(&self, denom: &Denom) -> usize {
        self.filter_by_denom(denom)
            .values()
            .filter(|amount| !amount.is_zero())
            .count()
    }

    pub fn contains_denom(&self, denom: &Denom) -> bool {
        self.balances
            .values()
            .flatten()
            .any(|(d, _)| d == denom)
    }

    pub fn get(&self, account: &Account) -> Option<&[(Denom, Amount)]> {
        self.balances.get(account).map(Vec::as_slice)
    }

    pub fn accounts(&self) -> impl Iterator<Item = &Account> {
        self.balances.keys()
    }

    pub fn denoms(&self) -> Vec<Denom> {
        let mut denoms: Vec<Denom> = self
            .balances
            .values()
            .flatten()
            .map(|(denom, _)| denom.clone())
            .collect();
        denoms.sort();
        denoms.dedup();
        denoms
    }

    pub fn entries(&self) -> impl Iterator<Item = (&Account, &Denom, &Amount)> {
        self.balances.iter().flat_map(|(account, contributions)| {
            contributions
                .iter()
                .map(move |(denom, amount)| (account, denom, amount))
        })
    }

    /// Keeps the entries for which `keep` returns true, dropping accounts that
    /// end up with no entries. Returns how many entries were removed.
    pub fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&Account, &Denom, &Amount) -> bool,
    {
        let mut removed = 0;
        for (account, contributions) in self.balances.iter_mut() {
            let before = contributions.len();
            contributions.retain(|(denom, amount)| keep(account, denom, amount));
            removed += before - contributions.len();
        }
        self.balances.retain(|_, contributions| !contributions.is_empty());
        removed
    }

    /// Mutable access to every contribution, used to rewrite denominations
    /// in place.
    pub(crate) fn contributions_mut(
        &mut self,
    ) -> impl Iterator<Item = (&Account, &mut (Denom, Amount))> {
        self.balances.iter_mut().flat_map(|(account, contributions)| {
            contributions.iter_mut().map(move |entry| (account, entry))
        })
    }

    pub(crate) fn into_inner(self) -> HashMap<Account, Vec<(Denom, Amount)>> {
        self.balances
    }

    /// Number of accounts.
    pub fn len(&self) -> usize {
        self.balances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entry_count(&self) -> usize {
        self.balances.values().map(Vec::len).sum()
    }

    /// Reads one json encoded [`LedgerEntry`] per line; blank lines are skipped.
    pub fn read_json_lines(path: &Path) -> anyhow::Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Cannot open ledger file {}", path.display()))?;
        let mut ledger = Self::new();
        for (line_number, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: LedgerEntry = serde_json::from_str(&line).with_context(|| {
                format!("{}:{} is not a ledger entry", path.display(), line_number + 1)
            })?;
            ledger.append(entry.account, entry.denom, entry.amount);
        }
        tracing::debug!(
            "Read {} accounts from {}",
            ledger.len(),
            path.display()
        );
        Ok(ledger)
    }
}
