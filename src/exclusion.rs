use crate::ledger::{Account, Denom, Ledger};
use itertools::Itertools;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Addresses whose balance of one denomination is already attributed to end
/// owners elsewhere (contract-held funds) and must not be counted again.
///
/// Keyed by the pre-resolution denomination, so it has to be applied before
/// any conversion step rewrites the ledger.
#[derive(Clone, Debug, Default)]
pub struct ExclusionRegistry {
    excluded: HashMap<Denom, HashSet<Account>>,
}

impl ExclusionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, denom: Denom, account: Account) {
        self.excluded.entry(denom).or_default().insert(account);
    }

    pub fn register_all(&mut self, denom: Denom, accounts: impl IntoIterator<Item = Account>) {
        let set = self.excluded.entry(denom).or_default();
        set.extend(accounts);
    }

    pub fn is_excluded(&self, denom: &Denom, account: &Account) -> bool {
        self.excluded
            .get(denom)
            .map(|accounts| accounts.contains(account))
            .unwrap_or(false)
    }

    pub fn excluded_for(&self, denom: &Denom) -> Option<&HashSet<Account>> {
        self.excluded.get(denom)
    }

    pub fn denoms(&self) -> impl Iterator<Item = &Denom> {
        self.excluded.keys()
    }

    /// Total (denom, account) registrations.
    pub fn len(&self) -> usize {
        self.excluded.values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every `(account, denom)` entry registered here. Other
    /// denominations held by the same account stay. Returns the number of
    /// removed entries.
    pub fn apply(&self, ledger: &mut Ledger) -> usize {
        if self.is_empty() {
            return 0;
        }
        let removed = ledger.retain(|account, denom, _| !self.is_excluded(denom, account));
        tracing::debug!(
            "Exclusions removed {} entries ({} registrations)",
            removed,
            self.len()
        );
        removed
    }

    pub fn dump(&self, path: &Path) -> anyhow::Result<()> {
        let mut file = File::create(path)?;
        file.write_all(b"denom,account\n")?;
        for (denom, accounts) in self.excluded.iter().sorted_by(|a, b| a.0.cmp(b.0)) {
            for account in accounts.iter().sorted() {
                file.write_all(format!("{denom},{account}\n").as_bytes())?;
            }
        }
        Ok(())
    }
}
