use crate::amount::Amount;
use crate::ledger::{Account, Denom, Ledger};
use std::collections::BTreeMap;

/// Combines independent extractor ledgers.
///
/// Every (account, denom) pair present in any input becomes exactly one
/// output entry carrying the sum of all its contributions. Output entries are
/// ordered by denom within each account, so the result does not depend on
/// the order of `ledgers`.
pub fn merge<I>(ledgers: I) -> Ledger
where
    I: IntoIterator<Item = Ledger>,
{
    let mut consolidated = BTreeMap::<Account, BTreeMap<Denom, Amount>>::new();
    let mut inputs = 0usize;
    for ledger in ledgers {
        inputs += 1;
        for (account, contributions) in ledger.into_inner() {
            let account_balances = consolidated.entry(account).or_default();
            for (denom, amount) in contributions {
                *account_balances.entry(denom).or_default() += amount;
            }
        }
    }

    let mut merged = Ledger::new();
    for (account, balances) in consolidated {
        for (denom, amount) in balances {
            merged.append(account.clone(), denom, amount);
        }
    }
    tracing::debug!(
        "Merged {} ledgers into {} accounts",
        inputs,
        merged.len()
    );
    merged
}
