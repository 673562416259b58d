use crate::amount::Amount;
use crate::ledger::{Account, Denom, Ledger};
use num_traits::Zero;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// One reduced row per (account, denom), sorted, zero balances dropped.
pub fn reduced_rows(ledger: &Ledger) -> BTreeMap<(Account, Denom), Amount> {
    let mut rows = BTreeMap::<(Account, Denom), Amount>::new();
    for (account, denom, amount) in ledger.entries() {
        *rows.entry((account.clone(), denom.clone())).or_default() += amount;
    }
    rows.retain(|_, amount| !amount.is_zero());
    rows
}

pub fn write_ledger<W: Write>(ledger: &Ledger, mut out: W) -> anyhow::Result<usize> {
    out.write_all(b"account,denom,amount\n")?;
    let rows = reduced_rows(ledger);
    for ((account, denom), amount) in rows.iter() {
        out.write_all(format!("{account},{denom},{amount}\n").as_bytes())?;
    }
    Ok(rows.len())
}

pub fn dump_ledger(ledger: &Ledger, path: &Path) -> anyhow::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    let rows = write_ledger(ledger, &mut out)?;
    out.flush()?;
    tracing::info!("Wrote {} rows to {}", rows, path.display());
    Ok(())
}
