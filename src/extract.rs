use crate::amount::{amount_str, parse_amount, Amount};
use crate::chain::{ContractQuerier, ContractStore};
use crate::error::{ConfigError, QueryError, Result};
use crate::ledger::{Account, Denom, Ledger, LedgerEntry};
use crate::pool::{collect_ledger, run_bounded};
use crate::probe::{try_parse_as, try_parse_slice};
use num_traits::Zero;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// Storage prefix of a namespaced map: big endian `u16` length of the
/// namespace followed by the namespace itself.
pub fn namespace_prefix(namespace: &str) -> std::result::Result<Vec<u8>, ConfigError> {
    let len = u16::try_from(namespace.len())
        .map_err(|_| ConfigError::NamespaceTooLong { len: namespace.len() })?;
    let mut prefix = Vec::with_capacity(namespace.len() + 2);
    prefix.extend_from_slice(&len.to_be_bytes());
    prefix.extend_from_slice(namespace.as_bytes());
    Ok(prefix)
}

/// Raw ledger of a token contract: every `prefix ++ account` key holding a
/// json amount string becomes one entry denominated in the contract address.
/// Keys or values of another shape are skipped, as are zero balances.
pub fn token_holders<S: ContractStore + ?Sized>(
    store: &S,
    contract: &str,
    prefix: &[u8],
) -> std::result::Result<Ledger, QueryError> {
    let denom = Denom::from(contract);
    let mut ledger = Ledger::new();
    let mut skipped = 0usize;
    for (key, value) in store.range_prefix(contract, prefix)? {
        let account = match std::str::from_utf8(&key[prefix.len()..]) {
            Ok(account) if !account.is_empty() => Account::from(account),
            _ => {
                skipped += 1;
                continue;
            }
        };
        let amount = match try_parse_slice::<String>(&value).and_then(|raw| parse_amount(&raw)) {
            Some(amount) => amount,
            None => {
                skipped += 1;
                continue;
            }
        };
        if amount.is_zero() {
            continue;
        }
        ledger.append(account, denom.clone(), amount);
    }
    tracing::debug!(
        "{}: {} holders, {} entries skipped",
        contract,
        ledger.len(),
        skipped
    );
    Ok(ledger)
}

/// Queries `contract` and checks whether the response matches `T`.
///
/// `Err` only for a failed query; a response of another shape is `Ok(None)`.
pub fn sniff_contract<T, Q>(
    querier: &Q,
    contract: &str,
    msg: &Value,
) -> std::result::Result<Option<T>, QueryError>
where
    T: DeserializeOwned,
    Q: ContractQuerier + ?Sized,
{
    let response = querier.query_contract(contract, msg)?;
    Ok(try_parse_as(&response))
}

#[derive(Debug, Deserialize)]
struct PositionResponse {
    owner: Account,
    #[serde(with = "amount_str")]
    amount: Amount,
}

/// Enumerates positions of a contract that only exposes them one by one
/// (`{"position": {"id": ..}}`), fanning the queries out over `workers`.
/// Any failed or malformed position fails the whole extraction.
pub async fn positions<Q>(
    querier: Arc<Q>,
    contract: &str,
    denom: Denom,
    ids: Vec<String>,
    workers: usize,
) -> Result<Ledger>
where
    Q: ContractQuerier + Send + Sync + 'static,
{
    let contract = Arc::new(contract.to_string());
    let outcomes = run_bounded(ids, workers, move |id| {
        let querier = querier.clone();
        let contract = contract.clone();
        let denom = denom.clone();
        async move {
            let msg = json!({"position": {"id": id}});
            let position: PositionResponse = sniff_contract(querier.as_ref(), &contract, &msg)?
                .ok_or_else(|| {
                    QueryError::new(contract.as_str(), format!("position {id} has unexpected shape"))
                })?;
            Ok::<_, QueryError>(vec![LedgerEntry {
                account: position.owner,
                denom,
                amount: position.amount,
            }])
        }
    })
    .await?;
    collect_ledger(outcomes)
}
