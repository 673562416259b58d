//! Read-only access to the frozen chain state the extractors and resolver
//! consume. The engine only depends on the traits; [`FrozenState`] is a
//! file-backed snapshot of one height.

use crate::amount::{amount_str, Amount};
use crate::error::QueryError;
use crate::ledger::{Account, Denom};
use anyhow::Context;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

pub type StorageIter<'a> = Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a>;

pub trait ContractStore {
    /// Every (key, value) stored under `prefix`, in storage order. The
    /// iterator is lazy, consumers may stop early.
    fn range_prefix<'a>(
        &'a self,
        contract: &str,
        prefix: &'a [u8],
    ) -> Result<StorageIter<'a>, QueryError>;
}

pub trait ContractQuerier {
    fn query_contract(&self, contract: &str, msg: &Value) -> Result<Value, QueryError>;
}

pub trait NativeBalances {
    fn native_balance(&self, account: &Account, denom: &Denom) -> Result<Amount, QueryError>;
}

#[derive(Debug, Deserialize)]
struct RecordedQuery {
    contract: String,
    msg: Value,
    response: Value,
}

#[derive(Debug, Default, Deserialize)]
struct RawFrozenState {
    height: u64,
    #[serde(default)]
    storage: HashMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    queries: Vec<RecordedQuery>,
    #[serde(default)]
    native_balances: HashMap<Account, HashMap<Denom, AmountField>>,
}

#[derive(Debug, Deserialize)]
#[serde(transparent)]
struct AmountField(#[serde(with = "amount_str")] Amount);

/// Contract storage, recorded query responses and native balances observed
/// at a single height.
#[derive(Debug, Default)]
pub struct FrozenState {
    height: u64,
    storage: HashMap<String, BTreeMap<Vec<u8>, Vec<u8>>>,
    queries: HashMap<String, Vec<(Value, Value)>>,
    native_balances: HashMap<Account, HashMap<Denom, Amount>>,
}

impl FrozenState {
    pub fn new(height: u64) -> Self {
        Self {
            height,
            ..Default::default()
        }
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    /// Loads a snapshot file. Storage keys and values are hex encoded.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Cannot open frozen state {}", path.display()))?;
        let raw: RawFrozenState = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Cannot parse frozen state {}", path.display()))?;

        let mut state = Self::new(raw.height);
        for (contract, entries) in raw.storage {
            for (key, value) in entries {
                let key = hex::decode(&key)
                    .with_context(|| format!("bad storage key {key:?} in {contract}"))?;
                let value = hex::decode(&value)
                    .with_context(|| format!("bad storage value for {contract}"))?;
                state.insert_storage(&contract, key, value);
            }
        }
        for query in raw.queries {
            state.insert_query(&query.contract, query.msg, query.response);
        }
        for (account, balances) in raw.native_balances {
            for (denom, AmountField(amount)) in balances {
                state.insert_native_balance(account.clone(), denom, amount);
            }
        }
        tracing::info!(
            "Loaded frozen state at height {} ({} contracts, {} recorded queries)",
            state.height,
            state.storage.len(),
            state.queries.values().map(Vec::len).sum::<usize>()
        );
        Ok(state)
    }

    pub fn insert_storage(&mut self, contract: &str, key: Vec<u8>, value: Vec<u8>) {
        self.storage
            .entry(contract.to_string())
            .or_default()
            .insert(key, value);
    }

    pub fn insert_query(&mut self, contract: &str, msg: Value, response: Value) {
        self.queries
            .entry(contract.to_string())
            .or_default()
            .push((msg, response));
    }

    pub fn insert_native_balance(&mut self, account: Account, denom: Denom, amount: Amount) {
        self.native_balances
            .entry(account)
            .or_default()
            .insert(denom, amount);
    }
}

impl ContractStore for FrozenState {
    fn range_prefix<'a>(
        &'a self,
        contract: &str,
        prefix: &'a [u8],
    ) -> Result<StorageIter<'a>, QueryError> {
        let storage = self
            .storage
            .get(contract)
            .ok_or_else(|| QueryError::new(contract, "no storage recorded for contract"))?;
        let iter = storage
            .range(prefix.to_vec()..)
            .take_while(move |(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()));
        Ok(Box::new(iter))
    }
}

impl ContractQuerier for FrozenState {
    fn query_contract(&self, contract: &str, msg: &Value) -> Result<Value, QueryError> {
        self.queries
            .get(contract)
            .and_then(|recorded| {
                recorded
                    .iter()
                    .find(|(recorded_msg, _)| recorded_msg == msg)
                    .map(|(_, response)| response.clone())
            })
            .ok_or_else(|| QueryError::new(contract, format!("no recorded response for {msg}")))
    }
}

impl NativeBalances for FrozenState {
    fn native_balance(&self, account: &Account, denom: &Denom) -> Result<Amount, QueryError> {
        self.native_balances
            .get(account)
            .and_then(|balances| balances.get(denom))
            .cloned()
            .ok_or_else(|| {
                QueryError::new(account.as_str(), format!("no {denom} balance recorded"))
            })
    }
}

#[cfg(test)]
mod tests {
    use crate::chain::{ContractQuerier, ContractStore, FrozenState, NativeBalances};
    use num_bigint::BigUint;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn range_prefix_in_storage_order() {
        let mut state = FrozenState::new(10);
        state.insert_storage("token", b"balancebob".to_vec(), b"2".to_vec());
        state.insert_storage("token", b"balancealice".to_vec(), b"1".to_vec());
        state.insert_storage("token", b"config".to_vec(), b"{}".to_vec());
        state.insert_storage("token", b"allowance".to_vec(), b"0".to_vec());

        let keys: Vec<_> = state
            .range_prefix("token", b"balance")
            .unwrap()
            .map(|(key, _)| key)
            .collect();
        assert_eq!(keys, vec![b"balancealice".to_vec(), b"balancebob".to_vec()]);

        let first = state.range_prefix("token", b"").unwrap().next().unwrap();
        assert_eq!(first.0, b"allowance".to_vec());
        assert!(state.range_prefix("missing", b"").is_err());
    }

    #[test]
    fn recorded_queries_match_payload() {
        let mut state = FrozenState::new(10);
        state.insert_query("hub", json!({"state": {}}), json!({"exchange_rate": "1.5"}));

        let response = state.query_contract("hub", &json!({"state": {}})).unwrap();
        assert_eq!(response["exchange_rate"], "1.5");
        assert!(state.query_contract("hub", &json!({"config": {}})).is_err());
        assert!(state.query_contract("other", &json!({"state": {}})).is_err());
    }

    #[test]
    fn load_from_file() {
        let path = std::env::temp_dir().join(format!("frozen-{}.json", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        let mut storage = serde_json::Map::new();
        storage.insert(
            hex::encode("balancealice"),
            json!(hex::encode("\"10\"")),
        );
        let body = json!({
            "height": 7544910,
            "storage": {"token": storage},
            "queries": [{"contract": "hub", "msg": {"state": {}}, "response": {"exchange_rate": "1.1"}}],
            "native_balances": {"hub": {"uluna": "99"}}
        });
        write!(file, "{body}").unwrap();
        drop(file);

        let state = FrozenState::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(state.height(), 7544910);
        assert_eq!(state.range_prefix("token", b"balance").unwrap().count(), 1);
        assert_eq!(
            state.native_balance(&"hub".into(), &"uluna".into()).unwrap(),
            BigUint::from(99u32)
        );
        assert!(state.native_balance(&"hub".into(), &"uusd".into()).is_err());
    }
}
