//! Heuristic schema sniffing. A value that does not deserialize into the
//! expected shape means "not this kind of contract", never an error.

use serde::de::DeserializeOwned;
use serde_json::Value;

pub fn try_parse_as<T: DeserializeOwned>(value: &Value) -> Option<T> {
    match T::deserialize(value) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            tracing::trace!(
                "value does not match {}: {}",
                std::any::type_name::<T>(),
                err
            );
            None
        }
    }
}

pub fn try_parse_slice<T: DeserializeOwned>(raw: &[u8]) -> Option<T> {
    serde_json::from_slice(raw).ok()
}
