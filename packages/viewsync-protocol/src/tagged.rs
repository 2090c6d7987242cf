//! Helpers for `[tag, body]` tuple encoding.

use serde::de::{DeserializeOwned, Error};
use serde_json::Value;

pub(crate) fn body<T: DeserializeOwned, E: Error>(tag: &str, value: Value) -> Result<T, E> {
    serde_json::from_value(value).map_err(|e| E::custom(format!("invalid {tag} body: {e}")))
}
