use super::datum::Datum;
use crate::error::KeyError;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use smallvec::SmallVec;
use smol_str::SmolStr;
use std::collections::BTreeMap;
use std::fmt;

/// Column name to value. Ordered so that equal rows serialize identically.
pub type Row = BTreeMap<SmolStr, Datum>;

pub fn row_from_json(value: Value) -> Row {
    match Datum::from(value) {
        Datum::Object(map) => map,
        _ => Row::new(),
    }
}

pub fn row_to_json(row: &Row) -> Value {
    Value::Object(
        row.iter()
            .map(|(k, v)| (k.to_string(), Value::from(v.clone())))
            .collect(),
    )
}

/// Primary key values of a row, in primary-key column order.
///
/// Most tables have one or two key columns so the pairs stay inline.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowKey(pub SmallVec<[(SmolStr, Datum); 2]>);

impl RowKey {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extract the key of `row` for the given primary key columns.
    pub fn from_row(row: &Row, primary_key: &[SmolStr]) -> Result<Self, KeyError> {
        let mut key = RowKey::new();
        for col in primary_key {
            match row.get(col) {
                None => return Err(KeyError::Missing(col.clone())),
                Some(Datum::Null) => return Err(KeyError::Null(col.clone())),
                Some(v) => key.push(col.clone(), v.clone()),
            }
        }
        Ok(key)
    }

    pub fn push(&mut self, column: impl Into<SmolStr>, value: Datum) {
        self.0.push((column.into(), value));
    }

    /// Append `other`'s columns prefixed with `alias.`.
    pub fn extend_qualified(&mut self, alias: &str, other: &RowKey) {
        for (col, value) in &other.0 {
            self.0
                .push((SmolStr::from(format!("{alias}.{col}")), value.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_json(&self) -> Value {
        Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.to_string(), Value::from(v.clone())))
                .collect(),
        )
    }
}

impl Serialize for RowKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

struct RowKeyVisitor;

impl<'de> Visitor<'de> for RowKeyVisitor {
    type Value = RowKey;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map of primary key columns")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<RowKey, A::Error> {
        let mut key = RowKey::new();
        while let Some((k, v)) = map.next_entry::<SmolStr, Datum>()? {
            key.push(k, v);
        }
        Ok(key)
    }
}

impl<'de> Deserialize<'de> for RowKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(RowKeyVisitor)
    }
}

/// Identity of an output row: the relation it belongs to plus its key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowId {
    pub table: SmolStr,
    pub key: RowKey,
}

impl RowId {
    pub fn new(table: impl Into<SmolStr>, key: RowKey) -> Self {
        Self {
            table: table.into(),
            key,
        }
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table, self.key.to_json())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_row_key_from_row() {
        let row = row_from_json(json!({"org": "a", "id": 7, "title": "x"}));
        let pk = [SmolStr::new("org"), SmolStr::new("id")];
        let key = RowKey::from_row(&row, &pk).unwrap();
        assert_eq!(key.to_json(), json!({"org": "a", "id": 7}));
        assert_eq!(key.0[0].0, "org");
    }

    #[test]
    fn test_row_key_rejects_missing_or_null() {
        let pk = [SmolStr::new("id")];
        let missing = row_from_json(json!({"title": "x"}));
        assert_eq!(
            RowKey::from_row(&missing, &pk),
            Err(KeyError::Missing("id".into()))
        );
        let null = row_from_json(json!({"id": null}));
        assert_eq!(RowKey::from_row(&null, &pk), Err(KeyError::Null("id".into())));
    }

    #[test]
    fn test_row_key_keeps_column_order_through_serde() {
        let mut key = RowKey::new();
        key.push("z", Datum::from(1i64));
        key.push("a", Datum::from("k"));
        let bytes = serde_json::to_vec(&key).unwrap();
        let restored: RowKey = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(restored, key);
    }

    #[test]
    fn test_qualified_key() {
        let mut left = RowKey::new();
        left.push("id", Datum::from(1i64));
        let mut right = RowKey::new();
        right.push("id", Datum::from(9i64));
        left.extend_qualified("comments", &right);
        assert_eq!(left.to_json(), json!({"id": 1, "comments.id": 9}));
    }
}
