use serde::de::{MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};
use smol_str::SmolStr;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A single column value.
///
/// Unlike `serde_json::Value` this is totally ordered and hashable, so it can
/// be used as a join or group key. Values of different types order by type
/// rank: null < bool < number < string < array < object.
#[derive(Debug, Clone, Default)]
pub enum Datum {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    Str(SmolStr),
    Array(Vec<Datum>),
    Object(BTreeMap<SmolStr, Datum>),
}

impl Datum {
    /// Get value as string reference
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Datum::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Datum::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Datum::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<SmolStr, Datum>> {
        match self {
            Datum::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Datum>> {
        match self {
            Datum::Array(arr) => Some(arr),
            _ => None,
        }
    }

    /// Get nested value by key (for objects)
    pub fn get(&self, key: &str) -> Option<&Datum> {
        self.as_object()?.get(key)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    fn type_rank(&self) -> u8 {
        match self {
            Datum::Null => 0,
            Datum::Bool(_) => 1,
            Datum::Number(_) => 2,
            Datum::Str(_) => 3,
            Datum::Array(_) => 4,
            Datum::Object(_) => 5,
        }
    }

    /// Name of the value's type as used in table schemas.
    pub fn type_name(&self) -> &'static str {
        match self {
            Datum::Null => "null",
            Datum::Bool(_) => "boolean",
            Datum::Number(_) => "number",
            Datum::Str(_) => "string",
            Datum::Array(_) => "array",
            Datum::Object(_) => "object",
        }
    }

    pub fn to_json(&self) -> Value {
        Value::from(self.clone())
    }
}

impl PartialEq for Datum {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Datum {}

impl PartialOrd for Datum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Datum {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Datum::Null, Datum::Null) => Ordering::Equal,
            (Datum::Bool(a), Datum::Bool(b)) => a.cmp(b),
            (Datum::Number(a), Datum::Number(b)) => a.total_cmp(b),
            (Datum::Str(a), Datum::Str(b)) => a.cmp(b),
            (Datum::Array(a), Datum::Array(b)) => a.cmp(b),
            (Datum::Object(a), Datum::Object(b)) => a.cmp(b),
            (a, b) => a.type_rank().cmp(&b.type_rank()),
        }
    }
}

// Must agree with `Ord`: `total_cmp` equality is bit equality.
impl Hash for Datum {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u8(self.type_rank());
        match self {
            Datum::Null => {}
            Datum::Bool(b) => b.hash(state),
            Datum::Number(n) => state.write_u64(n.to_bits()),
            Datum::Str(s) => s.hash(state),
            Datum::Array(arr) => arr.hash(state),
            Datum::Object(obj) => obj.hash(state),
        }
    }
}

impl From<Value> for Datum {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => Datum::Null,
            Value::Bool(b) => Datum::Bool(b),
            Value::Number(n) => Datum::Number(n.as_f64().unwrap_or(0.0)),
            Value::String(s) => Datum::Str(SmolStr::from(s)),
            Value::Array(arr) => Datum::Array(arr.into_iter().map(Datum::from).collect()),
            Value::Object(obj) => Datum::Object(
                obj.into_iter()
                    .map(|(k, v)| (SmolStr::from(k), Datum::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<Datum> for Value {
    fn from(val: Datum) -> Self {
        match val {
            Datum::Null => Value::Null,
            Datum::Bool(b) => Value::Bool(b),
            Datum::Number(n) => match integral(n) {
                Some(i) => json!(i),
                None => json!(n),
            },
            Datum::Str(s) => Value::String(s.to_string()),
            Datum::Array(arr) => Value::Array(arr.into_iter().map(Value::from).collect()),
            Datum::Object(obj) => Value::Object(
                obj.into_iter()
                    .map(|(k, v)| (k.to_string(), v.into()))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Datum {
    fn from(s: &str) -> Self {
        Datum::Str(SmolStr::new(s))
    }
}

impl From<f64> for Datum {
    fn from(n: f64) -> Self {
        Datum::Number(n)
    }
}

impl From<i64> for Datum {
    fn from(n: i64) -> Self {
        Datum::Number(n as f64)
    }
}

impl From<bool> for Datum {
    fn from(b: bool) -> Self {
        Datum::Bool(b)
    }
}

/// Integers within the f64 mantissa are written without a fraction so that
/// `{"id": 1}` survives a trip through the engine unchanged.
fn integral(n: f64) -> Option<i64> {
    const MAX_SAFE: f64 = 9_007_199_254_740_991.0;
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE {
        Some(n as i64)
    } else {
        None
    }
}

impl Serialize for Datum {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Datum::Null => serializer.serialize_unit(),
            Datum::Bool(b) => serializer.serialize_bool(*b),
            Datum::Number(n) => match integral(*n) {
                Some(i) => serializer.serialize_i64(i),
                None => serializer.serialize_f64(*n),
            },
            Datum::Str(s) => serializer.serialize_str(s),
            Datum::Array(arr) => arr.serialize(serializer),
            Datum::Object(obj) => obj.serialize(serializer),
        }
    }
}

struct DatumVisitor;

impl<'de> Visitor<'de> for DatumVisitor {
    type Value = Datum;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a JSON-like value")
    }

    fn visit_unit<E>(self) -> Result<Datum, E> {
        Ok(Datum::Null)
    }

    fn visit_none<E>(self) -> Result<Datum, E> {
        Ok(Datum::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Datum, D::Error> {
        Datum::deserialize(d)
    }

    fn visit_bool<E>(self, b: bool) -> Result<Datum, E> {
        Ok(Datum::Bool(b))
    }

    fn visit_i64<E>(self, n: i64) -> Result<Datum, E> {
        Ok(Datum::Number(n as f64))
    }

    fn visit_u64<E>(self, n: u64) -> Result<Datum, E> {
        Ok(Datum::Number(n as f64))
    }

    fn visit_f64<E>(self, n: f64) -> Result<Datum, E> {
        Ok(Datum::Number(n))
    }

    fn visit_str<E>(self, s: &str) -> Result<Datum, E> {
        Ok(Datum::Str(SmolStr::new(s)))
    }

    fn visit_string<E>(self, s: String) -> Result<Datum, E> {
        Ok(Datum::Str(SmolStr::from(s)))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Datum, A::Error> {
        let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(v) = seq.next_element()? {
            out.push(v);
        }
        Ok(Datum::Array(out))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Datum, A::Error> {
        let mut out = BTreeMap::new();
        while let Some((k, v)) = map.next_entry::<SmolStr, Datum>()? {
            out.insert(k, v);
        }
        Ok(Datum::Object(out))
    }
}

impl<'de> Deserialize<'de> for Datum {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(DatumVisitor)
    }
}
