use super::datum::Datum;
use super::row::Row;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Dotted column reference. The first segment names a column, the rest walk
/// into object values, which is how joined child rows are addressed
/// (`comments.author`).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Path(pub Vec<SmolStr>);

impl Path {
    pub fn new(s: &str) -> Self {
        if s.is_empty() {
            Path(vec![])
        } else {
            Path(s.split('.').map(SmolStr::new).collect())
        }
    }

    pub fn as_str(&self) -> String {
        self.0
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(".")
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> &[SmolStr] {
        &self.0
    }

    /// Final segment, used as the output column name of group keys.
    pub fn last(&self) -> Option<&SmolStr> {
        self.0.last()
    }

    /// Resolve against a row. Missing columns resolve to `None`.
    #[inline]
    pub fn resolve<'a>(&self, row: &'a Row) -> Option<&'a Datum> {
        let (first, rest) = self.0.split_first()?;
        let mut current = row.get(first)?;
        for part in rest {
            match current {
                Datum::Object(map) => current = map.get(part)?,
                _ => return None,
            }
        }
        Some(current)
    }
}

impl Serialize for Path {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.as_str())
    }
}

impl<'de> Deserialize<'de> for Path {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        Ok(Path::new(&s))
    }
}
