use crate::engine::types::{Datum, Path, Row};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Predicate {
    Prefix { field: Path, prefix: String },
    Eq { field: Path, value: Datum },
    Neq { field: Path, value: Datum },
    Gt { field: Path, value: Datum },
    Gte { field: Path, value: Datum },
    Lt { field: Path, value: Datum },
    Lte { field: Path, value: Datum },
    In { field: Path, values: Vec<Datum> },
    #[serde(rename = "isNull")]
    IsNull { field: Path },
    And { predicates: Vec<Predicate> },
    Or { predicates: Vec<Predicate> },
    Not { predicate: Box<Predicate> },
}

/// Comparisons only hold between values of the same type, and a null or
/// missing operand never compares, mirroring SQL.
fn compare(actual: Option<&Datum>, target: &Datum) -> Option<Ordering> {
    let actual = actual?;
    if actual.is_null() || target.is_null() {
        return None;
    }
    if std::mem::discriminant(actual) != std::mem::discriminant(target) {
        return None;
    }
    Some(actual.cmp(target))
}

impl Predicate {
    pub fn eval(&self, row: &Row) -> bool {
        match self {
            Predicate::And { predicates } => predicates.iter().all(|p| p.eval(row)),
            Predicate::Or { predicates } => predicates.iter().any(|p| p.eval(row)),
            Predicate::Not { predicate } => !predicate.eval(row),
            Predicate::IsNull { field } => field.resolve(row).map_or(true, Datum::is_null),
            Predicate::Prefix { field, prefix } => matches!(
                field.resolve(row),
                Some(Datum::Str(s)) if s.starts_with(prefix.as_str())
            ),
            Predicate::In { field, values } => {
                let actual = field.resolve(row);
                values
                    .iter()
                    .any(|v| compare(actual, v) == Some(Ordering::Equal))
            }
            Predicate::Eq { field, value }
            | Predicate::Neq { field, value }
            | Predicate::Gt { field, value }
            | Predicate::Gte { field, value }
            | Predicate::Lt { field, value }
            | Predicate::Lte { field, value } => {
                let Some(ord) = compare(field.resolve(row), value) else {
                    return false;
                };
                match self {
                    Predicate::Eq { .. } => ord == Ordering::Equal,
                    Predicate::Neq { .. } => ord != Ordering::Equal,
                    Predicate::Gt { .. } => ord == Ordering::Greater,
                    Predicate::Gte { .. } => ord != Ordering::Less,
                    Predicate::Lt { .. } => ord == Ordering::Less,
                    Predicate::Lte { .. } => ord != Ordering::Greater,
                    _ => false,
                }
            }
        }
    }

    /// Disjunction of `predicates`, flattening nested `Or`s.
    pub fn any_of(predicates: impl IntoIterator<Item = Predicate>) -> Predicate {
        let mut flat = Vec::new();
        for p in predicates {
            match p {
                Predicate::Or { predicates } => flat.extend(predicates),
                other => flat.push(other),
            }
        }
        if flat.len() == 1 {
            flat.remove(0)
        } else {
            Predicate::Or { predicates: flat }
        }
    }
}
