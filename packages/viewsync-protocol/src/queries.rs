use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entry of a desired- or got-queries patch.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum QueriesPatchOp {
    Put { hash: String, ast: Value },
    Del { hash: String },
    /// Only valid upstream: drop every desired query of the client.
    Clear,
}

impl QueriesPatchOp {
    pub fn hash(&self) -> Option<&str> {
        match self {
            QueriesPatchOp::Put { hash, .. } | QueriesPatchOp::Del { hash } => Some(hash),
            QueriesPatchOp::Clear => None,
        }
    }
}

/// Content hash of a query AST.
///
/// `serde_json::Map` keeps keys sorted, so the serialized form is canonical
/// and equal ASTs always hash the same.
pub fn query_hash(ast: &Value) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(ast.to_string().as_bytes());
    hasher.finalize().to_hex()[..16].to_string()
}
