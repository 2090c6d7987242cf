use crate::queries::QueriesPatchOp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Range of client schema versions the server's loaded schema can serve.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SchemaVersions {
    pub min_supported_version: u32,
    pub max_supported_version: u32,
}

impl SchemaVersions {
    pub fn supports(&self, schema_version: u32) -> bool {
        (self.min_supported_version..=self.max_supported_version).contains(&schema_version)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PokeStartBody {
    #[serde(rename = "pokeID")]
    pub poke_id: String,
    pub base_cookie: Option<String>,
    pub cookie: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_versions: Option<SchemaVersions>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PokePartBody {
    #[serde(rename = "pokeID")]
    pub poke_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clients_patch: Option<Vec<ClientsPatchOp>>,
    /// Queries the server has materialized for the group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queries_patch: Option<Vec<QueriesPatchOp>>,
    /// Desired queries, keyed by client ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_queries_patches: Option<BTreeMap<String, Vec<QueriesPatchOp>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows_patch: Option<Vec<RowPatchOp>>,
    #[serde(
        default,
        rename = "lastMutationIDChanges",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_mutation_id_changes: Option<BTreeMap<String, u64>>,
}

impl PokePartBody {
    pub fn new(poke_id: impl Into<String>) -> Self {
        Self {
            poke_id: poke_id.into(),
            ..Default::default()
        }
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PokeEndBody {
    #[serde(rename = "pokeID")]
    pub poke_id: String,
    /// Only sent to clients speaking the revised cookie protocol.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub cancel: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ClientsPatchOp {
    Put {
        #[serde(rename = "clientID")]
        client_id: String,
    },
    Del {
        #[serde(rename = "clientID")]
        client_id: String,
    },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum RowPatchOp {
    Put {
        #[serde(rename = "tableName")]
        table_name: String,
        value: Value,
    },
    Del {
        #[serde(rename = "tableName")]
        table_name: String,
        /// Primary key columns of the deleted row.
        id: Value,
    },
}
