use crate::queries::QueriesPatchOp;
use crate::tagged::body;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// First message on a new connection.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct InitConnectionBody {
    #[serde(default)]
    pub desired_queries_patch: Vec<QueriesPatchOp>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChangeDesiredQueriesBody {
    pub desired_queries_patch: Vec<QueriesPatchOp>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct PingBody {}

/// Client to server messages.
#[derive(Clone, Debug, PartialEq)]
pub enum Upstream {
    InitConnection(InitConnectionBody),
    ChangeDesiredQueries(ChangeDesiredQueriesBody),
    Ping(PingBody),
}

impl Serialize for Upstream {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Upstream::InitConnection(b) => ("initConnection", b).serialize(serializer),
            Upstream::ChangeDesiredQueries(b) => ("changeDesiredQueries", b).serialize(serializer),
            Upstream::Ping(b) => ("ping", b).serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Upstream {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (tag, value): (String, Value) = Deserialize::deserialize(deserializer)?;
        match tag.as_str() {
            "initConnection" => body(&tag, value).map(Upstream::InitConnection),
            "changeDesiredQueries" => body(&tag, value).map(Upstream::ChangeDesiredQueries),
            "ping" => body(&tag, value).map(Upstream::Ping),
            other => Err(D::Error::unknown_variant(
                other,
                &["initConnection", "changeDesiredQueries", "ping"],
            )),
        }
    }
}
