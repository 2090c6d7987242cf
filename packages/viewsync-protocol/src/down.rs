use crate::error::ErrorBody;
use crate::poke::{PokeEndBody, PokePartBody, PokeStartBody};
use crate::tagged::body;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ConnectedBody {
    pub wsid: String,
    #[serde(default)]
    pub timestamp: Option<u64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct PongBody {}

/// Server to client messages.
#[derive(Clone, Debug, PartialEq)]
pub enum Downstream {
    Connected(ConnectedBody),
    Error(ErrorBody),
    Pong(PongBody),
    PokeStart(PokeStartBody),
    PokePart(PokePartBody),
    PokeEnd(PokeEndBody),
}

impl Downstream {
    pub fn tag(&self) -> &'static str {
        match self {
            Downstream::Connected(_) => "connected",
            Downstream::Error(_) => "error",
            Downstream::Pong(_) => "pong",
            Downstream::PokeStart(_) => "pokeStart",
            Downstream::PokePart(_) => "pokePart",
            Downstream::PokeEnd(_) => "pokeEnd",
        }
    }
}

impl Serialize for Downstream {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let tag = self.tag();
        match self {
            Downstream::Connected(b) => (tag, b).serialize(serializer),
            Downstream::Error(b) => (tag, b).serialize(serializer),
            Downstream::Pong(b) => (tag, b).serialize(serializer),
            Downstream::PokeStart(b) => (tag, b).serialize(serializer),
            Downstream::PokePart(b) => (tag, b).serialize(serializer),
            Downstream::PokeEnd(b) => (tag, b).serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Downstream {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (tag, value): (String, Value) = Deserialize::deserialize(deserializer)?;
        match tag.as_str() {
            "connected" => body(&tag, value).map(Downstream::Connected),
            "error" => body(&tag, value).map(Downstream::Error),
            "pong" => body(&tag, value).map(Downstream::Pong),
            "pokeStart" => body(&tag, value).map(Downstream::PokeStart),
            "pokePart" => body(&tag, value).map(Downstream::PokePart),
            "pokeEnd" => body(&tag, value).map(Downstream::PokeEnd),
            other => Err(D::Error::unknown_variant(
                other,
                &["connected", "error", "pong", "pokeStart", "pokePart", "pokeEnd"],
            )),
        }
    }
}
