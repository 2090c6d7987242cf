//! Wire types for the `/sync` client connection.
//!
//! Every message is a two element JSON array `[tag, body]`, e.g.
//! `["pokeStart", {"pokeID": "...", "baseCookie": null, "cookie": "..."}]`.

pub mod connect;
pub mod down;
pub mod error;
pub mod poke;
pub mod queries;
pub mod up;
pub mod version;

mod tagged;

pub use connect::ConnectParams;
pub use down::{ConnectedBody, Downstream};
pub use error::{ErrorBody, ErrorKind};
pub use poke::{
    ClientsPatchOp, PokeEndBody, PokePartBody, PokeStartBody, RowPatchOp, SchemaVersions,
};
pub use queries::{query_hash, QueriesPatchOp};
pub use up::{ChangeDesiredQueriesBody, InitConnectionBody, Upstream};
pub use version::{
    supports_revised_cookie_protocol, MIN_SERVER_SUPPORTED_SYNC_PROTOCOL, PROTOCOL_VERSION,
};
