mod nodes;
pub mod operators;
pub mod pipeline;
pub mod replica;
pub mod types;

pub use operators::{Operator, Predicate};
pub use pipeline::{consolidate, Pipeline};
pub use replica::Replica;
pub use types::{Change, Datum, OutputRow, Path, Row, RowChangeEvent, RowId, RowKey, VersionedBatch};
