mod change;
mod datum;
mod path;
mod row;
mod zset;

pub use change::{Change, ChangeKind, OutputRow, RowChangeEvent, VersionedBatch};
pub use datum::Datum;
pub use path::Path;
pub use row::{row_from_json, row_to_json, Row, RowId, RowKey};
pub use zset::{FastMap, FastSet, Weight, WeightTransition, ZSet, ZSetOps};
