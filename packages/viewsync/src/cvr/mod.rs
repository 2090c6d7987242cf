//! Client view records: what each client group has been sent, how that
//! changes as query results and subscriptions change, and where records are
//! kept between syncer lifetimes.

mod catchup;
mod diff;
mod patch;
mod queries;
mod store;
mod types;
mod version;

pub use catchup::catchup_patches;
pub use diff::{apply_results, result_as_delta};
pub use patch::{Patch, PatchOp, PatchToVersion, RowRefs};
pub use queries::{ast_hash, client_metadata_query, DesiredQueryUpdate};
pub use store::{CvrStore, MemoryCvrStore, RedbCvrStore};
pub use types::{ClientId, ClientRecord, Cvr, QueryHash, QueryRecord, QueryRefs, RowRecord};
pub use version::{
    cmp_versions, cookie_to_version, version_from_lexi, version_to_cookie, version_to_lexi,
    version_to_nullable_cookie, CvrVersion, NullableCvrVersion,
};
