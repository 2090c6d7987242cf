mod filter;
mod group_by;
mod join;
mod source;

pub(crate) use filter::FilterNode;
pub(crate) use group_by::GroupByNode;
pub(crate) use join::JoinNode;
pub(crate) use source::SourceNode;
