use crate::engine::operators::Predicate;
use crate::engine::types::Change;

#[derive(Debug)]
pub(crate) struct FilterNode {
    predicate: Predicate,
}

impl FilterNode {
    pub(crate) fn new(predicate: Predicate) -> Self {
        Self { predicate }
    }

    /// Stateless: a row's removal passes iff its addition did.
    #[inline]
    pub(crate) fn push(&self, change: Change, out: &mut Vec<Change>) {
        if self.predicate.eval(change.row()) {
            out.push(change);
        }
    }
}
