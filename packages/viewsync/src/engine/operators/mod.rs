pub mod operator;
pub mod predicate;

pub use operator::{Aggregate, AggregateFn, GroupKey, JoinCondition, JoinKind, Operator};
pub use predicate::Predicate;
