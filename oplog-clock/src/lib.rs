//! Vector clocks for the operation log.
//!
//! - [`VectorClock`]: sparse map of client id to a monotonically increasing
//!   counter. Missing entries read as zero.
//! - [`CausalOrder`]: result of a pointwise comparison.
//!
//! Merge is commutative, associative and idempotent, so replicas folding
//! clocks in any order reach the same frontier.

mod vector_clock;

pub use vector_clock::{CausalOrder, VectorClock};
