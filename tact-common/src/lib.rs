//! Shared scalar types, interval arithmetic, and deterministic seeding used
//! across the tact workspace.

pub mod interval;
pub mod seed;

/// Node ages and branch lengths, measured backwards from the present.
pub type Time = f64;

/// Default tolerance when deciding whether a tree is ultrametric.
pub const DEFAULT_PRECISION: Time = 1e-6;

/// Default crown capture probability required to fit rates on a clade.
pub const DEFAULT_MIN_CCP: f64 = 0.8;

pub use interval::{Interval, IntervalError, IntervalUnion};
pub use seed::substream;
