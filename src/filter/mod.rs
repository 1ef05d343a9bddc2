//! Filter predicate model.
//!
//! Filters are plain immutable values describing which rows of an entity
//! match. Every field is optional; `None` leaves that aspect unconstrained.
//! Observation filters link to data streams and features of interest, data
//! stream filters link to systems.
mod entities;
mod ids;
mod temporal;

pub use entities::*;
pub use ids::BigId;
pub use temporal::{RangeOp, TemporalFilter, TimeBound};
