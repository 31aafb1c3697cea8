//! Core data model.
//!
//! Work items and their delegation records, durable facts, and validation
//! reports. Everything here is plain data; behaviour lives in the stores and
//! the coordinator.

pub mod fact;
pub mod validation;
pub mod work;

pub use fact::*;
pub use validation::*;
pub use work::*;
