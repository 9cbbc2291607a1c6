//! Coordination primitives for concurrent tasks: an async multi-producer
//! multi-consumer [`Queue`] with pluggable overflow strategies, and a
//! software transactional memory engine ([`stm`]) with optimistic
//! validation and automatic retry.

#[macro_use]
extern crate tracing;

mod queue;
pub mod stm;
pub mod util;

pub use crate::queue::api::*;
pub use crate::stm::{atomically, Commit, Either, Env, Stm, StmValue, TRef};

/// Error types
pub mod error {
    pub use crate::queue::error::*;
}

/// Future types
pub mod future {
    pub use crate::queue::api::future::*;
}
