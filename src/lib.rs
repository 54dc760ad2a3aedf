//! A session runtime for linearly written pages.
//!
//! A page program is re-executed from the top whenever its client changes an
//! input. Each run streams output deltas to the client, keeps control values
//! across runs, and reuses memoized computations so that re-execution stays
//! cheap.

pub mod config;
pub mod controls;
pub mod cursor;
pub mod forward_queue;
pub mod fragment;
pub mod hashing;
pub mod location;
pub mod logging;
pub mod media;
pub mod memo;
pub mod message;
pub mod message_cache;
pub mod program;
pub mod requests;
pub mod run_context;
pub mod runtime;
pub mod script;
pub mod script_runner;
pub mod session;
pub mod stats;

mod test;
