//! Sandboxed task orchestrator.
//!
//! A task moves through plan → approve → execute → test → review → done.
//! Each approved task gets its own copy of the source tree; plan steps and
//! test commands only ever touch that copy, and review compares it back
//! against the source.
//!
//! - **[`core`]**: Pure, deterministic logic (domain types, state machine,
//!   sanitization, diffing, lint rules). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting collaborators (config, subprocesses, sandbox
//!   directories, memory log, planner).
//!
//! [`orchestrator::Orchestrator`] ties them together behind the [`store`] and
//! [`gate`]; every fallible operation returns [`error::Error`].

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod gate;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod store;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use error::{Error, ErrorKind, Result};
pub use orchestrator::Orchestrator;
