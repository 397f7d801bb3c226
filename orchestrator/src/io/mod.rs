//! Side-effecting collaborators: filesystem, subprocesses, configuration.

pub mod command;
pub mod config;
pub mod memory_log;
pub mod planner;
pub mod process;
pub mod workspace;

/// 16 lowercase hex characters from 8 random bytes.
pub(crate) fn random_hex_id() -> String {
    hex::encode(rand::random::<[u8; 8]>())
}
