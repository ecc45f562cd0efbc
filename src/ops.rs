//! Everything that touches servers or long-running processes.

pub mod build;
pub mod context;
pub mod deploy;
pub mod lock;
pub mod monitor;
pub mod operation;
pub mod process;
pub mod resolve;
pub mod shell;
