//! # vexdb-client
//!
//! Async TCP client transport for vexdb.
//!
//! This crate provides:
//! - A single pipelined connection multiplexing up to `pipeline_depth`
//!   in-flight requests over one socket
//! - Per-request deadlines enforced by a coarse ticker, independently of
//!   the caller
//! - Synchronous and completion-based request submission
//! - One-shot failure broadcast that resolves every waiter

pub mod config;
pub mod connection;
pub mod error;
mod slots;

pub use config::ConnectionConfig;
pub use connection::{Completion, ConnState, Connection, UpdatesHandler};
pub use error::ClientError;

pub use vexdb_protocol::{Arg, CmdCode, Response};
