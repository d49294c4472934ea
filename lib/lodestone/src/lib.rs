#![allow(clippy::new_without_default)]

//! `lodestone` is a concurrent in-memory key-value server: one edge-triggered
//! reactor thread demultiplexes every client socket, a fixed pool of workers
//! executes framed commands against a shared store, and responses flow back
//! out through the same event loop.

pub mod arena;
pub mod logging;
pub mod net;
pub mod pool;
pub mod protocol;
pub mod queue;
mod server;
pub mod store;

pub use crate::server::{Config, Server, ShutdownHandle};
