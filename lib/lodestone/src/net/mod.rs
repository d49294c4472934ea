//! Client-facing networking: byte buffers, the per-connection state machine
//! and the edge-triggered reactor that drives them.

pub mod buffer;
pub mod conn;
pub mod reactor;
pub mod support;
