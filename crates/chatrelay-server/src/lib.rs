//! `ChatRelay` server library.
//!
//! Relays AI responses generated in the background to SSE clients that may
//! disconnect and resume at any time.

pub mod agent;
pub mod relay;
pub mod server;
pub mod storage;
