//! docwsd: a document-editing WebSocket relay.
//!
//! Clients connect over WebSocket and are paired with worker processes, each
//! running a render engine inside its own jail. The top-level server relays
//! messages between the two, keeps a pool of pre-spawned workers ready and
//! replaces the ones that exit.

pub mod client;
pub mod config;
pub mod engine;
pub mod pool;
pub mod pump;
pub mod queue;
pub mod relay;
pub mod server;
pub mod session;
pub mod transfer;
pub mod worker;

/// Exit code for fatal startup failures (`EX_UNAVAILABLE`).
pub const EXIT_UNAVAILABLE: i32 = 69;
