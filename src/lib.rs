// ABOUTME: Library crate for poolbridge exposing the bridge API for embedding and testing

//! Async bridge that runs requests on a pool of long-lived worker subprocesses.

/// Worker pool, sessions, recovery and the `Bridge` supervisor
pub mod bridge;

pub use bridge::{
    Bridge, BridgeConfig, BridgeError, BridgeRequest, BridgeResult, BridgeStatus, RecoveryStrategy,
};
