//! channel-transfer - cross-channel transfer orchestrator
//!
//! Admits signed transfer requests, drives each transfer through the
//! destination channel's batcher with bounded concurrency and retries,
//! reconciles asynchronous settlement outcomes, and answers status queries
//! until terminal records expire.

pub mod batcher;
pub mod collector;
pub mod config;
pub mod context;
pub mod executor;
pub mod gateway;
pub mod model;
pub mod services;
pub mod storage;
pub mod transport;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub mod proto {
    pub mod channel_transfer {
        tonic::include_proto!("core.channel_transfer");
    }

    pub mod batcher {
        tonic::include_proto!("core.batcher");
    }
}

pub use context::TransferContext;
