//! Batch upload pipeline.

/// Wire encoding, compression, and encryption.
pub mod codec;
/// Backoff policy.
pub mod retry;
/// Background drain loop.
pub mod scheduler;
/// Collector transport capability.
pub mod transport;
