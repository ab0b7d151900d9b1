//! Tracker handle, configuration, and event stream.

/// Tracker configuration.
pub mod config;
/// Event stream types emitted by the tracker.
pub mod events;
/// Tracker handle and People overlay.
pub mod handle;
