//! Embedded analytics client: captures behavioral events and profile mutations,
//! keeps them in a durable on-device queue, and uploads them in batches.
//!
//! # Examples
//!
//! Building and queueing an event directly against the core types:
//! ```
//! use std::time::Instant;
//!
//! use datrack::{
//!     core::{builder::EventBuilder, identity::IdentityManager, queue::PersistentQueue},
//!     event::EventDraft,
//!     persist::memory::MemoryStorage,
//! };
//!
//! let (mut queue, _) = PersistentQueue::open(Box::new(MemoryStorage::new())).expect("open");
//! let mut identity = IdentityManager::new();
//! identity.enter_foreground(Instant::now());
//!
//! let mut builder = EventBuilder::default();
//! let (id, event) = builder
//!     .track(EventDraft::new("purchase").attribute("sku", "A-1"), &identity, &mut queue, Instant::now())
//!     .expect("track");
//! assert_eq!(queue.get(id).map(|r| r.payload.seq()), Some(event.seq));
//! ```
//!
//! Running a tracker on SQLite storage:
//! ```no_run
//! use std::sync::Arc;
//!
//! use datrack::{
//!     event::EventDraft,
//!     persist::sqlite::SqliteStorage,
//!     runtime::{
//!         config::TrackerConfig,
//!         handle::{TrackerParts, start_tracker},
//!     },
//!     types::NetworkType,
//!     upload::transport::{Transport, TransportError},
//! };
//!
//! struct Collector;
//!
//! impl Transport for Collector {
//!     fn send(&self, _batch: &[u8]) -> Result<(), TransportError> {
//!         Ok(())
//!     }
//!     fn network_type(&self) -> NetworkType {
//!         NetworkType::Wifi
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let storage = SqliteStorage::open("datrack.db").expect("open sqlite");
//! let tracker = start_tracker(
//!     TrackerConfig::new("app-key", "1.0.0", "store"),
//!     TrackerParts::new(Box::new(storage), Arc::new(Collector)),
//! )
//! .expect("start");
//! tracker.enter_foreground();
//! tracker.track_event(EventDraft::new("open_settings"));
//! tracker.upload();
//! tracker.shutdown().await.expect("shutdown");
//! # }
//! ```
#![warn(missing_docs)]

/// Host-supplied device and network context.
pub mod context;
/// Capture-side state: builder, identity, properties, queue.
pub mod core;
/// Behavioral events and drafts.
pub mod event;
/// Durable storage abstraction with SQLite and in-memory backends.
pub mod persist;
/// Profile mutations.
pub mod profile;
/// Queue records and stored envelopes.
pub mod record;
/// Tracker handle, configuration, and events.
pub mod runtime;
/// Shared primitive types and enums.
pub mod types;
/// Batch encoding and the upload scheduler.
pub mod upload;
