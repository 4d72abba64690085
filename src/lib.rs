// this_file: src/lib.rs

//! Fonthub: collaborative font editing session core for FontSimi.
//!
//! This library provides the server-side session object mediating
//! concurrent multi-client edits of a font stored in a pluggable backend:
//! cached reads, coherent local application of edits, change broadcasting
//! to subscribed peers, and asynchronous, failure-tolerant persistence.
//!
//! ## Architecture
//!
//! - **handler**: the session core (edit pipeline, write scheduler,
//!   external-change watcher, broadcast engine)
//! - **changes** / **pattern**: the edit description algebra
//! - **cache**: LRU store of font data at data-key granularity
//! - **dependencies**: glyph component dependency index
//! - **backend**: capability traits for pluggable storage
//! - **memory** / **compose**: in-memory backend and read-side composition
//! - **connection**: client proxies and subscription tiers
//! - **error**: error types and handling
//!
//! ## Example
//!
//! ```rust,no_run
//! use fonthub::{Connection, FontHandler, HandlerOptions, MemoryBackend};
//! use std::sync::Arc;
//!
//! # async fn demo(proxy: Arc<dyn fonthub::ClientProxy>) -> fonthub::Result<()> {
//! let backend = Arc::new(MemoryBackend::new());
//! let handler = FontHandler::new(backend, HandlerOptions::default());
//! handler.start();
//!
//! let connection = Connection::new("client-1", proxy);
//! let _guard = handler.use_connection(connection.clone());
//! let glyph = handler.get_glyph("A").await?;
//! # drop(glyph);
//!
//! handler.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod cache;
pub mod changes;
pub mod compose;
mod connection;
pub mod dependencies;
pub mod error;
pub mod font;
mod handler;
pub mod logging;
pub mod memory;
pub mod pattern;
mod tasks;

// Re-export main types
pub use backend::{
    BackendFeatures, BackendInfo, ExternalEvent, ExternalEventStream, GlyphUsageBackend,
    ReadBackend, WatchBackend, WriteBackend,
};
pub use cache::{CachedValue, DataKey, LocalCache, RootKey, DEFAULT_CACHE_CAPACITY};
pub use changes::{
    apply_change, apply_change_observed, collect_change_paths, filter_change_pattern,
    match_change_pattern, Change, ChangeFunc, ChangeObserver,
};
pub use compose::MergedBackend;
pub use connection::{ClientProxy, Connection, Subscriptions};
pub use dependencies::DependencyTracker;
pub use error::{Error, Result};
pub use font::{
    Component, ContourInfo, CustomData, FontAxis, GlyphAxis, GlyphMap, GlyphSource, Layer,
    PackedPath, StaticGlyph, Transformation, VariableGlyph,
};
pub use handler::{ConnectionGuard, ConnectionsClosedCallback, FontHandler, HandlerOptions};
pub use memory::MemoryBackend;
pub use pattern::{Path, PathElement, PathOrPattern, Pattern};
