//! Elohim Files - tiered file distribution server
//!
//! Serves content-addressed blobs to clients in batches while bounding
//! concurrent load, and keeps a bounded on-disk cache across a fast hot tier
//! and an optional cold tier.
//!
//! ## Architecture
//!
//! ```text
//!  client ──enqueue──► RequestQueue ──activate (N slots)──┐
//!                                                         ▼
//!  client ◄──framed stream── framing ◄── CachedFileProvider ◄── hot / cold / origin
//!                                              │
//!                                              └──► TouchPropagator ──► cold atime
//!                                                                  └──► main server
//!
//!  CleanupEngine (clock-aligned) ──► age / size eviction ──► catalog reconciliation
//! ```
//!
//! ## Node roles
//!
//! | Role | `main_url` | Catalog | Misses |
//! |------|-----------|---------|--------|
//! | Main (authoritative) | unset | read + write | not found |
//! | Shard | set | none | pulled from main |
//!
//! ## Storage Layout
//!
//! ```text
//! <hot_storage_dir>/
//! ├── A/
//! │   └── A1B2...            # files sharded by first hash character
//! └── F/
//! <cold_storage_dir>/         # same layout, optional
//! catalog.sled/               # catalog database (main node)
//! ```

pub mod catalog;
pub mod cleanup;
pub mod config;
pub mod content_store;
pub mod error;
pub mod framing;
pub mod hash;
pub mod http;
pub mod metrics;
pub mod origin;
pub mod provider;
pub mod queue;
pub mod touch;

// Re-exports
pub use catalog::{Catalog, CatalogEntry, MemoryCatalog, SledCatalog};
pub use cleanup::{CleanupConfig, CleanupEngine, CleanupReport};
pub use config::Config;
pub use content_store::{ContentStore, Tier, TierStore};
pub use error::FileError;
pub use hash::ContentHash;
pub use http::HttpServer;
pub use metrics::Metrics;
pub use origin::{HttpOrigin, NoOrigin, Origin};
pub use provider::CachedFileProvider;
pub use queue::{QueueConfig, RequestQueue};
pub use touch::TouchPropagator;
