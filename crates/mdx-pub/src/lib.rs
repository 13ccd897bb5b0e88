//! # mdx-pub
//!
//! Producer side of the market-data distribution system.
//!
//! - [`ticker`] - per-instrument book mirrored into the shared cache
//! - [`consumer`] - per-consumer proxy and its shared-memory data rings
//! - [`feed`] - upstream feed boundary
//! - [`source`] - market-data thread and its control-plane handle
//! - [`registry`] - book caches and symbol tables keyed by exchange
//! - [`publisher`] - connect / subscribe session management
//! - [`control`] - tokio TCP control channel

pub mod consumer;
pub mod control;
pub mod feed;
pub mod publisher;
pub mod registry;
pub mod source;
pub mod ticker;

pub use control::ControlChannel;
pub use publisher::{Publisher, PublisherSettings};
pub use registry::CacheRegistry;
pub use source::{MarketDataSource, SourceHandle};
