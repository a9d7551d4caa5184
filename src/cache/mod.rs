//! Two-tier HTTP response cache.
//!
//! - **Memory tier**: a count- and cost-bounded LRU of captured entries.
//! - **Disk tier**: one directory per logical key holding a metadata file
//!   and one body file per content-encoding variant.
//!
//! The [`response_cache_layer`] middleware serves hits, answers
//! conditional requests, and routes misses through the capture pipeline,
//! which commits cacheable origin responses back into the [`Store`].

mod capture;
mod config;
mod lock;
mod lru;
mod meta;
mod middleware;
mod store;

pub use self::config::CacheConfig;
pub use self::lru::Lru;
pub use self::meta::{
    CACHEABLE_RESPONSE_HEADERS, CacheMeta, ContentEncoding, NEVER_CACHE_RESPONSE_HEADERS,
    format_http_date, generate_etag, parse_http_date,
};
pub use self::middleware::{CacheState, response_cache_layer};
pub use self::store::{CACHE_DIR, CacheEntry, CacheListing, Store, StoreError};
