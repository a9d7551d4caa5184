//! Two-tier cache store: a cost-bounded memory LRU over a directory tree
//! of captured responses.
//!
//! Disk is the authoritative copy; memory is a volatile cache over it,
//! filled lazily on first access. Every logical key owns one directory
//! holding a `.meta` file plus one body file per captured encoding
//! (`.none`, `.gzip`, `.br`, `.zstd`).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, error};

use super::lock::{rw_read, rw_write};
use super::lru::Lru;
use super::meta::{CacheMeta, ContentEncoding, set_disk_mode};
use crate::util::bytes::format_bytes;

/// Directory created under the configured location for the disk tier.
pub const CACHE_DIR: &str = "sidekick-cache";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("key not found in cache")]
    NotFound,
    #[error("cache entry expired")]
    Expired,
}

/// A cached response variant: metadata plus the raw body bytes.
#[derive(Debug)]
pub struct CacheEntry {
    pub meta: CacheMeta,
    pub body: Bytes,
}

type MemCache = Lru<String, Arc<CacheEntry>>;

/// Two-tier store shared across request handlers.
///
/// The memory handle is swappable so `flush` can replace the whole tier in
/// one step; operations load the handle once and may finish against an
/// old generation.
pub struct Store {
    root: PathBuf,
    ttl: u64,
    mem_max_cost: u64,
    mem_max_entries: usize,
    mem: RwLock<Arc<MemCache>>,
}

/// Admin listing of both tiers, serialized by the purge endpoint.
#[derive(Debug, Serialize)]
pub struct CacheListing {
    pub mem: Vec<String>,
    pub disk: Vec<String>,
    pub debug: Vec<String>,
}

/// Fold slashes so a logical key works as a single directory name.
pub(crate) fn safe_key(key: &str) -> String {
    key.replace('/', "+")
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

impl Store {
    /// Create a store rooted at `<loc>/sidekick-cache`, creating the
    /// directory if missing. `ttl` of zero disables expiry; either memory
    /// budget of zero leaves that axis unbounded.
    pub fn new(
        loc: &Path,
        ttl: u64,
        mem_max_cost: u64,
        mem_max_entries: usize,
    ) -> std::io::Result<Self> {
        let root = loc.join(CACHE_DIR);
        fs::create_dir_all(&root)?;
        set_disk_mode(&root, 0o755)?;
        Ok(Self {
            root,
            ttl,
            mem_max_cost,
            mem_max_entries,
            mem: RwLock::new(Arc::new(Lru::new(mem_max_entries, mem_max_cost))),
        })
    }

    fn mem(&self) -> Arc<MemCache> {
        rw_read(&self.mem, "store.mem").clone()
    }

    /// Compose the logical cache key for a request path and extra tag.
    pub fn build_cache_key(req_path: &str, tag: &str) -> String {
        format!("{req_path}::{tag}")
    }

    /// Fetch one encoding variant of a key, reading through to disk on a
    /// memory miss. A disk hit is promoted into the memory tier.
    ///
    /// Expired entries report [`StoreError::Expired`] and schedule a
    /// detached purge of every variant of the key.
    pub fn get(self: &Arc<Self>, key: &str, enc: &str) -> Result<Arc<CacheEntry>, StoreError> {
        let safe = safe_key(key);
        let mem = self.mem();
        let mem_key = format!("{safe}::{enc}");

        let mut from_disk = false;
        let (entry, _) = mem.load_or_compute(mem_key, || {
            let dir = self.root.join(&safe);
            let meta = match CacheMeta::load_from_file(&dir.join(".meta")) {
                Ok(meta) => meta,
                Err(err) => {
                    debug!(key = %safe, enc, error = %err, "no readable metadata on disk");
                    return None;
                }
            };
            let body = match fs::read(dir.join(format!(".{enc}"))) {
                Ok(body) => body,
                Err(err) => {
                    debug!(key = %safe, enc, error = %err, "no readable variant body on disk");
                    return None;
                }
            };
            from_disk = true;
            let cost = body.len() as u64;
            Some((
                Arc::new(CacheEntry {
                    meta,
                    body: Bytes::from(body),
                }),
                cost,
            ))
        });

        let Some(entry) = entry else {
            return Err(StoreError::NotFound);
        };
        debug!(
            key = %safe,
            enc,
            tier = if from_disk { "disk" } else { "mem" },
            "cache hit"
        );

        if self.ttl > 0 && now_unix() > entry.meta.timestamp + self.ttl as i64 {
            debug!(key = %safe, "cache entry expired; scheduling purge");
            let store = Arc::clone(self);
            let doomed = key.to_string();
            tokio::task::spawn_blocking(move || store.purge(&doomed));
            return Err(StoreError::Expired);
        }

        Ok(entry)
    }

    /// Store a captured response under `req_path` (plus an extra key tag)
    /// for the encoding recorded in `meta`.
    ///
    /// The memory tier is always updated; disk writes are best-effort and
    /// only logged on failure, so a full disk degrades to a memory-only
    /// cache rather than failing responses.
    pub fn set(&self, req_path: &str, key_tag: &str, meta: CacheMeta, body: Bytes) {
        let key = safe_key(&Self::build_cache_key(req_path, key_tag));
        let enc = meta.content_encoding();
        debug!(key = %key, enc = enc.as_str(), "storing cache entry");

        let cost = body.len() as u64;
        let entry = Arc::new(CacheEntry {
            meta,
            body: body.clone(),
        });
        self.mem().put(format!("{key}::{}", enc.as_str()), entry.clone(), cost);

        let dir = self.root.join(&key);
        if let Err(err) = fs::create_dir_all(&dir) {
            error!(key = %key, error = %err, "failed to create cache directory");
            return;
        }
        if let Err(err) = set_disk_mode(&dir, 0o755) {
            error!(key = %key, error = %err, "failed to set cache directory mode");
        }
        let body_path = dir.join(enc.file_name());
        if let Err(err) = fs::write(&body_path, &body) {
            error!(key = %key, error = %err, "failed to write cache body");
        } else if let Err(err) = set_disk_mode(&body_path, 0o644) {
            error!(key = %key, error = %err, "failed to set cache body mode");
        }
        if let Err(err) = entry.meta.write_to_file(&dir.join(".meta")) {
            error!(key = %key, error = %err, "failed to write cache metadata");
        }
    }

    /// Remove every variant whose safe key starts with the safe form of
    /// `key`, from both tiers.
    pub fn purge(&self, key: &str) {
        let safe = safe_key(key);
        debug!(key = %safe, "purging cache entries");

        let mem = self.mem();
        let mut doomed = Vec::new();
        mem.range(|mem_key, _| {
            if mem_key.starts_with(&safe) {
                doomed.push(mem_key.clone());
            }
            true
        });
        for mem_key in &doomed {
            mem.delete(mem_key);
        }

        let children = match fs::read_dir(&self.root) {
            Ok(children) => children,
            Err(err) => {
                error!(error = %err, "failed to scan cache root for purge");
                return;
            }
        };
        for child in children.flatten() {
            let name = child.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(&safe) {
                continue;
            }
            if let Err(err) = fs::remove_dir_all(child.path()) {
                error!(key = %name, error = %err, "failed to remove cache directory");
            }
        }
    }

    /// Drop the whole cache: swap in a fresh memory tier and wipe the
    /// disk tier. In-flight operations holding the old memory handle are
    /// left to finish against it.
    pub fn flush(&self) {
        debug!("flushing cache");
        *rw_write(&self.mem, "store.flush") =
            Arc::new(Lru::new(self.mem_max_entries, self.mem_max_cost));

        let children = match fs::read_dir(&self.root) {
            Ok(children) => children,
            Err(err) => {
                error!(error = %err, "failed to scan cache root for flush");
                return;
            }
        };
        for child in children.flatten() {
            if let Err(err) = fs::remove_dir_all(child.path()) {
                error!(path = %child.path().display(), error = %err, "failed to remove cache directory");
            }
        }
    }

    /// Enumerate both tiers for the admin endpoint.
    pub fn list(&self) -> CacheListing {
        let mem = self.mem();
        let mut mem_keys = Vec::with_capacity(mem.len());
        mem.range(|key, _| {
            mem_keys.push(key.clone());
            true
        });

        let mut disk_keys = Vec::new();
        if let Ok(children) = fs::read_dir(&self.root) {
            for child in children.flatten() {
                if !child.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
                    continue;
                }
                let name = child.file_name();
                let Some(name) = name.to_str() else { continue };
                for enc in ContentEncoding::ALL {
                    if child.path().join(enc.file_name()).exists() {
                        disk_keys.push(format!("{name}::{}", enc.as_str()));
                    }
                }
            }
        }

        let debug = vec![
            format!("max_size={}", self.mem_max_cost),
            format!("max_count={}", self.mem_max_entries),
            format!("size={}", mem.cost()),
            format!("count={}", mem.len()),
            format!(
                "usage={} of {}",
                format_bytes(mem.cost()),
                format_bytes(self.mem_max_cost)
            ),
        ];

        CacheListing {
            mem: mem_keys,
            disk: disk_keys,
            debug,
        }
    }
}
