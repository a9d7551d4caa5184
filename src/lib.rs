//! sidekick-cache: a two-tier HTTP response cache for WordPress-style
//! origins.
//!
//! The [`cache`] module holds the cache itself — a cost-bounded memory
//! LRU over a per-key directory layout on disk — together with the axum
//! middleware that captures and replays responses. [`config`] resolves
//! layered settings (file, environment, CLI) and [`infra`] carries the
//! telemetry wiring plus the origin forwarder used by the binary.

pub mod cache;
pub mod config;
pub mod infra;
pub mod util;
