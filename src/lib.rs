//! feedmill: feed ingestion and article enrichment.
//!
//! Publishers come from an OPML outline ([`registry`]). Their feeds are fetched
//! and normalized ([`feed`]), deduplicated against the store and either chunked
//! into durable queue jobs consumed by a worker pool ([`queue`]) or stored and
//! enriched inline by the single-flight sequential processor ([`enrich`]).
//! [`app::App`] wires the parts; [`api`] and the `feedmill` binary expose it.

pub mod api;
pub mod app;
pub mod config;
pub mod enrich;
pub mod feed;
pub mod pipeline;
pub mod queue;
pub mod registry;
pub mod storage;
pub mod util;
