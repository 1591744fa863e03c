//! Ingestion and processing pipeline for public procurement notices.
//!
//! Notices ("tenders") arrive from upstream catalogs through the ingest API,
//! flow through the triage / fetch / parse queue stages, and fan out to
//! subscribed users. Each stage is a standalone long-running process wired
//! together by Redis lists and a shared SQLite store.

pub mod cache;
pub mod config;
pub mod crawler;
pub mod dedupe;
pub mod enrich;
pub mod events;
pub mod extract;
pub mod insights;
pub mod metrics;
pub mod normalize;
pub mod notify;
pub mod queue;
pub mod repository;
pub mod schema;
pub mod server;
pub mod triage;
pub mod workers;
