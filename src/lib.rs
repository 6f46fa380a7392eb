//! GitHub Release Feed - GitHub releases republished as RSS
//!
//! This crate polls the GitHub releases API for a configured list of
//! repositories and serves the aggregated releases as one RSS 2.0 feed,
//! with a small web page for editing the repository list and settings.

pub mod config;
pub mod feed;
pub mod fetcher;
pub mod refresh;
pub mod routes;
pub mod store;
