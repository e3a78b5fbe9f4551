// src/ingest/providers/mod.rs
pub mod x_search;

pub use x_search::XRecentSearchFeed;
