//! Quire: a stale-while-revalidate edge cache for content queries and pages.

pub mod application;
pub mod cache;
pub mod config;
pub mod infra;
