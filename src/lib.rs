//! Daybook: personal tasks, memos and profile kept in an optimistic,
//! reactive mirror of a remote row store.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
pub mod util;
