//! Storage substrate of a small relational database: a fixed-capacity
//! buffer pool over a page-addressed file, and a linear probing hash index
//! stored entirely in pages owned by that pool.

pub mod cache;
pub mod config;
pub mod indexes;
pub mod pages;
pub mod storage;
pub mod txn;
pub mod wal;
