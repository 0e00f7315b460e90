//! Metadata storage layer.
//!
//! The metadata store is the durable index of buckets, objects,
//! multipart uploads, parts, and credentials.  [`store::MetadataStore`]
//! defines the contract; the submodules provide the interchangeable
//! substrates.  [`list`] holds the one canonical implementation of the
//! prefix/delimiter/pagination algorithm that every backend funnels
//! through.

pub mod cosmos;
pub mod dynamodb;
pub mod firestore;
pub mod jsonl;
pub mod list;
pub mod memory;
pub mod sqlite;
pub mod store;
