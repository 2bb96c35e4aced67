//! FEEDSYNC Store - Backing-Store Boundary
//!
//! The collaborator traits through which the sync layer reads entities,
//! opens change feeds and performs writes, plus schema-validating adapters
//! and an in-memory reference implementation.

pub mod decode;
pub mod memory;
pub mod traits;

pub use decode::{DecodingCollectionSource, DecodingEntitySource};
pub use memory::{InMemoryBackingStore, InMemoryCollection, InMemoryEntities, Queryable};
pub use traits::{
    CollectionSource, EntitySource, Mutation, MutationSink, SnapshotCallback, ValueCallback,
    WriteAck,
};
