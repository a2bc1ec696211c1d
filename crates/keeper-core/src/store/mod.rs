//! Vault persistence.
//!
//! Secret metadata and secret payloads live in two separate stores:
//!
//! - [`MetadataStore`]: small structured records, partitioned by owner.
//! - [`PayloadStore`]: opaque encrypted blobs addressed by payload key.
//!
//! [`VaultStore`] coordinates the two. Every write stores the payload first
//! and links it from metadata second; if linking fails the freshly written
//! payload is removed, so failed writes never leave orphan blobs behind.

mod meta;
mod payload;
mod vault;

pub use meta::{KvMetaStore, MetadataStore};
pub use payload::{FilePayloadStore, MemoryPayloadStore, PayloadReader, PayloadStore};
pub use vault::VaultStore;
