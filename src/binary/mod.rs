//! Binary type metadata: schema merging and durable per-type files.

pub mod metadata;
pub mod store;

pub use metadata::{BinaryMetadata, BinaryMetadataHolder, BinarySchema, TypeId, VersionedMetadata};
pub use store::{BinaryMetadataFileStore, OperationSyncKey};
