//! Destination object store seam.
//!
//! Writers receive the object as a sequence of chunks and publish it only in
//! [`ObjectWriter::finish`]; [`ObjectWriter::abort`] (or dropping an
//! unfinished writer) discards what was written so no partial object ever
//! becomes visible at the destination key.

pub mod error;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;

pub use error::DestinationError;
pub use s3::{S3ObjectStore, S3Settings};

#[async_trait]
pub trait ObjectWriter: Send {
    /// Append one chunk to the object being written.
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<(), DestinationError>;

    /// Publish the object and return its size in bytes.
    async fn finish(self: Box<Self>) -> Result<u64, DestinationError>;

    /// Discard everything written so far.
    async fn abort(self: Box<Self>) -> Result<(), DestinationError>;
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Bucket the store writes into, as recorded in manifest lines.
    fn bucket(&self) -> &str;

    async fn create_writer(&self, key: &str) -> Result<Box<dyn ObjectWriter>, DestinationError>;
}
