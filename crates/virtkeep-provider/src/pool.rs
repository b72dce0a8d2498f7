//! Provider contract for block-storage pools with named snapshots (Ceph RBD).

use std::error::Error;
use std::io::{self, Read};

/// Byte stream produced by an image export.
///
/// The stream must be drained before calling [`ExportStream::finish`], which
/// surfaces the exporting tool's exit status. A short read alone is not
/// enough to declare success: a tool that dies mid-export still closes its
/// output pipe.
pub struct ExportStream {
    reader: Box<dyn Read + Send>,
    finish: Box<dyn FnOnce() -> io::Result<()> + Send>,
}

impl ExportStream {
    pub fn new(
        reader: Box<dyn Read + Send>,
        finish: Box<dyn FnOnce() -> io::Result<()> + Send>,
    ) -> Self {
        Self { reader, finish }
    }

    /// Observe the exporter's exit status after the stream is drained.
    pub fn finish(self) -> io::Result<()> {
        drop(self.reader);
        (self.finish)()
    }
}

impl Read for ExportStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

/// Abstraction over the pool commands the RBD backup variant needs.
pub trait PoolProvider {
    type Error: Error + Send + Sync + 'static;

    /// Image names present in `pool`.
    fn list_images(&self, pool: &str) -> Result<Vec<String>, Self::Error>;

    /// Create the named snapshot `pool/image@name`.
    fn create_snapshot(&self, pool: &str, image: &str, name: &str) -> Result<(), Self::Error>;

    /// Snapshot names for `pool/image`, oldest first.
    fn list_snapshots(&self, pool: &str, image: &str) -> Result<Vec<String>, Self::Error>;

    /// Delete the named snapshot `pool/image@name`.
    fn delete_snapshot(&self, pool: &str, image: &str, name: &str) -> Result<(), Self::Error>;

    /// Stream the frozen content of `pool/image@snapshot`.
    fn export_snapshot(
        &self,
        pool: &str,
        image: &str,
        snapshot: &str,
    ) -> Result<ExportStream, Self::Error>;
}
