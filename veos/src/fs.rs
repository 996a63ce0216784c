//! Filesystem abstraction.
//!
//! The paging subsystem never walks directories or touches the buffer
//! cache; it consumes files purely as byte-addressable backing store for
//! executable segments and memory-mapped regions. The [`traits`] module
//! defines the interface the on-disk filesystem implements, and
//! [`RegularFile`] is the shared handle the rest of the kernel passes
//! around.

/// Defines traits for file system operations.
pub mod traits {
    use crate::KernelError;

    /// Trait representing a regular file in the filesystem.
    ///
    /// A regular file contains user data and supports positioned read and
    /// write operations. Implementations are free to block the calling
    /// thread on disk I/O; callers never hold spinlocks across these calls.
    pub trait RegularFile
    where
        Self: Send + Sync,
    {
        /// Returns the size of the file in bytes.
        fn size(&self) -> usize;

        /// Reads data from the file into the provided buffer.
        ///
        /// # Parameters
        /// - `offset`: The byte offset in the file at which to start.
        /// - `buf`: A mutable buffer where the file content will be stored.
        ///
        /// # Returns
        /// - `Ok(n)`: The number of bytes actually read. A read past the
        ///   end of the file reads fewer bytes than requested; a read
        ///   starting at or past the end reads zero.
        /// - `Err(KernelError)`: An error occurred during the read.
        fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, KernelError>;

        /// Writes data from the provided buffer into the file.
        ///
        /// # Parameters
        /// - `offset`: The byte offset in the file at which to start.
        /// - `buf`: The bytes to write.
        ///
        /// # Returns
        /// - `Ok(n)`: The number of bytes actually written.
        /// - `Err(KernelError)`: An error occurred during the write.
        fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize, KernelError>;
    }
}

use alloc::sync::Arc;

use crate::KernelError;

/// A handle to an open regular file.
///
/// Cloning the handle shares the underlying open file; the file is closed
/// when the last handle is dropped. The paging code stores one handle per
/// file-backed page descriptor and one per mapping record.
#[derive(Clone)]
pub struct RegularFile(pub Arc<dyn traits::RegularFile>);

impl RegularFile {
    /// Creates a handle from a filesystem object.
    pub fn new(file: Arc<dyn traits::RegularFile>) -> Self {
        Self(file)
    }

    /// Returns the size of the file in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.0.size()
    }

    /// Reads from the file at `offset`. See [`traits::RegularFile::read_at`].
    #[inline]
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, KernelError> {
        self.0.read_at(offset, buf)
    }

    /// Writes to the file at `offset`. See
    /// [`traits::RegularFile::write_at`].
    #[inline]
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize, KernelError> {
        self.0.write_at(offset, buf)
    }
}

impl core::fmt::Debug for RegularFile {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "RegularFile({} bytes)", self.size())
    }
}
