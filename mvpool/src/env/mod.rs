//! File system environments used by the freezer file store.

use std::{io::Result, path::Path};

mod stdenv;
pub use stdenv::{PositionalFile, Std};

#[cfg(test)]
pub(crate) mod faulty;

/// Options to configure how a file is opened.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenOptions {
    /// Pass custom flags to the `flags` argument of `open`.
    /// See also [`std::os::unix::fs::OpenOptionsExt::custom_flags`].
    pub custom_flags: i32,

    /// Sets the option to create a new file, or open it if it already exists.
    /// See also [`std::fs::OpenOptions::create`].
    pub create: bool,
}

/// Provides an environment to interact with a specific platform.
pub trait Env: Clone + Send + Sync + 'static {
    /// Positional file returned by [`Env::open_positional_file`].
    type PositionalFile: ReadAt + WriteAt + Truncate + Syncer + Send;

    /// Opens a file for positional reads and writes.
    fn open_positional_file<P>(&self, path: P, opt: OpenOptions) -> Result<Self::PositionalFile>
    where
        P: AsRef<Path>;

    /// Removes a file from the filesystem.
    /// See also [`std::fs::remove_file`].
    fn remove_file<P: AsRef<Path>>(&self, path: P) -> Result<()>;

    /// Recursively create a directory and all of its parent components if they
    /// are missing.
    /// See also [`std::fs::create_dir_all`].
    fn create_dir_all<P: AsRef<Path>>(&self, path: P) -> Result<()>;

    /// Given a path, query the file system to get information about a file,
    /// directory, etc.
    /// See also [`std::fs::metadata`].
    fn metadata<P: AsRef<Path>>(&self, path: P) -> Result<Metadata>;
}

/// Reads bytes from a file at a given offset.
pub trait ReadAt {
    /// Reads some bytes at `offset`, returning how many were read.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Reads the exact number of bytes to fill `buf` at `offset`.
    fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> Result<()> {
        while !buf.is_empty() {
            match self.read_at(buf, offset) {
                Ok(0) => return Err(std::io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Writes bytes to a file at a given offset.
pub trait WriteAt {
    /// Writes some bytes at `offset`, returning how many were written.
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize>;

    /// Writes the whole `buf` at `offset`.
    fn write_all_at(&self, mut buf: &[u8], mut offset: u64) -> Result<()> {
        while !buf.is_empty() {
            match self.write_at(buf, offset) {
                Ok(0) => return Err(std::io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    buf = &buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Shrinks or extends a file.
pub trait Truncate {
    /// Returns true if [`Truncate::set_len`] is available on this platform.
    fn supports_truncate(&self) -> bool {
        true
    }

    /// Sets the length of the file.
    /// See also [`std::fs::File::set_len`].
    fn set_len(&self, len: u64) -> Result<()>;
}

/// Synchronizes modified content of the file.
pub trait Syncer {
    /// Synchronizes all modified content but without metadata of this file to
    /// disk.
    fn sync_data(&self) -> Result<()>;
}

/// Metadata information about a file.
#[allow(clippy::len_without_is_empty)]
pub struct Metadata {
    /// The size of the file this metadata is for.
    pub len: u64,

    /// Is this metadata for a directory.
    pub is_dir: bool,
}
