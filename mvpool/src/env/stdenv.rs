use std::{
    fs::{File, OpenOptions as StdOpenOptions},
    io::Result,
    path::Path,
};

use super::{Env, Metadata, OpenOptions, ReadAt, Syncer, Truncate, WriteAt};

/// An implementation of [`Env`] based on [`std`] with synchronous I/O.
#[derive(Clone, Debug, Default)]
pub struct Std;

impl Env for Std {
    type PositionalFile = PositionalFile;

    fn open_positional_file<P>(&self, path: P, opt: OpenOptions) -> Result<Self::PositionalFile>
    where
        P: AsRef<Path>,
    {
        let mut options = StdOpenOptions::new();
        options.read(true).write(true).create(opt.create);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.custom_flags(opt.custom_flags);
        }
        let file = options.open(path.as_ref())?;
        Ok(PositionalFile(file))
    }

    fn remove_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::remove_file(path)
    }

    fn create_dir_all<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::create_dir_all(path)
    }

    fn metadata<P: AsRef<Path>>(&self, path: P) -> Result<Metadata> {
        let raw_metadata = std::fs::metadata(path)?;
        Ok(Metadata {
            len: raw_metadata.len(),
            is_dir: raw_metadata.is_dir(),
        })
    }
}

/// A file opened by [`Std`] for positional reads and writes.
pub struct PositionalFile(File);

impl ReadAt for PositionalFile {
    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        use std::os::unix::fs::FileExt;
        self.0.read_at(buf, offset)
    }

    #[cfg(windows)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        use std::os::windows::fs::FileExt;
        self.0.seek_read(buf, offset)
    }
}

impl WriteAt for PositionalFile {
    #[cfg(unix)]
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        use std::os::unix::fs::FileExt;
        self.0.write_at(buf, offset)
    }

    #[cfg(windows)]
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize> {
        use std::os::windows::fs::FileExt;
        self.0.seek_write(buf, offset)
    }
}

impl Truncate for PositionalFile {
    fn set_len(&self, len: u64) -> Result<()> {
        self.0.set_len(len)
    }
}

impl Syncer for PositionalFile {
    fn sync_data(&self) -> Result<()> {
        self.0.sync_data()
    }
}
