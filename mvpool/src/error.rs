use thiserror::Error;

/// A list of possible errors returned by mvpool.
#[derive(Error, Debug)]
pub enum Error {
    /// No frozen header or region memory is available.
    ///
    /// Returned by [`freeze`] this always means the frozen-header pool must be
    /// refilled before the next attempt.
    ///
    /// [`freeze`]: crate::Region::freeze
    #[error("Out of memory")]
    OutOfMemory,
    /// A freezer file operation failed.
    #[error("IO {0}")]
    Io(#[from] std::io::Error),
    /// Some shared structure or freezer file is corrupted.
    #[error("Corrupted")]
    Corrupted,
    /// The region hit a consistency violation earlier and must be recovered.
    #[error("Region panic")]
    RegionPanic,
    /// The caller broke the contract of an operation.
    #[error("Invalid argument")]
    InvalidArgument,
}

/// The broad class of an [`Error`], used to drive retry logic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with another victim or after reclaiming memory.
    Resource,
    /// The operation was rolled back and may be retried.
    Io,
    /// Shared state is corrupted; the environment must be recovered.
    Consistency,
    /// The caller must fix its request.
    Usage,
}

impl Error {
    /// Returns the class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::OutOfMemory => ErrorClass::Resource,
            Error::Io(_) => ErrorClass::Io,
            Error::Corrupted | Error::RegionPanic => ErrorClass::Consistency,
            Error::InvalidArgument => ErrorClass::Usage,
        }
    }

    /// Returns true if the region can not continue after this error.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Consistency
    }
}

/// A specialized [`Result`] type returned by mvpool.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_class() {
        assert_eq!(Error::OutOfMemory.class(), ErrorClass::Resource);
        let io = std::io::Error::from(std::io::ErrorKind::UnexpectedEof);
        assert_eq!(Error::from(io).class(), ErrorClass::Io);
        assert!(Error::Corrupted.is_fatal());
        assert!(Error::RegionPanic.is_fatal());
        assert!(!Error::InvalidArgument.is_fatal());
    }
}
