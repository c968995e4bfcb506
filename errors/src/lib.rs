use core::fmt::{Debug, Display};

pub type Result<T> = core::result::Result<T, Error>;

impl Errno {
    pub fn with_message<S: Into<String>>(&self, message: S) -> Error {
        Error {
            errno: *self,
            message: message.into(),
        }
    }

    pub fn no_message(&self) -> Error {
        Error {
            errno: *self,
            message: String::new(),
        }
    }
}

pub struct Error {
    errno: Errno,
    message: String,
}

impl Error {
    pub fn errno(&self) -> Errno {
        self.errno
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<Error> for i32 {
    fn from(error: Error) -> Self {
        error.errno as i32
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Errno::Io.with_message(error.to_string())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}: {}", self.errno, self.message)
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}: {}", self.errno, self.message)
    }
}

impl std::error::Error for Error {}

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Errno {
    /// No region or frame is known at the given address.
    NotFound = 1,
    InvArg = 2,
    OutOfMemory = 3,
    /// The host refused to reserve or remap a virtual range.
    MapFailed = 4,
    /// The host refused to delegate faults for a range.
    RegisterFailed = 5,
    Io = 6,
    /// The fault channel delivered something other than a missing-page fault.
    Protocol = 7,
    NotSupported = 8,
    /// Every pool shard appeared empty.
    Exhausted = 9,
    AlreadyExists = 10,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_errno_and_message() {
        let error = Errno::MapFailed.with_message("mmap: ENOMEM");
        assert_eq!(error.to_string(), "MapFailed: mmap: ENOMEM");
        assert_eq!(error.errno(), Errno::MapFailed);
        assert_eq!(i32::from(error), 4);
    }

    #[test]
    fn io_errors_convert() {
        let error: Error = std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into();
        assert_eq!(error.errno(), Errno::Io);
        assert!(Errno::NotFound.no_message().message().is_empty());
    }
}
