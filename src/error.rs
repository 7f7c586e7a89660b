use std::io;

/// String like type that occupies the same space as one usize
type TinyStr = Box<String>;

#[allow(missing_docs)]
#[derive(Debug, Display, Error)]
#[display("{:?}", self)]
#[non_exhaustive]
pub enum Error {
    /// A node or meta block read back from the store failed validation
    Corruption(#[error(not(source))] TinyStr),
    /// Caller supplied input the index cannot represent
    Validation(#[error(not(source))] TinyStr),
    Io(io::Error),
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Error::Io(value)
    }
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        let kind = match &value {
            Error::Io(i) => i.kind(),
            _ => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, value)
    }
}

macro_rules! error_corruption {
    ($($arg:tt)*) => {{
        let msg = ::std::fmt::format(::std::format_args!($($arg)*));
        crate::Error::Corruption(msg.into())
    }}
}

macro_rules! error_validation {
    ($($arg:tt)*) => {{
        let msg = ::std::fmt::format(::std::format_args!($($arg)*));
        crate::Error::Validation(msg.into())
    }}
}

macro_rules! io_invalid_input {
    ($($arg:tt)*) => {{
        let msg = ::std::fmt::format(::std::format_args!($($arg)*));
        let io_error = ::std::io::Error::new(::std::io::ErrorKind::InvalidInput, msg);
        crate::Error::Io(io_error)
    }}
}

pub(crate) use error_corruption;
pub(crate) use error_validation;
pub(crate) use io_invalid_input;
