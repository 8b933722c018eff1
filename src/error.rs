use std::io;

/// String like type that occupies the same space as one usize
type TinyStr = Box<String>;

#[allow(missing_docs)]
#[derive(Debug, Display, Error)]
#[display("{:?}", self)]
#[non_exhaustive]
pub enum Error {
    /// A serialized page failed validation: length mismatch, check value
    /// mismatch, unknown type byte or var-int framing overflow. The offending
    /// page is never installed in memory.
    CorruptPage(#[error(not(source))] TinyStr),
    /// A page variant or body compression algorithm this build does not know.
    UnsupportedFormat(#[error(not(source))] TinyStr),
    /// A caller violated an API precondition.
    Validation(#[error(not(source))] TinyStr),
    /// The tree was opened read only and rejects writes.
    ReadOnly,
    /// A failed checkpoint left assigned page positions behind; the storage
    /// rejects further writes and must be reopened.
    StorageHalted,
    Io(io::Error),
    FatalIo(io::Error),
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Error::Io(value)
    }
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        let kind = match &value {
            Error::Io(i) | Error::FatalIo(i) => i.kind(),
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, value)
    }
}

macro_rules! corrupt_page {
    ($($arg:tt)*) => {{
        let msg = ::std::fmt::format(::std::format_args!($($arg)*));
        crate::Error::CorruptPage(msg.into())
    }}
}

macro_rules! unsupported_format {
    ($($arg:tt)*) => {{
        let msg = ::std::fmt::format(::std::format_args!($($arg)*));
        crate::Error::UnsupportedFormat(msg.into())
    }}
}

macro_rules! error_validation {
    ($($arg:tt)*) => {{
        let msg = ::std::fmt::format(::std::format_args!($($arg)*));
        crate::Error::Validation(msg.into())
    }}
}

macro_rules! io_invalid_data {
    ($($arg:tt)*) => {{
        let msg = ::std::fmt::format(::std::format_args!($($arg)*));
        let io_error = ::std::io::Error::new(::std::io::ErrorKind::InvalidData, msg);
        crate::Error::Io(io_error)
    }}
}

pub(crate) use corrupt_page;
pub(crate) use error_validation;
pub(crate) use io_invalid_data;
pub(crate) use unsupported_format;
