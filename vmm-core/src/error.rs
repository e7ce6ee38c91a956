/*!
Specialized `Error` and `Result` types for vmm-core.
*/

use std::{convert, error, fmt, result, str};

/// Specialized `Error` type for vmm-core errors.
///
/// The scatter pipeline itself never surfaces errors - per-unit `valid`
/// flags and byte counts do (see the read/write wrappers). This type is
/// used by constructors, typed read helpers and the map accessors.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Error {
    /// Generic error type containing a string
    Other(&'static str),
    /// Partial read or write.
    ///
    /// A byte-oriented access completed fewer bytes than requested.
    Partial,
    /// Out of bounds.
    Bounds,
    /// Initialization error.
    ///
    /// The engine or one of its collaborators was not (or could not be)
    /// initialized.
    Initialization(&'static str),
    /// Acquisition device error.
    Device(&'static str),
    /// Virtual address translation failed.
    Translation,
    /// Process error.
    ///
    /// Catch-all for process table related errors.
    Process(&'static str),
    /// Map error.
    ///
    /// A semantic map could not be initialized.
    Map(&'static str),
    /// Encoding error.
    ///
    /// Catch-all for string related errors such as lacking a nul terminator.
    Encoding,
}

/// Convert from &str to error
impl convert::From<&'static str> for Error {
    fn from(error: &'static str) -> Self {
        Error::Other(error)
    }
}

/// Convert from str::Utf8Error
impl From<str::Utf8Error> for Error {
    fn from(_err: str::Utf8Error) -> Self {
        Error::Encoding
    }
}

impl Error {
    /// Returns a tuple representing the error description and its string value.
    pub fn to_str_pair(self) -> (&'static str, Option<&'static str>) {
        match self {
            Error::Other(e) => ("other error", Some(e)),
            Error::Partial => ("partial read/write", None),
            Error::Bounds => ("out of bounds", None),
            Error::Initialization(e) => ("initialization error", Some(e)),
            Error::Device(e) => ("device error", Some(e)),
            Error::Translation => ("virtual address translation failed", None),
            Error::Process(e) => ("process error", Some(e)),
            Error::Map(e) => ("map error", Some(e)),
            Error::Encoding => ("encoding error", None),
        }
    }

    /// Returns a simple string representation of the error.
    pub fn to_str(self) -> &'static str {
        self.to_str_pair().0
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (desc, value) = self.to_str_pair();

        if let Some(value) = value {
            write!(f, "{}: {}", desc, value)
        } else {
            f.write_str(desc)
        }
    }
}

impl error::Error for Error {
    fn description(&self) -> &str {
        self.to_str()
    }
}

/// Specialized `Result` type for vmm-core results.
pub type Result<T> = result::Result<T, Error>;
