use std::fmt;

/// Coarse classification of a [`BuildError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing or mistyped configuration key.
    Schema,
    /// Value outside its bit width or allowed set.
    Range,
    /// Malformed input structure (segment count, architecture, owner-ID entries, archives).
    Structural,
    /// Feature the format allows but this tool does not produce.
    Unimplemented,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Schema => "schema",
            ErrorKind::Range => "range",
            ErrorKind::Structural => "structural",
            ErrorKind::Unimplemented => "unimplemented",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    MissingKey {
        path: String,
    },
    WrongType {
        path: String,
        expected: &'static str,
    },
    UnknownCapability {
        path: String,
        name: String,
    },
    OutOfRange {
        path: String,
        value: i128,
        min: u64,
        max: u64,
    },
    TooLong {
        path: String,
        len: usize,
        max: usize,
    },
    InvalidString {
        path: String,
        why: &'static str,
    },
    TooMany {
        what: String,
        count: usize,
        max: usize,
    },
    WrongCount {
        what: String,
        count: usize,
        expected: usize,
    },
    Conflict {
        path: String,
        why: &'static str,
    },
    Misaligned {
        path: String,
        value: u64,
        alignment: u64,
    },
    InvalidAlignment(usize),
    Structural(String),
    Unimplemented(&'static str),
}

impl BuildError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BuildError::MissingKey { .. }
            | BuildError::WrongType { .. }
            | BuildError::UnknownCapability { .. } => ErrorKind::Schema,
            BuildError::OutOfRange { .. }
            | BuildError::TooLong { .. }
            | BuildError::InvalidString { .. }
            | BuildError::TooMany { .. }
            | BuildError::WrongCount { .. }
            | BuildError::Conflict { .. }
            | BuildError::Misaligned { .. }
            | BuildError::InvalidAlignment(_) => ErrorKind::Range,
            BuildError::Structural(_) => ErrorKind::Structural,
            BuildError::Unimplemented(_) => ErrorKind::Unimplemented,
        }
    }

    pub(crate) fn structural(msg: impl Into<String>) -> Self {
        BuildError::Structural(msg.into())
    }
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::MissingKey { path } => write!(f, "couldn't find key `{path}`"),
            BuildError::WrongType { path, expected } => {
                write!(f, "`{path}` must be {expected}")
            }
            BuildError::UnknownCapability { path, name } => {
                write!(f, "`{path}`: unrecognised kernel capability type `{name}`")
            }
            BuildError::OutOfRange {
                path,
                value,
                min,
                max,
            } => write!(
                f,
                "`{path}` must be between {min:#x} and {max:#x} (got {value:#x})"
            ),
            BuildError::TooLong { path, len, max } => {
                write!(f, "string `{path}` is {len} bytes long (max {max})")
            }
            BuildError::InvalidString { path, why } => write!(f, "`{path}` {why}"),
            BuildError::TooMany { what, count, max } => {
                write!(f, "too many {what}: {count} (max = {max})")
            }
            BuildError::WrongCount {
                what,
                count,
                expected,
            } => write!(f, "expected {expected} {what}, got {count}"),
            BuildError::Conflict { path, why } => write!(f, "`{path}`: {why}"),
            BuildError::Misaligned {
                path,
                value,
                alignment,
            } => write!(
                f,
                "`{path}` must be aligned to {alignment:#x} (got {value:#x})"
            ),
            BuildError::InvalidAlignment(alignment) => {
                write!(f, "alignment must be a power of 2 (got {alignment:#x})")
            }
            BuildError::Structural(msg) => f.write_str(msg),
            BuildError::Unimplemented(what) => write!(f, "{what} is not supported"),
        }
    }
}

impl std::error::Error for BuildError {}

pub type BuildResult<T> = Result<T, BuildError>;
