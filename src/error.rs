//! Error kinds raised or propagated by the metadata core.
//!
//! Block-layer failures abort the surrounding load or sync without
//! further state changes; invariant breaches are programmer errors and
//! panic instead of surfacing here.

use core::fmt;
use std::io;

#[derive(Debug)]
pub enum Error {
    /// A block read or write failed.
    Io { block: u64, source: io::Error },

    /// The block allocator could not reserve the requested run.
    NoSpace { count: u64 },
}

pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io { block, source } => write!(f, "i/o error on block {}: {}", block, source),
            Error::NoSpace { count } => write!(f, "no metadata run of {} blocks", count),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
