//! The error type for the few operations that can fail without it being a programming error.

use core::fmt::{self, Debug, Display, Formatter};

#[derive(PartialEq, Eq, Clone, Copy)]
enum ErrorKind {
    PageTableFull { capacity: usize },
    OutOfMemory { size: usize },
    InvalidConfig(&'static str),
}

/// An error returned when a durability obligation could not be recorded, memory could not be
/// obtained, or a [`Config`](crate::config::Config) was rejected.
///
/// Contention never produces an `Error`; those outcomes are reported as `false` and are expected
/// to be retried.
#[derive(PartialEq, Eq, Clone, Copy)]
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    #[cold]
    pub(crate) fn page_table_full(capacity: usize) -> Self {
        Error {
            kind: ErrorKind::PageTableFull { capacity },
        }
    }

    #[cold]
    pub(crate) fn out_of_memory(size: usize) -> Self {
        Error {
            kind: ErrorKind::OutOfMemory { size },
        }
    }

    #[cold]
    pub(crate) fn invalid_config(reason: &'static str) -> Self {
        Error {
            kind: ErrorKind::InvalidConfig(reason),
        }
    }

    /// The active page table reached its absolute capacity and the page could not be recorded.
    #[inline]
    pub fn is_page_table_full(&self) -> bool {
        matches!(self.kind, ErrorKind::PageTableFull { .. })
    }

    /// The node allocator could not satisfy a request.
    #[inline]
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self.kind, ErrorKind::OutOfMemory { .. })
    }

    #[inline]
    pub fn is_invalid_config(&self) -> bool {
        matches!(self.kind, ErrorKind::InvalidConfig(_))
    }
}

impl Debug for Error {
    #[cold]
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        match self.kind {
            ErrorKind::PageTableFull { capacity } => formatter
                .debug_struct("PageTableFull")
                .field("capacity", &capacity)
                .finish(),
            ErrorKind::OutOfMemory { size } => formatter
                .debug_struct("OutOfMemory")
                .field("size", &size)
                .finish(),
            ErrorKind::InvalidConfig(reason) => formatter
                .debug_tuple("InvalidConfig")
                .field(&reason)
                .finish(),
        }
    }
}

impl Display for Error {
    #[cold]
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        match self.kind {
            ErrorKind::PageTableFull { capacity } => write!(
                formatter,
                "active page table is full ({} pages), refusing to drop a durability obligation",
                capacity
            ),
            ErrorKind::OutOfMemory { size } => {
                write!(formatter, "node allocator failed to provide {} bytes", size)
            }
            ErrorKind::InvalidConfig(reason) => write!(formatter, "invalid config: {}", reason),
        }
    }
}

impl std::error::Error for Error {}
