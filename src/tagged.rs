//! Links carrying a durability pending flag in an unused pointer bit.

use std::{
    fmt::{self, Debug, Formatter},
    mem,
};

/// Set on a published pointer whose cache line has not been written back yet.
pub const DURABILITY_PENDING: usize = 0x4;

/// A decoded link value.
///
/// `T` must be aligned to at least 8 bytes so that bit 2 of every pointer to it is free.
pub enum Link<T> {
    /// The link is durable, or the write-back buffer has taken responsibility for it.
    Plain(*mut T),
    /// Published before the write-back buffer finished recording it.
    Pending(*mut T),
}

impl<T> Clone for Link<T> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Link<T> {}

impl<T> PartialEq for Link<T> {
    #[inline]
    fn eq(&self, rhs: &Self) -> bool {
        self.encode() == rhs.encode()
    }
}
impl<T> Eq for Link<T> {}

impl<T> Debug for Link<T> {
    #[inline(never)]
    #[cold]
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Link::Plain(ptr) => f.debug_tuple("Plain").field(ptr).finish(),
            Link::Pending(ptr) => f.debug_tuple("Pending").field(ptr).finish(),
        }
    }
}

impl<T> Link<T> {
    #[inline]
    fn check_alignment() {
        debug_assert!(
            mem::align_of::<T>() > DURABILITY_PENDING,
            "link targets must be at least 8 byte aligned"
        );
    }

    /// Splits a raw stored value into the pointer and its tag.
    #[inline]
    pub fn decode(raw: *mut T) -> Self {
        Self::check_alignment();
        let bits = raw as usize;
        if bits & DURABILITY_PENDING != 0 {
            Link::Pending((bits & !DURABILITY_PENDING) as *mut T)
        } else {
            Link::Plain(raw)
        }
    }

    /// Returns the value to store.
    #[inline]
    pub fn encode(self) -> *mut T {
        match self {
            Link::Plain(ptr) => ptr,
            Link::Pending(ptr) => (ptr as usize | DURABILITY_PENDING) as *mut T,
        }
    }

    /// The pointer, without its tag.
    #[inline]
    pub fn ptr(self) -> *mut T {
        match self {
            Link::Plain(ptr) | Link::Pending(ptr) => ptr,
        }
    }

    #[inline]
    pub fn is_pending(self) -> bool {
        match self {
            Link::Plain(_) => false,
            Link::Pending(_) => true,
        }
    }
}

/// Strips the durability pending tag from a raw stored value. Readers dereference through this.
#[inline]
pub fn untagged<T>(raw: *mut T) -> *mut T {
    Link::decode(raw).ptr()
}
