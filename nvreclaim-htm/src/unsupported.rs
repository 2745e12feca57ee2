#[inline]
fn unsupported() -> ! {
    panic!("target CPU does not support hardware transactional memory")
}

#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
pub struct BeginCode(u32);

impl BeginCode {
    #[inline]
    pub fn is_started(self) -> bool {
        false
    }

    #[inline]
    pub fn is_explicit(self) -> bool {
        false
    }

    #[inline]
    pub fn is_retry(self) -> bool {
        false
    }

    #[inline]
    pub fn is_conflict(self) -> bool {
        false
    }

    #[inline]
    pub fn is_capacity(self) -> bool {
        false
    }
}

#[inline]
pub const fn htm_supported() -> bool {
    false
}

#[inline]
pub unsafe fn begin() -> BeginCode {
    unsupported()
}

#[inline]
pub unsafe fn end() {
    unsupported()
}

#[inline]
pub unsafe fn abort() -> ! {
    unsupported()
}

#[inline]
pub unsafe fn test() -> bool {
    unsupported()
}
