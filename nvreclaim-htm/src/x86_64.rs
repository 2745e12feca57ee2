use core::arch::x86_64::{
    _xabort, _xabort_code, _xbegin, _xend, _xtest, _XABORT_CAPACITY, _XABORT_CONFLICT,
    _XABORT_EXPLICIT, _XABORT_RETRY, _XBEGIN_STARTED,
};

/// The code passed to `xabort` for every explicit abort issued through `HardwareTx::abort`.
const EXPLICIT_ABORT: u32 = 0xA5;

lazy_static::lazy_static! {
    static ref RTM: bool = is_x86_feature_detected!("rtm");
}

#[inline]
pub fn htm_supported() -> bool {
    *RTM
}

#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
pub struct BeginCode(u32);

impl BeginCode {
    #[inline]
    pub fn is_started(self) -> bool {
        self.0 == _XBEGIN_STARTED
    }

    #[inline]
    pub fn is_explicit(self) -> bool {
        self.0 & _XABORT_EXPLICIT != 0 && _xabort_code(self.0) == EXPLICIT_ABORT
    }

    #[inline]
    pub fn is_retry(self) -> bool {
        self.0 & _XABORT_RETRY != 0
    }

    #[inline]
    pub fn is_conflict(self) -> bool {
        self.0 & _XABORT_CONFLICT != 0
    }

    #[inline]
    pub fn is_capacity(self) -> bool {
        self.0 & _XABORT_CAPACITY != 0
    }
}

#[inline]
#[target_feature(enable = "rtm")]
pub unsafe fn begin() -> BeginCode {
    BeginCode(_xbegin())
}

#[inline]
#[target_feature(enable = "rtm")]
pub unsafe fn end() {
    _xend()
}

#[inline]
#[target_feature(enable = "rtm")]
pub unsafe fn abort() -> ! {
    _xabort::<EXPLICIT_ABORT>();
    // xabort outside of a transaction is a no-op.
    unreachable!("`xabort` executed outside of a hardware transaction")
}

#[inline]
#[target_feature(enable = "rtm")]
pub unsafe fn test() -> bool {
    _xtest() != 0
}
