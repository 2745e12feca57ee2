//! Encoding of a write-back bucket's slot states.
//!
//! Every slot owns two bits of a `u16`, slot `i` living at bits `2i..2i+2`:
//!
//! - `00` free
//! - `01` pending, the slot is reserved but the link has not been published yet
//! - `10` busy, the link is published and its cache line awaits a write-back
//!
//! `11` is never produced.

pub type Bitmap = u16;

/// Number of slots in one bucket.
pub const ENTRIES: usize = 6;

pub const FREE: Bitmap = 0b00;
pub const PENDING: Bitmap = 0b01;
pub const BUSY: Bitmap = 0b10;

const SLOT_MASK: Bitmap = 0b11;

/// The high bit of every slot, set exactly on the busy slots.
const BUSY_BITS: Bitmap = 0b1010_1010_1010;

const ALL_SLOTS: Bitmap = 0b1111_1111_1111;

#[inline]
const fn shift(pos: usize) -> u32 {
    2 * pos as u32
}

#[inline]
pub const fn get(bmap: Bitmap, pos: usize) -> Bitmap {
    (bmap >> shift(pos)) & SLOT_MASK
}

#[inline]
pub const fn mark(bmap: Bitmap, pos: usize, state: Bitmap) -> Bitmap {
    (bmap & !(SLOT_MASK << shift(pos))) | (state << shift(pos))
}

#[inline]
pub const fn is_free(bmap: Bitmap, pos: usize) -> bool {
    get(bmap, pos) == FREE
}

#[inline]
pub const fn is_pending(bmap: Bitmap, pos: usize) -> bool {
    get(bmap, pos) == PENDING
}

#[inline]
pub const fn is_busy(bmap: Bitmap, pos: usize) -> bool {
    get(bmap, pos) == BUSY
}

/// Returns the busy slots of `bmap`, still in bitmap encoding.
#[inline]
pub const fn busy_slots(bmap: Bitmap) -> Bitmap {
    bmap & BUSY_BITS
}

#[inline]
pub const fn has_busy(bmap: Bitmap) -> bool {
    busy_slots(bmap) != 0
}

/// Every busy slot becomes free, pending slots are untouched.
#[inline]
pub const fn clear_busy(bmap: Bitmap) -> Bitmap {
    bmap & !BUSY_BITS
}

#[inline]
pub const fn all_free(bmap: Bitmap) -> bool {
    bmap & ALL_SLOTS == 0
}

/// Returns the lowest free slot, or None if every slot is taken.
#[inline]
pub fn find_free(bmap: Bitmap) -> Option<usize> {
    (0..ENTRIES).find(|&pos| is_free(bmap, pos))
}

/// Iterates over the positions of the slots set in a `busy_slots` mask.
#[inline]
pub fn positions(mask: Bitmap) -> impl Iterator<Item = usize> {
    (0..ENTRIES).filter(move |&pos| is_busy(mask, pos))
}
