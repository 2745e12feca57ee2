#[macro_use]
pub mod optim;

pub mod slot_bitmap;
pub mod ts_vec;
pub mod write_back_lock;
