mod date_range;
mod sequence;

pub use date_range::*;
pub use sequence::*;
