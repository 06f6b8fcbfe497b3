pub(crate) mod counter;
pub(crate) mod error;
pub(crate) mod version;

use std::{num::NonZeroUsize, thread::available_parallelism as std_available_parallelism};

pub(crate) fn available_parallelism() -> usize {
    std_available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

// The smallest `p` with `2^p >= n`.
pub(crate) fn ceil_log2(n: usize) -> u32 {
    if n <= 1 {
        0
    } else {
        usize::BITS - (n - 1).leading_zeros()
    }
}
