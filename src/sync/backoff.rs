/*!
    Exponential pause-spin backoff for PMwCAS retry loops, grounded on the
    `SPINLOCK_BACKOFF` macro: spin `count` pause instructions, then double
    `count` up to a ceiling.
*/

use core::hint;

const BACKOFF_MIN: u32 = 4;
const BACKOFF_MAX: u32 = 128;

pub struct Backoff {
    count: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

impl Backoff {
    pub const fn new() -> Self {
        Self { count: BACKOFF_MIN }
    }

    /// spin, then grow the spin count for next time
    pub fn spin(&mut self) {
        for _ in 0..self.count {
            hint::spin_loop();
        }
        if self.count < BACKOFF_MAX {
            self.count += self.count;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_and_caps() {
        let mut b = Backoff::new();
        assert_eq!(b.count, BACKOFF_MIN);
        for _ in 0..20 {
            b.spin();
        }
        assert_eq!(b.count, BACKOFF_MAX);
    }
}
