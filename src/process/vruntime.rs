// Virtual runtime counter split into two 32-bit halves
use core::cmp::Ordering;
use core::fmt;

/// A 64-bit virtual runtime kept as `{high, low}` 32-bit words.
///
/// Plain 32-bit accumulators overflow after a few hours of ticks; the pair is
/// compared lexicographically and never wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ExtendedCounter {
    pub high: u32,
    pub low: u32,
}

impl ExtendedCounter {
    pub const ZERO: Self = Self { high: 0, low: 0 };
    pub const MAX: Self = Self {
        high: u32::MAX,
        low: u32::MAX,
    };

    pub const fn new(high: u32, low: u32) -> Self {
        Self { high, low }
    }

    pub const fn from_u64(value: u64) -> Self {
        Self {
            high: (value >> 32) as u32,
            low: value as u32,
        }
    }

    pub const fn as_u64(self) -> u64 {
        ((self.high as u64) << 32) | self.low as u64
    }

    pub fn is_zero(self) -> bool {
        self == Self::ZERO
    }

    /// Three-way comparison: high words first, low words break ties.
    pub fn compare(self, other: Self) -> Ordering {
        match self.high.cmp(&other.high) {
            Ordering::Equal => self.low.cmp(&other.low),
            ord => ord,
        }
    }

    /// `self - rhs`, clamped at zero.
    ///
    /// The low words subtract modulo 2^32; when they underflow one unit is
    /// borrowed from the high word.
    pub fn saturating_sub(self, rhs: Self) -> Self {
        let (low, borrow) = self.low.overflowing_sub(rhs.low);
        let high = self
            .high
            .checked_sub(rhs.high)
            .and_then(|h| h.checked_sub(borrow as u32));
        match high {
            Some(high) => Self { high, low },
            None => Self::ZERO,
        }
    }

    /// `self + amount`, clamped at `MAX`.
    pub fn saturating_add(self, amount: u64) -> Self {
        let rhs = Self::from_u64(amount);
        let (low, carry) = self.low.overflowing_add(rhs.low);
        let high = self
            .high
            .checked_add(rhs.high)
            .and_then(|h| h.checked_add(carry as u32));
        match high {
            Some(high) => Self { high, low },
            None => Self::MAX,
        }
    }
}

impl Ord for ExtendedCounter {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(*other)
    }
}

impl PartialOrd for ExtendedCounter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ExtendedCounter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_u64())
    }
}
