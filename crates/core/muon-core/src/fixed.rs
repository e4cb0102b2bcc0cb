//! 17.14 fixed-point arithmetic.
//!
//! The MLFQS policy computes with real numbers (`load_avg`, `recent_cpu`)
//! on a CPU without floating point in kernel mode. Values are represented
//! as integers scaled by `F = 2^14`: the lowest 14 bits hold the fraction,
//! the rest the signed integer part.

use core::fmt;
use core::ops::{Add, AddAssign, Neg, Sub, SubAssign};

/// One fixed-point unit: 2^14.
const F: i64 = 1 << 14;

/// A signed 17.14 fixed-point number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct Fixed(i64);

impl Fixed {
    /// Zero.
    pub const ZERO: Self = Self(0);
    /// One.
    pub const ONE: Self = Self(F);

    /// Converts an integer to fixed point.
    pub const fn from_int(n: i64) -> Self {
        Self(n * F)
    }

    /// Creates the fixed-point value `num / den`.
    ///
    /// `den` must be non-zero.
    pub const fn from_ratio(num: i64, den: i64) -> Self {
        Self(num * F / den)
    }

    /// Converts to an integer, truncating toward zero.
    pub const fn trunc(self) -> i64 {
        self.0 / F
    }

    /// Converts to an integer, rounding to nearest (ties away from zero).
    pub const fn round(self) -> i64 {
        if self.0 >= 0 {
            (self.0 + F / 2) / F
        } else {
            (self.0 - F / 2) / F
        }
    }

    /// Multiplies two fixed-point values.
    ///
    /// Widens to 128 bits internally so the intermediate product cannot
    /// overflow.
    pub const fn mul(self, other: Self) -> Self {
        Self((self.0 as i128 * other.0 as i128 / F as i128) as i64)
    }

    /// Divides by another fixed-point value.
    pub const fn div(self, other: Self) -> Self {
        Self((self.0 as i128 * F as i128 / other.0 as i128) as i64)
    }

    /// Multiplies by an integer.
    pub const fn mul_int(self, n: i64) -> Self {
        Self(self.0 * n)
    }

    /// Divides by an integer.
    pub const fn div_int(self, n: i64) -> Self {
        Self(self.0 / n)
    }

    /// Adds an integer.
    pub const fn add_int(self, n: i64) -> Self {
        Self(self.0 + n * F)
    }

    /// Subtracts an integer.
    pub const fn sub_int(self, n: i64) -> Self {
        Self(self.0 - n * F)
    }

    /// Returns the raw scaled representation.
    pub const fn raw(self) -> i64 {
        self.0
    }
}

impl Add for Fixed {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign for Fixed {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for Fixed {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl SubAssign for Fixed {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl Neg for Fixed {
    type Output = Self;
    fn neg(self) -> Self {
        Self(-self.0)
    }
}

impl fmt::Display for Fixed {
    /// Formats with two decimal places (enough for `load_avg` output).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hundredths = self.mul_int(100).round();
        let sign = if hundredths < 0 { "-" } else { "" };
        let mag = hundredths.abs();
        write!(f, "{sign}{}.{:02}", mag / 100, mag % 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_roundtrip() {
        assert_eq!(Fixed::from_int(5).trunc(), 5);
        assert_eq!(Fixed::from_int(-5).trunc(), -5);
        assert_eq!(Fixed::from_int(0), Fixed::ZERO);
    }

    #[test]
    fn trunc_goes_toward_zero() {
        // 7/2 = 3.5 -> 3, -7/2 = -3.5 -> -3
        assert_eq!(Fixed::from_ratio(7, 2).trunc(), 3);
        assert_eq!(Fixed::from_ratio(-7, 2).trunc(), -3);
    }

    #[test]
    fn round_goes_to_nearest() {
        assert_eq!(Fixed::from_ratio(7, 2).round(), 4);
        assert_eq!(Fixed::from_ratio(-7, 2).round(), -4);
        assert_eq!(Fixed::from_ratio(10, 3).round(), 3);
        assert_eq!(Fixed::from_ratio(1, 4).round(), 0);
    }

    #[test]
    fn add_sub() {
        let a = Fixed::from_int(3);
        let b = Fixed::from_ratio(1, 2);
        assert_eq!((a + b).round(), 4); // 3.5 rounds away from zero
        assert_eq!((a - b).trunc(), 2); // 2.5 truncates
        assert_eq!((a + b) - b, a);
    }

    #[test]
    fn mul_div() {
        let half = Fixed::from_ratio(1, 2);
        assert_eq!(half.mul(half), Fixed::from_ratio(1, 4));
        assert_eq!(Fixed::from_int(10).div(Fixed::from_int(4)), Fixed::from_ratio(10, 4));
        assert_eq!(half.mul_int(6), Fixed::from_int(3));
        assert_eq!(Fixed::from_int(3).div_int(2), Fixed::from_ratio(3, 2));
    }

    #[test]
    fn int_mixing() {
        assert_eq!(Fixed::from_int(2).add_int(3), Fixed::from_int(5));
        assert_eq!(Fixed::from_int(2).sub_int(3), Fixed::from_int(-1));
    }

    #[test]
    fn mul_survives_large_intermediates() {
        // Squaring a value near the top of the integer range would
        // overflow a 64-bit intermediate without widening.
        let big = Fixed::from_int(1 << 30);
        assert_eq!(big.mul(Fixed::ONE), big);
    }

    #[test]
    fn load_avg_decay_coefficient() {
        // 59/60 as used by the per-second load_avg update.
        let c = Fixed::from_ratio(59, 60);
        assert_eq!(c.mul_int(60).round(), 59);
    }

    #[test]
    fn display_two_decimals() {
        assert_eq!(alloc::format!("{}", Fixed::from_ratio(3, 2)), "1.50");
        assert_eq!(alloc::format!("{}", Fixed::from_int(2)), "2.00");
    }
}
