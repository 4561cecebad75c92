use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Sub, SubAssign};

use serde::{Deserialize, Serialize};

/// Anything that can be stored in a [`Tensor`](crate::Tensor).
///
/// Covers the label type (`u8`) as well as the float types. Layout operations
/// (crop, flip, pad, resample by nearest neighbour) only need `Element`.
pub trait Element:
    Copy
    + Clone
    + Default
    + PartialEq
    + PartialOrd
    + fmt::Debug
    + Send
    + Sync
    + Serialize
    + for<'de> Deserialize<'de>
    + 'static
{
    fn from_f64(v: f64) -> Self;
    fn to_f64(self) -> f64;
}

impl Element for u8 {
    /// Rounds and saturates into `0..=255`.
    #[inline]
    fn from_f64(v: f64) -> Self {
        v.round().clamp(0.0, 255.0) as u8
    }
    #[inline]
    fn to_f64(self) -> f64 {
        self as f64
    }
}

/// Numeric element types with arithmetic. Supports `f32` and `f64`.
pub trait Float:
    Element
    + fmt::Display
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + AddAssign
    + SubAssign
    + MulAssign
    + DivAssign
    + Sum
{
    const ZERO: Self;
    const ONE: Self;
    const EPSILON: Self;
    const INFINITY: Self;
    const NEG_INFINITY: Self;

    fn from_usize(v: usize) -> Self;

    fn abs(self) -> Self;
    fn sqrt(self) -> Self;
    fn exp(self) -> Self;
    fn ln(self) -> Self;
    fn powf(self, n: Self) -> Self;
    fn floor(self) -> Self;
    fn round(self) -> Self;
    fn max(self, other: Self) -> Self;
    fn min(self, other: Self) -> Self;
    fn is_nan(self) -> bool;
}

macro_rules! impl_float {
    ($t:ident) => {
        impl Element for $t {
            #[inline] fn from_f64(v: f64) -> Self { v as $t }
            #[inline] fn to_f64(self) -> f64 { self as f64 }
        }

        impl Float for $t {
            const ZERO: Self = 0.0;
            const ONE: Self = 1.0;
            const EPSILON: Self = $t::EPSILON;
            const INFINITY: Self = $t::INFINITY;
            const NEG_INFINITY: Self = $t::NEG_INFINITY;

            #[inline] fn from_usize(v: usize) -> Self { v as $t }
            #[inline] fn abs(self) -> Self { $t::abs(self) }
            #[inline] fn sqrt(self) -> Self { $t::sqrt(self) }
            #[inline] fn exp(self) -> Self { $t::exp(self) }
            #[inline] fn ln(self) -> Self { $t::ln(self) }
            #[inline] fn powf(self, n: Self) -> Self { $t::powf(self, n) }
            #[inline] fn floor(self) -> Self { $t::floor(self) }
            #[inline] fn round(self) -> Self { $t::round(self) }
            #[inline] fn max(self, other: Self) -> Self { $t::max(self, other) }
            #[inline] fn min(self, other: Self) -> Self { $t::min(self, other) }
            #[inline] fn is_nan(self) -> bool { $t::is_nan(self) }
        }
    };
}

impl_float!(f32);
impl_float!(f64);
