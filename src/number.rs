// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Native numeric types that can be reduced.

use std::fmt::Debug;
use std::iter::Sum;
use std::ops::Add;

/// A native numeric type that reductions operate on.
///
/// Additions use the type's own arithmetic, without any extra care for
/// precision or overflow.
pub trait Number:
    Copy
    + Default
    + Debug
    + PartialEq
    + PartialOrd
    + Add<Output = Self>
    + Sum
    + Send
    + Sync
    + 'static
{
    /// Converts the value to a [`f64`], to compute averages.
    fn as_f64(self) -> f64;
}

macro_rules! impl_number {
    ( $( $t:ty ),* ) => {
        $(
            impl Number for $t {
                #[inline(always)]
                fn as_f64(self) -> f64 {
                    self as f64
                }
            }
        )*
    };
}

impl_number!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64);
