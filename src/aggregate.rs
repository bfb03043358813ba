//! Aggregate value types and their combine operations

use crate::codec::PageCodec;
use crate::error::Result;

/// A value that can be folded with another value sharing its key.
///
/// `combine` must be associative and commutative: operators merge occurrences
/// in map-iteration order, which differs between runs.
pub trait Aggregate: PageCodec + Clone {
    fn combine(&self, other: &Self) -> Self;
}

macro_rules! additive_aggregate {
    ($($ty:ty),*) => {
        $(
            impl Aggregate for $ty {
                fn combine(&self, other: &Self) -> Self {
                    self.wrapping_add(*other)
                }
            }
        )*
    };
}

additive_aggregate!(u32, i32, u64, i64);

impl Aggregate for f64 {
    fn combine(&self, other: &Self) -> Self {
        self + other
    }
}

/// Running mean: carries the sum and the number of contributions.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Avg {
    pub sum: f64,
    pub count: u64,
}

impl Avg {
    pub fn of(value: f64) -> Self {
        Self { sum: value, count: 1 }
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

impl PageCodec for Avg {
    fn encoded_len(&self) -> usize {
        16
    }

    fn encode(&self, out: &mut [u8]) {
        self.sum.encode(&mut out[..8]);
        self.count.encode(&mut out[8..16]);
    }

    fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let (sum, a) = f64::decode(bytes)?;
        let (count, b) = u64::decode(&bytes[a..])?;
        Ok((Self { sum, count }, a + b))
    }
}

impl Aggregate for Avg {
    fn combine(&self, other: &Self) -> Self {
        Self {
            sum: self.sum + other.sum,
            count: self.count + other.count,
        }
    }
}
