//! Elementwise reduction kernels.
//!
//! Substrates that do not reduce natively fold contributions with
//! [`combine`], in ascending rank order so floating point results are the same
//! on every run.

use crate::datatype::DataType;
use crate::error::{Error, Result};
use crate::ReduceOp;

/// Combine `incoming` into `acc` elementwise: `acc[i] = acc[i] op incoming[i]`.
///
/// Both buffers hold units of `datatype.unit_size(op)` bytes. For location
/// operators a unit is a `(value, location)` pair; ties keep the smaller
/// location.
pub fn combine(datatype: DataType, op: ReduceOp, acc: &mut [u8], incoming: &[u8]) -> Result<()> {
    if acc.len() != incoming.len() {
        return Err(Error::InvalidBuffer(format!(
            "reduction buffers differ in length ({} vs {})",
            acc.len(),
            incoming.len()
        )));
    }
    let unit = datatype.unit_size(op);
    if acc.len() % unit != 0 {
        return Err(Error::InvalidCount(acc.len() as i64));
    }
    match datatype {
        DataType::Double => fold::<8, f64>(op, acc, incoming, f64::from_ne_bytes, f64::to_ne_bytes),
        DataType::Float => fold::<4, f32>(op, acc, incoming, f32::from_ne_bytes, f32::to_ne_bytes),
        DataType::Int => fold::<4, i32>(op, acc, incoming, i32::from_ne_bytes, i32::to_ne_bytes),
        DataType::UInt => fold::<4, u32>(op, acc, incoming, u32::from_ne_bytes, u32::to_ne_bytes),
        DataType::SizeT => fold::<{ std::mem::size_of::<usize>() }, usize>(
            op,
            acc,
            incoming,
            usize::from_ne_bytes,
            usize::to_ne_bytes,
        ),
        DataType::Char | DataType::Byte => {
            fold::<1, i8>(op, acc, incoming, i8::from_ne_bytes, i8::to_ne_bytes)
        }
        DataType::UChar | DataType::UByte => {
            fold::<1, u8>(op, acc, incoming, u8::from_ne_bytes, u8::to_ne_bytes)
        }
    }
    Ok(())
}

/// Arithmetic needed by the kernels. Integer arithmetic wraps.
trait Arith: Copy + PartialOrd {
    fn add(self, other: Self) -> Self;
    fn mul(self, other: Self) -> Self;
}

macro_rules! impl_arith_int {
    ($($ty:ty),*) => {
        $(impl Arith for $ty {
            fn add(self, other: Self) -> Self {
                self.wrapping_add(other)
            }
            fn mul(self, other: Self) -> Self {
                self.wrapping_mul(other)
            }
        })*
    };
}

macro_rules! impl_arith_float {
    ($($ty:ty),*) => {
        $(impl Arith for $ty {
            fn add(self, other: Self) -> Self {
                self + other
            }
            fn mul(self, other: Self) -> Self {
                self * other
            }
        })*
    };
}

impl_arith_int!(i8, u8, i32, u32, usize);
impl_arith_float!(f32, f64);

fn fold<const W: usize, T: Arith>(
    op: ReduceOp,
    acc: &mut [u8],
    incoming: &[u8],
    decode: fn([u8; W]) -> T,
    encode: fn(T) -> [u8; W],
) {
    let read = |bytes: &[u8]| -> T {
        let mut raw = [0u8; W];
        raw.copy_from_slice(bytes);
        decode(raw)
    };

    if op.is_loc() {
        for (a, b) in acc.chunks_exact_mut(2 * W).zip(incoming.chunks_exact(2 * W)) {
            let (av, al) = (read(&a[..W]), read(&a[W..]));
            let (bv, bl) = (read(&b[..W]), read(&b[W..]));
            let take_incoming = match op {
                ReduceOp::MinLoc => bv < av || (bv == av && bl < al),
                _ => bv > av || (bv == av && bl < al),
            };
            if take_incoming {
                a.copy_from_slice(b);
            }
        }
        return;
    }

    for (a, b) in acc.chunks_exact_mut(W).zip(incoming.chunks_exact(W)) {
        let (x, y) = (read(a), read(b));
        let r = match op {
            ReduceOp::Sum => x.add(y),
            ReduceOp::Prod => x.mul(y),
            ReduceOp::Max => {
                if y > x {
                    y
                } else {
                    x
                }
            }
            ReduceOp::Min => {
                if y < x {
                    y
                } else {
                    x
                }
            }
            ReduceOp::MinLoc | ReduceOp::MaxLoc => unreachable!(),
        };
        a.copy_from_slice(&encode(r));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::{as_bytes, as_bytes_mut, ValueLoc};

    fn reduce_pair<T: crate::datatype::Element>(
        dt: DataType,
        op: ReduceOp,
        mut a: Vec<T>,
        b: Vec<T>,
    ) -> Vec<T> {
        combine(dt, op, as_bytes_mut(&mut a), as_bytes(&b)).unwrap();
        a
    }

    #[test]
    fn sum_and_product() {
        assert_eq!(
            reduce_pair(DataType::Int, ReduceOp::Sum, vec![1i32, 2, 3], vec![10, 20, 30]),
            vec![11, 22, 33]
        );
        assert_eq!(
            reduce_pair(DataType::Double, ReduceOp::Prod, vec![1.5f64, -2.0], vec![2.0, 4.0]),
            vec![3.0, -8.0]
        );
    }

    #[test]
    fn min_and_max() {
        assert_eq!(
            reduce_pair(DataType::UInt, ReduceOp::Min, vec![5u32, 1], vec![3, 9]),
            vec![3, 1]
        );
        assert_eq!(
            reduce_pair(DataType::Float, ReduceOp::Max, vec![5.0f32, 1.0], vec![3.0, 9.0]),
            vec![5.0, 9.0]
        );
        assert_eq!(
            reduce_pair(DataType::Char, ReduceOp::Min, vec![-5i8, 7], vec![3, -9]),
            vec![-5, -9]
        );
    }

    #[test]
    fn integer_sum_wraps() {
        assert_eq!(
            reduce_pair(DataType::UChar, ReduceOp::Sum, vec![250u8], vec![10]),
            vec![4]
        );
    }

    #[test]
    fn min_loc_prefers_smaller_location_on_ties() {
        let a = vec![ValueLoc::new(2.0f64, 3.0), ValueLoc::new(1.0, 0.0)];
        let b = vec![ValueLoc::new(2.0f64, 1.0), ValueLoc::new(5.0, 1.0)];
        let r = reduce_pair(DataType::Double, ReduceOp::MinLoc, a, b);
        assert_eq!(r, vec![ValueLoc::new(2.0, 1.0), ValueLoc::new(1.0, 0.0)]);
    }

    #[test]
    fn max_loc_picks_largest_value() {
        let a = vec![ValueLoc::new(4i32, 0)];
        let b = vec![ValueLoc::new(7i32, 2)];
        let r = reduce_pair(DataType::Int, ReduceOp::MaxLoc, a, b);
        assert_eq!(r, vec![ValueLoc::new(7, 2)]);
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let mut a = [0u8; 8];
        let err = combine(DataType::Int, ReduceOp::Sum, &mut a, &[0u8; 4]).unwrap_err();
        assert!(matches!(err, Error::InvalidBuffer(_)));
    }

    #[test]
    fn partial_units_are_rejected() {
        let mut a = [0u8; 6];
        let err = combine(DataType::Int, ReduceOp::MinLoc, &mut a, &[0u8; 6]).unwrap_err();
        assert!(matches!(err, Error::InvalidCount(6)));
    }
}
