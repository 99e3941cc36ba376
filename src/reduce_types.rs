//! Reduction trait machinery shared by the byte-slice kernels in `reduce.rs`.

use crate::types::ReduceOp;

// ── Bool byte newtype ──────────────────────────────────────────────────

/// One-byte boolean as laid out in memory (`0` false, anything else true).
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct BoolByte(pub u8);

// ── Reducible trait ────────────────────────────────────────────────────

/// Types the kernels can combine. Callers check [`DataType::supports`]
/// before dispatching, so `Band` never reaches a floating-point impl.
///
/// [`DataType::supports`]: crate::types::DataType::supports
pub(crate) trait Reducible: Copy + Send + Sync + 'static {
    fn reduce(a: Self, b: Self, op: ReduceOp) -> Self;
}

macro_rules! impl_reducible {
    (int: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum => a.wrapping_add(b),
                        ReduceOp::Band => a & b,
                    }
                }
            }
        )*
    };
    (float: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum => a + b,
                        ReduceOp::Band => unreachable!(
                            concat!("band dispatched for ", stringify!($ty))
                        ),
                    }
                }
            }
        )*
    };
}

impl_reducible!(int: i8, i16, i32, i64, u8, u16, u32, u64);
impl_reducible!(float: f32, f64);

impl Reducible for BoolByte {
    #[inline]
    fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
        match op {
            // Saturating sum of booleans is logical OR.
            ReduceOp::Sum => BoolByte(((a.0 | b.0) != 0) as u8),
            ReduceOp::Band => unreachable!("band dispatched for bool"),
        }
    }
}

// ── NeBytes trait ──────────────────────────────────────────────────────

/// Read/write a value from/to a native-endian byte slice (alignment-safe).
pub(crate) trait NeBytes: Sized {
    fn read_ne(bytes: &[u8]) -> Self;
    fn write_ne(self, bytes: &mut [u8]);
}

macro_rules! impl_ne_bytes {
    ($($ty:ty),*) => {
        $(
            impl NeBytes for $ty {
                #[inline]
                fn read_ne(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    Self::from_ne_bytes(raw)
                }
                #[inline]
                fn write_ne(self, bytes: &mut [u8]) {
                    bytes.copy_from_slice(&self.to_ne_bytes());
                }
            }
        )*
    };
}

impl_ne_bytes!(i8, i16, i32, i64, u8, u16, u32, u64, f32, f64);

impl NeBytes for BoolByte {
    #[inline]
    fn read_ne(bytes: &[u8]) -> Self {
        BoolByte(bytes[0])
    }
    #[inline]
    fn write_ne(self, bytes: &mut [u8]) {
        bytes[0] = self.0;
    }
}
