/// Rank of a participant in a communicator group (0-indexed).
pub type Rank = u32;

/// Element types the reduction kernels can dispatch on.
///
/// Every variant resolves to a fixed in-memory layout in native byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    I8 = 0,
    U8 = 1,
    I16 = 2,
    U16 = 3,
    I32 = 4,
    U32 = 5,
    I64 = 6,
    U64 = 7,
    F32 = 8,
    F64 = 9,
    Bool = 10,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size_in_bytes(self) -> usize {
        match self {
            DataType::I8 | DataType::U8 | DataType::Bool => 1,
            DataType::I16 | DataType::U16 => 2,
            DataType::I32 | DataType::U32 | DataType::F32 => 4,
            DataType::I64 | DataType::U64 | DataType::F64 => 8,
        }
    }

    /// Human-readable name.
    pub const fn name(self) -> &'static str {
        match self {
            DataType::I8 => "i8",
            DataType::U8 => "u8",
            DataType::I16 => "i16",
            DataType::U16 => "u16",
            DataType::I32 => "i32",
            DataType::U32 => "u32",
            DataType::I64 => "i64",
            DataType::U64 => "u64",
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::Bool => "bool",
        }
    }

    /// Whether the kernels implement `op` for this type.
    ///
    /// Bitwise AND is defined for the integer types only.
    pub const fn supports(self, op: ReduceOp) -> bool {
        match op {
            ReduceOp::Sum => true,
            ReduceOp::Band => !matches!(self, DataType::F32 | DataType::F64 | DataType::Bool),
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Combination operators for allreduce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    /// Element-wise sum across ranks (wrapping for integers, OR for bool).
    Sum,
    /// Element-wise bitwise AND across ranks.
    Band,
}

impl std::fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReduceOp::Sum => f.write_str("sum"),
            ReduceOp::Band => f.write_str("band"),
        }
    }
}

/// Source of an allreduce's local contribution.
#[derive(Debug, Clone, Copy)]
pub enum SendBuf<'a> {
    /// The receive buffer already holds the local contribution.
    InPlace,
    /// Separate input buffer, same length as the receive buffer.
    Buffer(&'a [u8]),
}

mod sealed {
    pub trait Sealed {}
}

/// Rust primitive types that map one-to-one onto a [`DataType`].
///
/// Sealed: the typed collectives reinterpret `[T]` as raw bytes, which is
/// only sound for the plain-old-data primitives listed here.
pub trait Element: sealed::Sealed + Copy + Send + Sync + 'static {
    const DTYPE: DataType;
}

macro_rules! impl_element {
    ($($ty:ty => $dt:ident),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}
            impl Element for $ty {
                const DTYPE: DataType = DataType::$dt;
            }
        )*
    };
}

impl_element!(
    i8 => I8,
    u8 => U8,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f32 => F32,
    f64 => F64,
    bool => Bool,
);
