//! Element-wise n-ary reduction kernels on byte slices.
//!
//! One generic fold per element type, dispatched once on [`DataType`].
//! Inputs are read-only and never alias the output, so large blocks are
//! split across the rayon pool.

use crate::reduce_types::{BoolByte, NeBytes, Reducible};
use crate::types::{DataType, ReduceOp};
use rayon::prelude::*;

/// Largest number of buffers a single kernel call may combine.
pub const MAX_REDUCE_INPUTS: usize = 20;

/// Smallest per-thread chunk worth handing to rayon.
const MIN_PAR_CHUNK_BYTES: usize = 64 * 1024;

/// Combine `inputs` element-wise into `output`.
///
/// Fewer than two inputs is a no-op; the caller is expected to have seeded
/// `output` already. `parallel_threshold` is the output size in bytes from
/// which the fold runs on the rayon pool.
///
/// # Panics
/// More than [`MAX_REDUCE_INPUTS`] inputs, an unsupported `(dtype, op)` pair,
/// or inputs whose length differs from `output`. These indicate a broken
/// topology, not a recoverable condition.
pub fn reduce(
    op: ReduceOp,
    dtype: DataType,
    inputs: &[&[u8]],
    output: &mut [u8],
    parallel_threshold: usize,
) {
    if inputs.len() < 2 {
        return;
    }
    if inputs.len() > MAX_REDUCE_INPUTS {
        tracing::error!(inputs = inputs.len(), "reduction arity out of range");
        panic!(
            "cannot reduce {} buffers at once (limit {MAX_REDUCE_INPUTS})",
            inputs.len()
        );
    }
    if !dtype.supports(op) {
        tracing::error!(%dtype, %op, "unsupported reduction");
        panic!("unsupported data type {dtype} for {op}");
    }
    let elem = dtype.size_in_bytes();
    assert!(
        output.len() % elem == 0,
        "output of {} bytes is not a whole number of {dtype} elements",
        output.len()
    );
    for input in inputs {
        assert_eq!(input.len(), output.len(), "reduction input length mismatch");
    }

    match dtype {
        DataType::I8 => reduce_typed::<i8>(op, inputs, output, parallel_threshold),
        DataType::U8 => reduce_typed::<u8>(op, inputs, output, parallel_threshold),
        DataType::I16 => reduce_typed::<i16>(op, inputs, output, parallel_threshold),
        DataType::U16 => reduce_typed::<u16>(op, inputs, output, parallel_threshold),
        DataType::I32 => reduce_typed::<i32>(op, inputs, output, parallel_threshold),
        DataType::U32 => reduce_typed::<u32>(op, inputs, output, parallel_threshold),
        DataType::I64 => reduce_typed::<i64>(op, inputs, output, parallel_threshold),
        DataType::U64 => reduce_typed::<u64>(op, inputs, output, parallel_threshold),
        DataType::F32 => reduce_typed::<f32>(op, inputs, output, parallel_threshold),
        DataType::F64 => reduce_typed::<f64>(op, inputs, output, parallel_threshold),
        DataType::Bool => reduce_typed::<BoolByte>(op, inputs, output, parallel_threshold),
    }
}

fn reduce_typed<T: Reducible + NeBytes>(
    op: ReduceOp,
    inputs: &[&[u8]],
    output: &mut [u8],
    parallel_threshold: usize,
) {
    let t_size = std::mem::size_of::<T>();
    if output.len() < parallel_threshold.max(2 * MIN_PAR_CHUNK_BYTES) {
        fold_into::<T>(op, inputs, 0, output);
        return;
    }

    let per_thread = output.len().div_ceil(rayon::current_num_threads());
    let chunk = per_thread.max(MIN_PAR_CHUNK_BYTES).next_multiple_of(t_size);
    output
        .par_chunks_mut(chunk)
        .enumerate()
        .for_each(|(i, out)| fold_into::<T>(op, inputs, i * chunk, out));
}

/// `out[k] = inputs[0][offset + k] ⊕ … ⊕ inputs[n-1][offset + k]`.
fn fold_into<T: Reducible + NeBytes>(op: ReduceOp, inputs: &[&[u8]], offset: usize, out: &mut [u8]) {
    let t_size = std::mem::size_of::<T>();
    for (i, dst) in out.chunks_exact_mut(t_size).enumerate() {
        let at = offset + i * t_size;
        let mut acc = T::read_ne(&inputs[0][at..at + t_size]);
        for input in &inputs[1..] {
            acc = T::reduce(acc, T::read_ne(&input[at..at + t_size]), op);
        }
        acc.write_ne(dst);
    }
}
