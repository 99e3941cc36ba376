use crate::error::Result;
use crate::topology::StagePlan;
use crate::types::{DataType, Element, ReduceOp, SendBuf};

use super::Communicator;

impl Communicator {
    /// AllReduce with the stage plan chosen by [`default_plan`].
    ///
    /// `recv` (and `send`, when given) must hold exactly
    /// `count * dtype.size_in_bytes()` bytes. Returns once every rank holds
    /// the reduction of all contributions.
    ///
    /// [`default_plan`]: Communicator::default_plan
    pub async fn all_reduce(
        &self,
        send: SendBuf<'_>,
        recv: &mut [u8],
        count: usize,
        dtype: DataType,
        op: ReduceOp,
    ) -> Result<()> {
        let plan = self.default_plan()?;
        self.all_reduce_with_plan(send, recv, count, dtype, op, &plan)
            .await
    }

    /// AllReduce following an explicit radix factorization.
    ///
    /// Every rank must pass the same plan.
    pub async fn all_reduce_with_plan(
        &self,
        send: SendBuf<'_>,
        recv: &mut [u8],
        count: usize,
        dtype: DataType,
        op: ReduceOp,
        plan: &StagePlan,
    ) -> Result<()> {
        crate::collective::flextree_allreduce(self, send, recv, count, dtype, op, plan).await
    }

    /// AllReduce in-place on a typed slice.
    pub async fn all_reduce_slice<T: Element>(&self, data: &mut [T], op: ReduceOp) -> Result<()> {
        let count = data.len();
        // SAFETY: `Element` is sealed to plain primitives with no padding, and
        // the kernels only ever write valid bit patterns of `T` back.
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(data.as_mut_ptr().cast::<u8>(), std::mem::size_of_val(data))
        };
        self.all_reduce(SendBuf::InPlace, bytes, count, T::DTYPE, op)
            .await
    }

    /// The plan used by [`all_reduce`](Communicator::all_reduce).
    ///
    /// Explicit `stages` from the config win; otherwise the planner picks
    /// radices up to `max_radix`.
    pub fn default_plan(&self) -> Result<StagePlan> {
        let world = self.world_size() as usize;
        let cfg = self.config();
        match &cfg.stages {
            Some(stages) => StagePlan::new(world, stages.clone(), cfg.num_lonely),
            None => StagePlan::plan(world, cfg.max_radix),
        }
    }
}
