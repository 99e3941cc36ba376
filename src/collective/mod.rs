mod barrier;
mod flextree;
mod helpers;
mod lonely;

pub use barrier::barrier;

pub(crate) use flextree::flextree_allreduce;
pub(crate) use helpers::{TagKind, collective_recv, collective_send, make_tag, wait_all};
