pub mod client;
pub mod collective;
pub mod config;
pub mod error;
pub mod partition;
pub mod reduce;
pub(crate) mod reduce_types;
pub mod scratch;
pub mod topology;
pub mod transport;
pub mod types;

pub use client::{Communicator, SyncCommunicator};
pub use config::FlexConfig;
pub use error::{FlexError, Result};
pub use partition::PartitionContext;
pub use reduce::MAX_REDUCE_INPUTS;
pub use scratch::ScratchBuffer;
pub use topology::{Operation, OperationSet, Role, StagePlan, Topology};
pub use transport::{LocalMesh, LocalTransport, TcpTransport, Transport};
pub use types::{DataType, Element, Rank, ReduceOp, SendBuf};
