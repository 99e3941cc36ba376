//! FlexTree allreduce across 6 ranks.
//!
//! Each rank starts with its own data. The plan reduces in two stages
//! (radix 3, then radix 2); afterwards every rank holds the element-wise sum
//! of all inputs.
//!
//! ```bash
//! cargo run --example allreduce
//! ```

use flextree::{Communicator, FlexConfig, ReduceOp};
use std::sync::Arc;

#[tokio::main]
async fn main() -> flextree::Result<()> {
    let world_size = 6u32;
    let config = FlexConfig {
        stages: Some(vec![3, 2]),
        ..FlexConfig::default()
    };
    let clients: Vec<Arc<Communicator>> = Communicator::bootstrap_local(world_size, config)
        .into_iter()
        .map(Arc::new)
        .collect();

    println!("{}", clients[0].default_plan()?.topology(0).describe());

    let count = 8usize;

    // rank 0: [0.0, 0.0, ...], rank 1: [1.0, 1.0, ...], etc.
    let mut handles = Vec::new();
    for client in &clients {
        let c = Arc::clone(client);
        let rank = c.rank();
        handles.push(tokio::spawn(async move {
            let mut data = vec![rank as f32; count];
            c.all_reduce_slice(&mut data, ReduceOp::Sum).await?;
            // 0 + 1 + 2 + 3 + 4 + 5 = 15.0
            flextree::Result::Ok((rank, data))
        }));
    }

    for h in handles {
        let (rank, data) = h
            .await
            .map_err(|e| flextree::FlexError::transport_with_source("join", e))??;
        println!("rank {rank}: {data:?}");
    }

    Ok(())
}
