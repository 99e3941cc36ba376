use flextree::{Communicator, FlexConfig};
use std::sync::Arc;

/// Helper: run a collective operation across N communicators concurrently
/// over an in-process mesh.
pub async fn run_collective<F, Fut>(world_size: u32, f: F)
where
    F: Fn(Arc<Communicator>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    run_collective_with(world_size, FlexConfig::default(), f).await;
}

/// Like [`run_collective`] with a custom config.
pub async fn run_collective_with<F, Fut>(world_size: u32, config: FlexConfig, f: F)
where
    F: Fn(Arc<Communicator>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let comms = Communicator::bootstrap_local(world_size, config);
    run_on(comms, f).await;
}

/// Run `f` once per communicator, each on its own task.
/// Keeps all communicators alive until every task completes.
pub async fn run_on<F, Fut>(comms: Vec<Communicator>, f: F)
where
    F: Fn(Arc<Communicator>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let comms: Vec<Arc<Communicator>> = comms.into_iter().map(Arc::new).collect();
    let f = Arc::new(f);
    let mut handles = Vec::new();
    for c in &comms {
        let c = Arc::clone(c);
        let f = Arc::clone(&f);
        handles.push(tokio::spawn(async move { f(c).await }));
    }
    for h in handles {
        h.await.unwrap();
    }
}

/// `[rank, rank + 1, …]` as i64, the classic allreduce fixture.
pub fn ramp(rank: u32, count: usize) -> Vec<i64> {
    (0..count as i64).map(|i| rank as i64 + i).collect()
}

/// Elementwise sum of `ramp(r, count)` over every rank.
pub fn ramp_sum(world_size: u32, count: usize) -> Vec<i64> {
    (0..count as i64)
        .map(|i| (0..world_size as i64).map(|r| r + i).sum())
        .collect()
}
