use super::helpers::run_collective;
use flextree::ReduceOp;

#[tokio::test]
async fn test_split_two_groups() {
    run_collective(4, |c| async move {
        let rank = c.rank();
        let color = if rank < 2 { 0u32 } else { 1u32 };
        let sub = c.split(color, rank).await.unwrap();
        assert_eq!(sub.world_size(), 2, "rank {rank}: sub world size wrong");
        assert_eq!(sub.rank(), rank % 2);

        let mut data = vec![(rank + 1) as f32; 4];
        sub.all_reduce_slice(&mut data, ReduceOp::Sum).await.unwrap();

        // Group 0 (ranks 0,1): 1 + 2 = 3
        // Group 1 (ranks 2,3): 3 + 4 = 7
        let expected = if rank < 2 { 3.0f32 } else { 7.0f32 };
        assert_eq!(data, vec![expected; 4], "rank {rank} split allreduce failed");
    })
    .await;
}

#[tokio::test]
async fn test_split_orders_by_key() {
    run_collective(5, |c| async move {
        let rank = c.rank();
        // Reverse order inside one group.
        let sub = c.split(0, 100 - rank).await.unwrap();
        assert_eq!(sub.world_size(), 5);
        assert_eq!(sub.rank(), 4 - rank);
    })
    .await;
}

#[tokio::test]
async fn test_split_groups_do_not_interfere() {
    run_collective(6, |c| async move {
        let rank = c.rank();
        let sub = c.split(rank % 2, rank).await.unwrap();
        assert_eq!(sub.world_size(), 3);

        // Parent and child collectives back to back.
        let mut v = vec![rank as i64; 5];
        sub.all_reduce_slice(&mut v, ReduceOp::Sum).await.unwrap();
        let expected = if rank % 2 == 0 { 0 + 2 + 4 } else { 1 + 3 + 5 };
        assert_eq!(v, vec![expected; 5]);

        let mut v = vec![rank as i64; 5];
        c.all_reduce_slice(&mut v, ReduceOp::Sum).await.unwrap();
        assert_eq!(v, vec![15; 5]);
    })
    .await;
}

#[tokio::test]
async fn test_nested_split() {
    run_collective(8, |c| async move {
        let rank = c.rank();
        let half = c.split(rank / 4, rank).await.unwrap();
        let quarter = half.split(half.rank() / 2, half.rank()).await.unwrap();
        assert_eq!(quarter.world_size(), 2);

        let mut v = vec![1u32 << rank; 3];
        quarter.all_reduce_slice(&mut v, ReduceOp::Sum).await.unwrap();
        let pair = rank & !1;
        assert_eq!(v, vec![(1 << pair) | (1 << (pair + 1)); 3]);
    })
    .await;
}
