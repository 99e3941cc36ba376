use super::helpers::{ramp, ramp_sum, run_collective, run_collective_with};
use flextree::{DataType, FlexConfig, ReduceOp, SendBuf, StagePlan};

async fn check_lonely_sum(world: u32, stages: Vec<usize>, num_lonely: usize, count: usize) {
    run_collective(world, move |c| {
        let stages = stages.clone();
        async move {
            let plan = StagePlan::new(world as usize, stages, num_lonely).unwrap();
            let input: Vec<u8> = ramp(c.rank(), count)
                .iter()
                .flat_map(|v| v.to_ne_bytes())
                .collect();
            let mut out = vec![0u8; input.len()];
            c.all_reduce_with_plan(
                SendBuf::Buffer(&input),
                &mut out,
                count,
                DataType::I64,
                ReduceOp::Sum,
                &plan,
            )
            .await
            .unwrap();
            let got: Vec<i64> = out
                .chunks_exact(8)
                .map(|b| i64::from_ne_bytes(b.try_into().unwrap()))
                .collect();
            assert_eq!(
                got,
                ramp_sum(world, count),
                "world={world} lonely={num_lonely} count={count} rank={}",
                c.rank()
            );
        }
    })
    .await;
}

#[tokio::test]
async fn test_one_lonely_rank() {
    check_lonely_sum(5, vec![2, 2], 1, 12).await;
    check_lonely_sum(5, vec![4], 1, 7).await;
}

#[tokio::test]
async fn test_several_lonely_ranks() {
    check_lonely_sum(9, vec![3, 2], 3, 20).await;
    check_lonely_sum(7, vec![2, 2], 3, 5).await;
}

#[tokio::test]
async fn test_lonely_with_tiny_array() {
    // Only block 0 holds data; the other regular ranks own empty blocks.
    check_lonely_sum(5, vec![2, 2], 1, 1).await;
    check_lonely_sum(7, vec![3, 2], 1, 2).await;
}

#[tokio::test]
async fn test_single_regular_rank() {
    check_lonely_sum(3, vec![], 2, 6).await;
}

#[tokio::test]
async fn test_lonely_in_place_band() {
    run_collective(7, |c| async move {
        let plan = StagePlan::new(7, vec![3, 2], 1).unwrap();
        let r = c.rank();
        let mut v = vec![!(1u16 << r); 9];
        let bytes = unsafe { std::slice::from_raw_parts_mut(v.as_mut_ptr().cast::<u8>(), 18) };
        c.all_reduce_with_plan(SendBuf::InPlace, bytes, 9, DataType::U16, ReduceOp::Band, &plan)
            .await
            .unwrap();
        assert_eq!(v, vec![!0b111_1111u16; 9]);
    })
    .await;
}

#[tokio::test]
async fn test_repeated_lonely_calls_reuse_split() {
    run_collective(5, |c| async move {
        let plan = StagePlan::new(5, vec![2, 2], 1).unwrap();
        for round in 0..4i64 {
            let mut data: Vec<i64> = ramp(c.rank(), 10).iter().map(|v| v + round).collect();
            let bytes =
                unsafe { std::slice::from_raw_parts_mut(data.as_mut_ptr().cast::<u8>(), 80) };
            c.all_reduce_with_plan(SendBuf::InPlace, bytes, 10, DataType::I64, ReduceOp::Sum, &plan)
                .await
                .unwrap();
            let expected: Vec<i64> = ramp_sum(5, 10).iter().map(|v| v + 5 * round).collect();
            assert_eq!(data, expected, "round {round}");
        }
    })
    .await;
}

#[tokio::test]
async fn test_planner_adds_lonely_rank() {
    let config = FlexConfig {
        max_radix: 4,
        ..FlexConfig::default()
    };
    run_collective_with(7, config, |c| async move {
        let plan = c.default_plan().unwrap();
        assert_eq!(plan.num_lonely(), 1);
        assert_eq!(plan.stages(), &[3, 2]);

        let mut v = vec![c.rank() as f64; 13];
        c.all_reduce_slice(&mut v, ReduceOp::Sum).await.unwrap();
        assert_eq!(v, vec![21.0; 13]);
    })
    .await;
}

#[tokio::test]
async fn test_lonely_then_regular_plans_interleave() {
    run_collective(6, |c| async move {
        let lonely = StagePlan::new(6, vec![5], 1).unwrap();
        let flat = StagePlan::flat(6).unwrap();
        for plan in [&lonely, &flat, &lonely] {
            let mut v = vec![1i32; 8];
            let bytes = unsafe { std::slice::from_raw_parts_mut(v.as_mut_ptr().cast::<u8>(), 32) };
            c.all_reduce_with_plan(SendBuf::InPlace, bytes, 8, DataType::I32, ReduceOp::Sum, plan)
                .await
                .unwrap();
            assert_eq!(v, vec![6; 8]);
        }
    })
    .await;
}
