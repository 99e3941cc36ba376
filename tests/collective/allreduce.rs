use super::helpers::{ramp, ramp_sum, run_collective, run_collective_with};
use flextree::{Communicator, DataType, FlexConfig, FlexError, ReduceOp, SendBuf, StagePlan};
use std::sync::Arc;

fn i64_bytes(vals: &[i64]) -> Vec<u8> {
    vals.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

fn bytes_i64(bytes: &[u8]) -> Vec<i64> {
    bytes
        .chunks_exact(8)
        .map(|c| i64::from_ne_bytes(c.try_into().unwrap()))
        .collect()
}

async fn check_ramp_sum(world: u32, stages: Vec<usize>, num_lonely: usize, count: usize) {
    run_collective(world, move |c| {
        let stages = stages.clone();
        async move {
            let plan = StagePlan::new(world as usize, stages.clone(), num_lonely).unwrap();
            let mut data = ramp(c.rank(), count);
            c.all_reduce_with_plan(
                SendBuf::InPlace,
                as_bytes_mut(&mut data),
                count,
                DataType::I64,
                ReduceOp::Sum,
                &plan,
            )
            .await
            .unwrap();
            assert_eq!(
                data,
                ramp_sum(world, count),
                "world={world} stages={stages:?} lonely={num_lonely} count={count} rank={}",
                c.rank()
            );
        }
    })
    .await;
}

fn as_bytes_mut(data: &mut [i64]) -> &mut [u8] {
    // SAFETY: i64 has no padding and every byte pattern is a valid i64.
    unsafe { std::slice::from_raw_parts_mut(data.as_mut_ptr().cast(), std::mem::size_of_val(data)) }
}

#[tokio::test]
async fn test_flat_four_ranks() {
    check_ramp_sum(4, vec![4], 0, 8).await;
}

#[tokio::test]
async fn test_recursive_halving_matches_flat() {
    check_ramp_sum(8, vec![2, 2, 2], 0, 8).await;
    check_ramp_sum(8, vec![8], 0, 8).await;
    check_ramp_sum(8, vec![4, 2], 0, 8).await;
}

#[tokio::test]
async fn test_short_last_block() {
    check_ramp_sum(3, vec![3], 0, 10).await;
}

#[tokio::test]
async fn test_fewer_elements_than_ranks() {
    check_ramp_sum(4, vec![2, 2], 0, 1).await;
    check_ramp_sum(6, vec![3, 2], 0, 4).await;
}

#[tokio::test]
async fn test_mixed_radix_factorizations() {
    let shapes: &[(u32, &[usize])] = &[
        (6, &[2, 3]),
        (6, &[3, 2]),
        (9, &[3, 3]),
        (12, &[2, 3, 2]),
        (12, &[4, 3]),
        (16, &[2, 2, 2, 2]),
        (5, &[5]),
        (7, &[7]),
        (2, &[2]),
    ];
    for &(world, stages) in shapes {
        for count in [1, 5, 13, 100] {
            check_ramp_sum(world, stages.to_vec(), 0, count).await;
        }
    }
}

#[tokio::test]
async fn test_radix_one_stage_is_passthrough() {
    check_ramp_sum(4, vec![1, 4, 1], 0, 9).await;
}

#[tokio::test]
async fn test_single_rank_copies_input() {
    run_collective(1, |c| async move {
        let input = i64_bytes(&[3, -4, 5]);
        let mut out = vec![0u8; input.len()];
        c.all_reduce(SendBuf::Buffer(&input), &mut out, 3, DataType::I64, ReduceOp::Sum)
            .await
            .unwrap();
        assert_eq!(bytes_i64(&out), vec![3, -4, 5]);
    })
    .await;
}

#[tokio::test]
async fn test_zero_count_is_noop() {
    run_collective(3, |c| async move {
        let mut out: Vec<u8> = Vec::new();
        c.all_reduce(SendBuf::InPlace, &mut out, 0, DataType::F32, ReduceOp::Sum)
            .await
            .unwrap();
    })
    .await;
}

#[tokio::test]
async fn test_separate_send_buffer_untouched() {
    run_collective(4, |c| async move {
        let input = i64_bytes(&ramp(c.rank(), 11));
        let before = input.clone();
        let mut out = vec![0u8; input.len()];
        c.all_reduce(SendBuf::Buffer(&input), &mut out, 11, DataType::I64, ReduceOp::Sum)
            .await
            .unwrap();
        assert_eq!(input, before);
        assert_eq!(bytes_i64(&out), ramp_sum(4, 11));
    })
    .await;
}

#[tokio::test]
async fn test_typed_sum_across_types() {
    run_collective(4, |c| async move {
        let r = c.rank();

        let mut v = vec![r as i8 - 2; 5];
        c.all_reduce_slice(&mut v, ReduceOp::Sum).await.unwrap();
        assert_eq!(v, vec![-2i8; 5]);

        let mut v = vec![200u8 + r as u8; 3];
        c.all_reduce_slice(&mut v, ReduceOp::Sum).await.unwrap();
        // 200 + 201 + 202 + 203 = 806, wrapped mod 256.
        assert_eq!(v, vec![(806 % 256) as u8; 3]);

        let mut v = vec![1000i16 * r as i16; 6];
        c.all_reduce_slice(&mut v, ReduceOp::Sum).await.unwrap();
        assert_eq!(v, vec![6000i16; 6]);

        let mut v = vec![u16::MAX; 2];
        c.all_reduce_slice(&mut v, ReduceOp::Sum).await.unwrap();
        assert_eq!(v, vec![u16::MAX - 3; 2]);

        let mut v = vec![r as i32 + 1; 7];
        c.all_reduce_slice(&mut v, ReduceOp::Sum).await.unwrap();
        assert_eq!(v, vec![10i32; 7]);

        let mut v = vec![r; 4];
        c.all_reduce_slice(&mut v, ReduceOp::Sum).await.unwrap();
        assert_eq!(v, vec![6u32; 4]);

        let mut v = vec![1u64 << (10 * r); 3];
        c.all_reduce_slice(&mut v, ReduceOp::Sum).await.unwrap();
        assert_eq!(v, vec![1 + (1 << 10) + (1 << 20) + (1 << 30); 3]);

        let mut v = vec![0.5f32 * r as f32; 9];
        c.all_reduce_slice(&mut v, ReduceOp::Sum).await.unwrap();
        assert_eq!(v, vec![3.0f32; 9]);

        let mut v = vec![0.25f64; 5];
        c.all_reduce_slice(&mut v, ReduceOp::Sum).await.unwrap();
        assert_eq!(v, vec![1.0f64; 5]);

        let mut v = vec![r == 2, false, true];
        c.all_reduce_slice(&mut v, ReduceOp::Sum).await.unwrap();
        assert_eq!(v, vec![true, false, true]);
    })
    .await;
}

#[tokio::test]
async fn test_band_integers() {
    run_collective(6, |c| async move {
        let r = c.rank();
        // Each rank clears one bit.
        let mut v = vec![!(1u32 << r); 10];
        c.all_reduce_slice(&mut v, ReduceOp::Band).await.unwrap();
        assert_eq!(v, vec![!0b11_1111u32; 10]);

        let mut v = vec![-1i64 ^ (r as i64); 3];
        c.all_reduce_slice(&mut v, ReduceOp::Band).await.unwrap();
        assert_eq!(v, vec![-1i64 ^ 0b111; 3]);

        let mut v = vec![!(1i8 << r); 7];
        c.all_reduce_slice(&mut v, ReduceOp::Band).await.unwrap();
        assert_eq!(v, vec![!0b11_1111i8; 7]);

        let mut v = vec![!(1u8 << r); 5];
        c.all_reduce_slice(&mut v, ReduceOp::Band).await.unwrap();
        assert_eq!(v, vec![0b1100_0000u8; 5]);

        let mut v = vec![!(1i16 << (r + 8)); 4];
        c.all_reduce_slice(&mut v, ReduceOp::Band).await.unwrap();
        assert_eq!(v, vec![!(0b11_1111i16 << 8); 4]);

        let mut v = vec![!(1i32 << (5 * r)); 6];
        c.all_reduce_slice(&mut v, ReduceOp::Band).await.unwrap();
        let cleared: i32 = (0..6).map(|k| 1i32 << (5 * k)).sum();
        assert_eq!(v, vec![!cleared; 6]);

        let mut v = vec![u64::MAX ^ (1u64 << (10 * r)); 2];
        c.all_reduce_slice(&mut v, ReduceOp::Band).await.unwrap();
        let cleared: u64 = (0..6).map(|k| 1u64 << (10 * k)).sum();
        assert_eq!(v, vec![u64::MAX ^ cleared; 2]);
    })
    .await;
}

#[tokio::test]
async fn test_repeated_calls_reuse_scratch() {
    run_collective(6, |c| async move {
        for (round, count) in [64usize, 3, 1000, 7, 64].into_iter().enumerate() {
            let mut data: Vec<i64> = ramp(c.rank(), count).iter().map(|v| v * round as i64).collect();
            c.all_reduce_slice(&mut data, ReduceOp::Sum).await.unwrap();
            let expected: Vec<i64> = ramp_sum(6, count).iter().map(|v| v * round as i64).collect();
            assert_eq!(data, expected, "round {round}");
        }
    })
    .await;
}

#[tokio::test]
async fn test_large_blocks_use_parallel_kernel() {
    let config = FlexConfig {
        parallel_reduce_bytes: 0,
        ..FlexConfig::default()
    };
    run_collective_with(4, config, |c| async move {
        let count = 200_000;
        let mut data: Vec<u32> = (0..count as u32).map(|i| i ^ c.rank()).collect();
        let plan = StagePlan::new(4, vec![2, 2], 0).unwrap();
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(data.as_mut_ptr().cast::<u8>(), count * 4)
        };
        c.all_reduce_with_plan(SendBuf::InPlace, bytes, count, DataType::U32, ReduceOp::Sum, &plan)
            .await
            .unwrap();
        for (i, v) in data.iter().enumerate() {
            let expected: u32 = (0..4u32).map(|r| i as u32 ^ r).fold(0, u32::wrapping_add);
            assert_eq!(*v, expected, "element {i}");
        }
    })
    .await;
}

#[tokio::test]
async fn test_explicit_stages_from_config() {
    let config = FlexConfig {
        stages: Some(vec![2, 3]),
        ..FlexConfig::default()
    };
    run_collective_with(6, config, |c| async move {
        assert_eq!(c.default_plan().unwrap().stages(), &[2, 3]);
        let mut data = ramp(c.rank(), 17);
        c.all_reduce_slice(&mut data, ReduceOp::Sum).await.unwrap();
        assert_eq!(data, ramp_sum(6, 17));
    })
    .await;
}

#[tokio::test]
async fn test_unsupported_pair_rejected_before_communication() {
    run_collective(3, |c| async move {
        let mut v = vec![1.0f32; 4];
        let err = c.all_reduce_slice(&mut v, ReduceOp::Band).await.unwrap_err();
        assert!(matches!(
            err,
            FlexError::UnsupportedDType {
                dtype: DataType::F32,
                op: ReduceOp::Band
            }
        ));
        assert_eq!(v, vec![1.0f32; 4]);

        // The group is still usable afterwards.
        let mut v = vec![1.0f32; 4];
        c.all_reduce_slice(&mut v, ReduceOp::Sum).await.unwrap();
        assert_eq!(v, vec![3.0f32; 4]);
    })
    .await;
}

#[tokio::test]
async fn test_buffer_size_mismatch() {
    run_collective(2, |c| async move {
        let mut out = vec![0u8; 12];
        let err = c
            .all_reduce(SendBuf::InPlace, &mut out, 4, DataType::I32, ReduceOp::Sum)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FlexError::BufferSizeMismatch {
                expected: 16,
                actual: 12
            }
        ));

        let input = vec![0u8; 8];
        let mut out = vec![0u8; 16];
        let err = c
            .all_reduce(SendBuf::Buffer(&input), &mut out, 4, DataType::I32, ReduceOp::Sum)
            .await
            .unwrap_err();
        assert!(matches!(err, FlexError::BufferSizeMismatch { actual: 8, .. }));
    })
    .await;
}

#[tokio::test]
async fn test_plan_for_wrong_world_rejected() {
    run_collective(4, |c| async move {
        let plan = StagePlan::new(8, vec![2, 4], 0).unwrap();
        let mut out = vec![0u8; 8];
        let err = c
            .all_reduce_with_plan(SendBuf::InPlace, &mut out, 2, DataType::F32, ReduceOp::Sum, &plan)
            .await
            .unwrap_err();
        assert!(matches!(err, FlexError::InvalidStages { .. }));
    })
    .await;
}

#[tokio::test]
async fn test_invalid_config_stages_rejected() {
    let config = FlexConfig {
        stages: Some(vec![2, 3]),
        ..FlexConfig::default()
    };
    run_collective_with(4, config, |c| async move {
        let mut v = vec![1i32; 2];
        let err = c.all_reduce_slice(&mut v, ReduceOp::Sum).await.unwrap_err();
        assert!(matches!(err, FlexError::InvalidStages { .. }));
    })
    .await;
}

fn assert_send<T: Send>(_: &T) {}

#[tokio::test]
async fn test_collective_futures_are_send() {
    let comms = Communicator::bootstrap_local(1, FlexConfig::default());
    let c = &comms[0];
    let plan = StagePlan::new(1, vec![], 0).unwrap();

    let mut v = vec![1i32; 4];
    let fut = c.all_reduce_slice(&mut v, ReduceOp::Sum);
    assert_send(&fut);
    fut.await.unwrap();

    let mut out = vec![0u8; 8];
    let fut = c.all_reduce_with_plan(SendBuf::InPlace, &mut out, 2, DataType::F32, ReduceOp::Sum, &plan);
    assert_send(&fut);
    fut.await.unwrap();

    let fut = c.split(0, 0);
    assert_send(&fut);
    fut.await.unwrap();
}

#[tokio::test]
async fn test_spawned_collectives_own_their_buffers() {
    let comms: Vec<Arc<Communicator>> = Communicator::bootstrap_local(5, FlexConfig::default())
        .into_iter()
        .map(Arc::new)
        .collect();

    let mut handles = Vec::new();
    for c in &comms {
        let c = Arc::clone(c);
        handles.push(tokio::spawn(async move {
            let mut v = vec![c.rank() as u64 + 1; 11];
            c.all_reduce_slice(&mut v, ReduceOp::Sum).await?;

            let plan = StagePlan::new(5, vec![2, 2], 1)?;
            let input = vec![1u8; 6];
            let mut out = vec![0u8; 6];
            c.all_reduce_with_plan(
                SendBuf::Buffer(&input),
                &mut out,
                6,
                DataType::U8,
                ReduceOp::Sum,
                &plan,
            )
            .await?;
            flextree::Result::Ok((v, out))
        }));
    }
    for h in handles {
        let (v, out) = h.await.unwrap().unwrap();
        assert_eq!(v, vec![15; 11]);
        assert_eq!(out, vec![5; 6]);
    }
}
