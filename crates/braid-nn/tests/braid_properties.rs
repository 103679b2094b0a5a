use braid_nn::braid::{
    symmetrize_weight, BraidConv2d, BraidLinear, BraidModule, BraidNormKind, BraidPair,
    WideBraidLinear,
};
use braid_nn::layers::{BatchPartition, ClassConditionalBatchNorm, FeatureLayout, PartitionBook};
use braid_nn::{Tensor, TensorError};

fn random(rows: usize, cols: usize, seed: u64) -> Tensor {
    Tensor::random_normal(rows, cols, 0.0, 1.0, Some(seed)).unwrap()
}

fn assert_close(left: &Tensor, right: &Tensor) {
    assert_eq!(left.shape(), right.shape());
    for (x, y) in left.data().iter().zip(right.data()) {
        assert!((x - y).abs() < 1e-4, "{x} != {y}");
    }
}

#[test]
fn braid_linear_swaps_outputs_for_random_blocks() {
    for seed in 0..8u64 {
        let layer = BraidLinear::from_blocks(
            "braid",
            random(5, 3, seed),
            random(5, 3, seed + 100),
            Some(random(1, 3, seed + 200)),
        )
        .unwrap();
        let input = BraidPair::new(random(4, 5, seed + 300), random(4, 5, seed + 400)).unwrap();
        let out = layer.forward(&input).unwrap();
        let swapped = layer.forward(&input.clone().swap()).unwrap();
        assert_close(&out.a, &swapped.b);
        assert_close(&out.b, &swapped.a);
    }
}

#[test]
fn symmetrised_wide_layer_swaps_outputs() {
    let weight = symmetrize_weight(&random(6, 4, 7)).unwrap();
    let layer = WideBraidLinear::from_weight("wide", weight, None).unwrap();
    let input = BraidPair::new(random(3, 3, 8), random(3, 3, 9)).unwrap();
    let out = layer.forward(&input).unwrap();
    let swapped = layer.forward(&input.clone().swap()).unwrap();
    assert_close(&out.a, &swapped.b);
    assert_close(&out.b, &swapped.a);
}

#[test]
fn braid_conv_swaps_outputs() {
    let layer = BraidConv2d::new("conv", 2, 2, (3, 3), (1, 1), (3, 3), true, Some(11)).unwrap();
    let input = BraidPair::new(random(2, 18, 12), random(2, 18, 13)).unwrap();
    let out = layer.forward(&input).unwrap();
    let swapped = layer.forward(&input.swap()).unwrap();
    assert_close(&out.a, &swapped.b);
    assert_close(&out.b, &swapped.a);
}

#[test]
fn partition_with_too_few_groups_is_rejected() {
    let bn = ClassConditionalBatchNorm::new(
        "ccbn",
        FeatureLayout::Flat { features: 2 },
        3,
        0.1,
        1e-5,
        true,
    )
    .unwrap();
    let partition = BatchPartition::new(vec![vec![0, 1], vec![2, 3]]);
    let book = PartitionBook::new(4, partition.clone(), partition);
    let err = bn.forward_with(&random(4, 2, 1), &book).unwrap_err();
    assert!(matches!(
        err,
        TensorError::PartitionSizeMismatch {
            expected: 3,
            got: 2
        }
    ));
    assert_eq!(bn.batches_tracked(), 0);
}

#[test]
fn unsupported_input_rank_is_rejected() {
    let err = ClassConditionalBatchNorm::for_input_dims("ccbn", &[8, 3, 4], 2).unwrap_err();
    assert!(matches!(err, TensorError::UnsupportedInputRank { rank: 3 }));
    assert!(ClassConditionalBatchNorm::for_input_dims("ccbn", &[8, 3, 4, 4], 2).is_ok());
}

#[test]
fn braid_norm_kind_round_trips() {
    let kind = BraidNormKind::ClassConditional { num_classes: 2 };
    let bn = braid_nn::braid::BraidBatchNorm::new("wbn", FeatureLayout::Flat { features: 3 }, kind)
        .unwrap();
    assert_eq!(bn.kind(), kind);
}
