use burn::backend::Autodiff;
use burn::tensor::{Distribution, Int, Tensor, TensorData};
use burn_ndarray::NdArray;
use models::{UNetSta, UNetStaConfig};
use rand::rngs::StdRng;
use rand::SeedableRng;
use training::loss::scalar;
use training::{cross_entropy_2d, DiceLoss, KdLoss, LossWeights};

type B = NdArray<f32>;

fn random_batch(classes: usize) -> (Tensor<B, 4>, Tensor<B, 3, Int>) {
    let device = Default::default();
    let logits = Tensor::<B, 4>::random([2, classes, 8, 8], Distribution::Normal(0.0, 2.0), &device);
    let labels: Vec<i64> = (0..2 * 8 * 8).map(|i| (i * 7 % classes) as i64).collect();
    let labels = Tensor::<B, 3, Int>::from_data(TensorData::new(labels, [2, 8, 8]), &device);
    (logits, labels)
}

#[test]
fn total_is_weighted_sum_of_ce_and_dice() {
    let (logits, labels) = random_batch(4);
    let ce = cross_entropy_2d(logits.clone(), labels.clone());
    let dice = DiceLoss::new(4).forward(logits, labels, true);
    let (ce_v, dice_v) = (scalar(&ce), scalar(&dice));

    let values = LossWeights::default().combine(ce, dice, None).values();
    assert!((values.total - (0.4 * ce_v + 0.6 * dice_v)).abs() < 1e-5);
    assert!((values.ce - ce_v).abs() < 1e-6);
    assert!((0.0..=1.0).contains(&values.dice));
}

#[test]
fn scaling_weights_scales_total() {
    let (logits, labels) = random_batch(3);
    let ce = cross_entropy_2d(logits.clone(), labels.clone());
    let dice = DiceLoss::new(3).forward(logits, labels, true);

    let base = LossWeights::default();
    let doubled = LossWeights {
        ce: base.ce * 2.0,
        dice: base.dice * 2.0,
        ..base
    };
    let a = base.combine(ce.clone(), dice.clone(), None).values().total;
    let b = doubled.combine(ce, dice, None).values().total;
    assert!((b - 2.0 * a).abs() < 1e-5);
}

#[test]
fn intra_fd_is_non_negative() {
    let device = Default::default();
    let kd = KdLoss::new(1.0);
    for _ in 0..5 {
        let f = Tensor::<B, 4>::random([2, 6, 5, 5], Distribution::Normal(0.0, 1.0), &device);
        assert!(scalar(&kd.intra_fd(f)) >= 0.0);
    }
    // identical channels leave nothing to pull together
    let same = Tensor::<B, 4>::ones([1, 4, 3, 3], &device);
    assert!(scalar(&kd.intra_fd(same)).abs() < 1e-12);
}

#[test]
fn inter_fd_is_symmetric_under_pooling() {
    let device = Default::default();
    let kd = KdLoss::new(1.0);
    let big = Tensor::<B, 4>::random([2, 1, 8, 8], Distribution::Default, &device);
    let small = Tensor::<B, 4>::random([2, 1, 4, 4], Distribution::Default, &device);
    let mut rng = StdRng::seed_from_u64(3);
    let ab = scalar(&kd.inter_fd(big.clone(), small.clone(), &mut rng));
    let ba = scalar(&kd.inter_fd(small, big, &mut rng));
    assert!((ab - ba).abs() < 1e-6, "{ab} vs {ba}");
}

#[test]
fn inter_fd_samples_a_subset_of_the_wider_map() {
    let device = Default::default();
    let kd = KdLoss::new(1.0);
    let source = Tensor::<B, 4>::zeros([1, 4, 4, 4], &device);
    // channel c of the wider map is filled with c
    let fill: Vec<f32> = (0..6).flat_map(|c| vec![c as f32; 64]).collect();
    let target = Tensor::<B, 4>::from_data(TensorData::new(fill, [1, 6, 8, 8]), &device);

    let mut seen = std::collections::BTreeSet::new();
    for seed in 0..20 {
        let mut rng = StdRng::seed_from_u64(seed);
        let v = scalar(&kd.inter_fd(source.clone(), target.clone(), &mut rng));
        // mean of c^2 over 4 distinct channels drawn from 0..6
        let sum_sq = 4.0 * v;
        assert!((sum_sq - sum_sq.round()).abs() < 1e-3, "{v}");
        assert!((14.0..=54.0).contains(&sum_sq.round()), "{v}");
        seen.insert(sum_sq.round() as i64);

        let mut again = StdRng::seed_from_u64(seed);
        assert_eq!(v, scalar(&kd.inter_fd(source.clone(), target.clone(), &mut again)));
    }
    assert!(seen.len() > 1, "channel draw never varied");

    // the narrower side can be either argument
    let mut rng = StdRng::seed_from_u64(5);
    let swapped = scalar(&kd.inter_fd(target, source, &mut rng));
    assert!((14.0..=54.0).contains(&(4.0 * swapped).round()));
}

#[test]
fn kd_forward_scales_with_lambda() {
    let device = Default::default();
    let cfg = UNetStaConfig::new(1, 3).with_base_channels(8);
    let model = UNetSta::<Autodiff<B>>::new(&cfg, &device);
    let x = Tensor::<Autodiff<B>, 4>::random([1, 1, 16, 16], Distribution::Default, &device);
    let features = model.forward_features(x);

    let one = KdLoss::new(1.0).forward(&features, &mut StdRng::seed_from_u64(9));
    let half = KdLoss::new(0.5).forward(&features, &mut StdRng::seed_from_u64(9));
    let (one, half) = (scalar(&one), scalar(&half));
    assert!(one.is_finite() && one >= 0.0);
    assert!((half - 0.5 * one).abs() < 1e-5 * one.max(1.0));
}
