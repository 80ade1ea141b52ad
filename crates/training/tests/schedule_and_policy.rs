use training::checkpoint::CheckpointPolicy;
use training::{poly_lr, PolyLrScheduler};

#[test]
fn poly_lr_starts_at_base_and_ends_near_zero() {
    let total = 150 * 37;
    assert_eq!(poly_lr(0.01, 0, total, 0.9), 0.01);
    let last = poly_lr(0.01, total - 1, total, 0.9);
    assert!(last > 0.0 && last < 1e-5, "last lr {last}");
}

#[test]
fn poly_lr_never_increases() {
    let mut sched = PolyLrScheduler::new(0.05, 500);
    let mut prev = f64::INFINITY;
    for _ in 0..520 {
        let lr = sched.step();
        assert!(lr <= prev);
        assert!(lr >= 0.0);
        prev = lr;
    }
}

#[test]
fn ninety_epochs_checkpoint_exactly_81_to_89() {
    let policy = CheckpointPolicy::new(80, 90);
    assert_eq!(policy.planned_epochs(), (81..=89).collect::<Vec<_>>());
    assert!(!policy.should_save(80));
}
