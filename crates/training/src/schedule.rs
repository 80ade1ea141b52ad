//! Learning-rate schedules, evaluated per optimizer step.

use serde::{Deserialize, Serialize};

/// Polynomial decay: `base · (1 - step/total)^power`. Zero once `step >= total`.
pub fn poly_lr(base: f64, step: usize, total: usize, power: f64) -> f64 {
    if total == 0 || step >= total {
        return 0.0;
    }
    base * (1.0 - step as f64 / total as f64).powf(power)
}

/// Stateful polynomial schedule; `step` yields the rate for the current
/// iteration and then advances.
#[derive(Debug, Clone)]
pub struct PolyLrScheduler {
    base: f64,
    total: usize,
    power: f64,
    iter: usize,
}

impl PolyLrScheduler {
    pub fn new(base: f64, total: usize) -> Self {
        Self {
            base,
            total,
            power: 0.9,
            iter: 0,
        }
    }

    pub fn with_power(mut self, power: f64) -> Self {
        self.power = power;
        self
    }

    pub fn iteration(&self) -> usize {
        self.iter
    }

    pub fn lr(&self) -> f64 {
        poly_lr(self.base, self.iter, self.total, self.power)
    }

    pub fn step(&mut self) -> f64 {
        let lr = self.lr();
        self.iter += 1;
        lr
    }
}

/// Per-iteration cosine table with an optional linear warmup.
///
/// Warmup runs from `start_warmup` to `base` (inclusive) over
/// `warmup_epochs · iters_per_epoch` steps; the remaining steps follow
/// `final + ½(base - final)(1 + cos(πi/len))`.
pub fn cosine_schedule(
    base: f64,
    final_value: f64,
    epochs: usize,
    iters_per_epoch: usize,
    warmup_epochs: usize,
    start_warmup: f64,
) -> Vec<f64> {
    let total = epochs * iters_per_epoch;
    let warmup_iters = (warmup_epochs * iters_per_epoch).min(total);
    let mut schedule = Vec::with_capacity(total);

    match warmup_iters {
        0 => {}
        1 => schedule.push(start_warmup),
        n => schedule.extend(
            (0..n).map(|i| start_warmup + (base - start_warmup) * i as f64 / (n - 1) as f64),
        ),
    }

    let len = total - warmup_iters;
    schedule.extend((0..len).map(|i| {
        final_value
            + 0.5 * (base - final_value) * (1.0 + (std::f64::consts::PI * i as f64 / len as f64).cos())
    }));
    schedule
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    #[default]
    Poly,
    Cosine,
}

/// Schedule resolved for a run of known length.
#[derive(Debug, Clone)]
pub enum LrSchedule {
    Poly(PolyLrScheduler),
    Cosine { table: Vec<f64>, iter: usize },
}

impl LrSchedule {
    pub fn step(&mut self) -> f64 {
        match self {
            LrSchedule::Poly(poly) => poly.step(),
            LrSchedule::Cosine { table, iter } => {
                let lr = table
                    .get(*iter)
                    .or_else(|| table.last())
                    .copied()
                    .unwrap_or(0.0);
                *iter += 1;
                lr
            }
        }
    }
}
