#![recursion_limit = "256"]

pub mod checkpoint;
pub mod config;
pub mod kd;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod schedule;
pub mod trainer;

pub use checkpoint::{load_model, save_model, CheckpointError, CheckpointPolicy};
pub use config::{validate_backend_choice, BackendKind, TrainArgs, TrainConfig};
pub use kd::KdLoss;
pub use loss::{cross_entropy_2d, DiceLoss, LossBreakdown, LossValues, LossWeights};
pub use models::{UNetSta, UNetStaConfig};
pub use schedule::{cosine_schedule, poly_lr, LrSchedule, PolyLrScheduler, ScheduleKind};
pub use trainer::{run_train, train, TrainSummary};

/// Backend alias for training/eval (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;
