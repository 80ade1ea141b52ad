//! Feature-distillation regulariser over the network's intermediate maps.
//!
//! Two terms:
//! - `intra_fd`: channels are ranked by their L2-normalised mean activation and
//!   the stronger half is pulled towards the weaker half.
//! - `inter_fd`: a random subset of channels of an intermediate map is aligned
//!   with a random subset of the reference map, after average-pooling the
//!   larger of the two down to the smaller resolution. The reference side is
//!   detached.

use burn::nn::loss::{MseLoss, Reduction};
use burn::tensor::module::adaptive_avg_pool2d;
use burn::tensor::{backend::Backend, Int, Tensor, TensorData};
use models::UNetFeatures;
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KdLoss {
    lambda: f32,
}

impl KdLoss {
    pub fn new(lambda: f32) -> Self {
        Self { lambda }
    }

    pub fn lambda(&self) -> f32 {
        self.lambda
    }

    /// MSE between the top and bottom halves of the channels after ranking.
    /// Zero for maps with fewer than two channels. With an odd channel count
    /// the weakest channel is left out.
    pub fn intra_fd<B: Backend>(&self, features: Tensor<B, 4>) -> Tensor<B, 1> {
        let [n, c, h, w] = features.dims();
        let device = features.device();
        if c < 2 {
            return Tensor::zeros([1], &device);
        }

        let norm = features
            .clone()
            .powf_scalar(2.0)
            .sum_dim(2)
            .sum_dim(3)
            .sqrt()
            .clamp_min(1e-12)
            .expand([n, c, h, w]);
        let scores = (features.clone().detach() / norm.detach())
            .mean_dim(0)
            .mean_dim(2)
            .mean_dim(3)
            .reshape([c])
            .into_data()
            .to_vec::<f32>()
            .unwrap_or_default();
        let order: Vec<i64> = descending_order(&scores)
            .into_iter()
            .map(|i| i as i64)
            .collect();
        let index = Tensor::<B, 1, Int>::from_data(TensorData::new(order, [c]), &device);
        let sorted = features.select(1, index);

        let half = c / 2;
        let top = sorted.clone().slice([0..n, 0..half, 0..h, 0..w]);
        let bottom = sorted.slice([0..n, half..2 * half, 0..h, 0..w]);
        MseLoss::new().forward(top, bottom, Reduction::Mean)
    }

    /// MSE between `min(C_s, C_t)` randomly drawn channels of each input at the
    /// smaller of the two resolutions. `target` does not receive gradients.
    pub fn inter_fd<B: Backend, R: Rng + ?Sized>(
        &self,
        source: Tensor<B, 4>,
        target: Tensor<B, 4>,
        rng: &mut R,
    ) -> Tensor<B, 1> {
        let [_, s_c, s_h, s_w] = source.dims();
        let [_, t_c, t_h, t_w] = target.dims();
        let (source, target) = if s_h * s_w > t_h * t_w {
            (adaptive_avg_pool2d(source, [t_h, t_w]), target)
        } else if s_h * s_w < t_h * t_w {
            (source, adaptive_avg_pool2d(target, [s_h, s_w]))
        } else {
            (source, target)
        };

        let device = source.device();
        let k = s_c.min(t_c);
        let idx_s = sample_channels::<B, R>(s_c, k, rng, &device);
        let idx_t = sample_channels::<B, R>(t_c, k, rng, &device);
        MseLoss::new().forward(
            source.select(1, idx_s),
            target.select(1, idx_t).detach(),
            Reduction::Mean,
        )
    }

    /// `lambda · (mean intra over encoder maps + mean intra over decoder maps
    /// + mean inter of every encoder/decoder map against the final map)`.
    pub fn forward<B: Backend, R: Rng + ?Sized>(
        &self,
        features: &UNetFeatures<B>,
        rng: &mut R,
    ) -> Tensor<B, 1> {
        let device = features.final_up.device();
        let intra_enc = mean_of(
            features
                .encoder
                .iter()
                .map(|f| self.intra_fd(f.clone()))
                .collect(),
            &device,
        );
        let intra_dec = mean_of(
            features
                .decoder
                .iter()
                .map(|f| self.intra_fd(f.clone()))
                .collect(),
            &device,
        );
        let inter = mean_of(
            features
                .decoder
                .iter()
                .chain(features.encoder.iter())
                .map(|f| self.inter_fd(f.clone(), features.final_up.clone(), rng))
                .collect(),
            &device,
        );
        (intra_enc + intra_dec + inter).mul_scalar(self.lambda)
    }
}

fn descending_order(scores: &[f32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    order
}

fn sample_channels<B: Backend, R: Rng + ?Sized>(
    channels: usize,
    amount: usize,
    rng: &mut R,
    device: &B::Device,
) -> Tensor<B, 1, Int> {
    let picked: Vec<i64> = rand::seq::index::sample(rng, channels, amount)
        .into_iter()
        .map(|i| i as i64)
        .collect();
    Tensor::from_data(TensorData::new(picked, [amount]), device)
}

fn mean_of<B: Backend>(terms: Vec<Tensor<B, 1>>, device: &B::Device) -> Tensor<B, 1> {
    if terms.is_empty() {
        return Tensor::zeros([1], device);
    }
    let count = terms.len() as f32;
    terms
        .into_iter()
        .fold(Tensor::zeros([1], device), |acc, t| acc + t)
        .div_scalar(count)
}
