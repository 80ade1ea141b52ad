//! Super-token attention refinement used after every encoder and decoder stage.
//!
//! A stage is a stack of [`StokenLayer`]s. Each layer runs a depthwise-conv
//! positional encoding, [`StokenAttention`] and a 1x1-conv MLP, all residual.
//!
//! [`StokenAttention`] groups pixels into a coarse grid of super tokens,
//! refines the grid with soft association between each pixel and the 3x3
//! super tokens around its cell, attends over the super tokens and scatters
//! the result back through the same association.
//! With a `[1, 1]` super-token size every pixel is its own token and the layer
//! reduces to global multi-head self-attention.

use burn::module::Module;
use burn::nn::attention::{MhaInput, MultiHeadAttention, MultiHeadAttentionConfig};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d};
use burn::tensor::activation::{gelu, softmax};
use burn::tensor::module::{adaptive_avg_pool2d, unfold4d};
use burn::tensor::ops::UnfoldOptions;
use burn::tensor::{backend::Backend, Tensor};
use serde::{Deserialize, Serialize};

/// Shape of one refinement stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Number of stacked layers.
    pub depth: usize,
    /// Pixels per super token along `[height, width]`.
    pub stoken_size: [usize; 2],
    pub heads: usize,
}

impl StageConfig {
    pub const fn new(depth: usize, stoken_size: [usize; 2], heads: usize) -> Self {
        Self {
            depth,
            stoken_size,
            heads,
        }
    }
}

#[derive(Module, Debug)]
pub struct StokenAttention<B: Backend> {
    attn: MultiHeadAttention<B>,
    stoken_h: usize,
    stoken_w: usize,
    n_iter: usize,
    scale: f32,
}

/// Layout of a feature map partitioned into super-token cells.
#[derive(Debug, Clone, Copy)]
struct Grid {
    batch: usize,
    channels: usize,
    rows: usize,
    cols: usize,
}

impl Grid {
    fn tokens(&self) -> usize {
        self.rows * self.cols
    }
}

const NEIGHBOURS: usize = 9;

impl<B: Backend> StokenAttention<B> {
    pub fn new(
        dim: usize,
        stoken_size: [usize; 2],
        heads: usize,
        n_iter: usize,
        device: &B::Device,
    ) -> Self {
        let attn = MultiHeadAttentionConfig::new(dim, heads.max(1))
            .with_dropout(0.0)
            .init(device);
        Self {
            attn,
            stoken_h: stoken_size[0].max(1),
            stoken_w: stoken_size[1].max(1),
            n_iter: n_iter.max(1),
            scale: (dim as f32).powf(-0.5),
        }
    }

    fn is_global(&self) -> bool {
        self.stoken_h == 1 && self.stoken_w == 1
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, channels, height, width] = x.dims();
        if self.is_global() {
            let pixels = x.reshape([batch, channels, height * width]).swap_dims(1, 2);
            let context = self.attn.forward(MhaInput::self_attn(pixels)).context;
            return context.swap_dims(1, 2).reshape([batch, channels, height, width]);
        }

        let (pixels, stokens, grid) = self.partition(x);
        let (affinity, stokens) = self.refine(pixels, stokens, &grid);

        let stokens = stokens
            .reshape([batch, channels, grid.tokens()])
            .swap_dims(1, 2);
        let stokens = self
            .attn
            .forward(MhaInput::self_attn(stokens))
            .context
            .swap_dims(1, 2)
            .reshape([batch, channels, grid.rows, grid.cols]);

        // [batch, tokens, cell, channels]
        let out = affinity.matmul(Self::neighbours(stokens).swap_dims(2, 3));
        out.reshape([
            batch,
            grid.rows,
            grid.cols,
            self.stoken_h,
            self.stoken_w,
            channels,
        ])
        .permute([0, 5, 1, 3, 2, 4])
        .reshape([
            batch,
            channels,
            grid.rows * self.stoken_h,
            grid.cols * self.stoken_w,
        ])
        .slice([0..batch, 0..channels, 0..height, 0..width])
    }

    /// Soft association of every pixel with the 3x3 super tokens around its
    /// own cell, after refinement: `[batch, tokens, cell pixels, 9]`. Each
    /// row sums to one and neighbours outside the grid get no weight.
    pub fn affinity(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let (pixels, stokens, grid) = self.partition(x);
        self.refine(pixels, stokens, &grid).0
    }

    /// Pads to whole cells and returns the pixels grouped per cell as
    /// `[batch, tokens, cell pixels, channels]` with the pooled super tokens
    /// `[batch, channels, rows, cols]`.
    fn partition(&self, x: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>, Grid) {
        let [batch, channels, height, width] = x.dims();
        let rows = height.div_ceil(self.stoken_h);
        let cols = width.div_ceil(self.stoken_w);
        let pad_b = rows * self.stoken_h - height;
        let pad_r = cols * self.stoken_w - width;
        let x = if pad_b > 0 || pad_r > 0 {
            x.pad((0, pad_r, 0, pad_b), 0.0)
        } else {
            x
        };
        let grid = Grid {
            batch,
            channels,
            rows,
            cols,
        };

        let stokens = adaptive_avg_pool2d(x.clone(), [rows, cols]);
        let pixels = x
            .reshape([batch, channels, rows, self.stoken_h, cols, self.stoken_w])
            .permute([0, 2, 4, 3, 5, 1])
            .reshape([batch, rows * cols, self.stoken_h * self.stoken_w, channels]);
        (pixels, stokens, grid)
    }

    fn refine(
        &self,
        pixels: Tensor<B, 4>,
        mut stokens: Tensor<B, 4>,
        grid: &Grid,
    ) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let Grid {
            batch,
            channels,
            rows,
            cols,
            ..
        } = *grid;
        let [_, tokens, cell, _] = pixels.dims();
        let device = pixels.device();
        let bias = Self::outside_bias(grid, cell, &device);
        // the extra ones channel accumulates the association mass
        let weighted = Tensor::cat(
            vec![pixels.clone(), Tensor::ones([batch, tokens, cell, 1], &device)],
            3,
        );

        let mut affinity = self.associate(pixels.clone(), stokens.clone(), bias.clone());
        for iter in 0..self.n_iter {
            if iter > 0 {
                affinity = self.associate(pixels.clone(), stokens.clone(), bias.clone());
            }
            let sums = Self::fold(
                affinity.clone().swap_dims(2, 3).matmul(weighted.clone()),
                grid,
            );
            let mass = sums
                .clone()
                .slice([0..batch, channels..channels + 1, 0..rows, 0..cols])
                .add_scalar(1e-12)
                .expand([batch, channels, rows, cols]);
            stokens = sums
                .slice([0..batch, 0..channels, 0..rows, 0..cols])
                .div(mass);
        }
        (affinity, stokens)
    }

    fn associate(
        &self,
        pixels: Tensor<B, 4>,
        stokens: Tensor<B, 4>,
        bias: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let logits = pixels
            .matmul(Self::neighbours(stokens))
            .mul_scalar(self.scale);
        softmax(logits + bias, 3)
    }

    /// 3x3 neighbourhood of every cell: `[batch, tokens, channels, 9]`.
    /// Neighbours past the grid edge are zero.
    fn neighbours(stokens: Tensor<B, 4>) -> Tensor<B, 4> {
        let [batch, channels, rows, cols] = stokens.dims();
        unfold4d(stokens, [3, 3], UnfoldOptions::new([1, 1], [1, 1], [1, 1]))
            .reshape([batch, channels, NEIGHBOURS, rows * cols])
            .permute([0, 3, 1, 2])
    }

    /// Large negative logit bias for neighbours past the grid edge.
    fn outside_bias(grid: &Grid, cell: usize, device: &B::Device) -> Tensor<B, 4> {
        let inside = unfold4d(
            Tensor::<B, 4>::ones([1, 1, grid.rows, grid.cols], device),
            [3, 3],
            UnfoldOptions::new([1, 1], [1, 1], [1, 1]),
        );
        inside
            .swap_dims(1, 2)
            .reshape([1, grid.tokens(), 1, NEIGHBOURS])
            .sub_scalar(1.0)
            .mul_scalar(1e4)
            .expand([grid.batch, grid.tokens(), cell, NEIGHBOURS])
    }

    /// Inverse of [`Self::neighbours`]: sums per-cell contributions
    /// `[batch, tokens, 9, dim]` onto the super tokens they point at.
    fn fold(contrib: Tensor<B, 4>, grid: &Grid) -> Tensor<B, 4> {
        let [batch, _, _, dim] = contrib.dims();
        let (rows, cols) = (grid.rows, grid.cols);
        let contrib = contrib
            .reshape([batch, rows, cols, NEIGHBOURS, dim])
            .permute([0, 3, 4, 1, 2]);
        let mut acc = Tensor::<B, 4>::zeros([batch, dim, rows + 2, cols + 2], &contrib.device());
        for k in 0..NEIGHBOURS {
            let (ky, kx) = (k / 3, k % 3);
            let part = contrib
                .clone()
                .slice([0..batch, k..k + 1, 0..dim, 0..rows, 0..cols])
                .reshape([batch, dim, rows, cols]);
            // cell (y, x) feeds token (y + ky - 1, x + kx - 1)
            acc = acc + part.pad((kx, 2 - kx, ky, 2 - ky), 0.0);
        }
        acc.slice([0..batch, 0..dim, 1..rows + 1, 1..cols + 1])
    }
}

#[derive(Module, Debug)]
struct Mlp<B: Backend> {
    fc1: Conv2d<B>,
    fc2: Conv2d<B>,
}

impl<B: Backend> Mlp<B> {
    fn new(dim: usize, hidden: usize, device: &B::Device) -> Self {
        Self {
            fc1: Conv2dConfig::new([dim, hidden], [1, 1]).init(device),
            fc2: Conv2dConfig::new([hidden, dim], [1, 1]).init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.fc2.forward(gelu(self.fc1.forward(x)))
    }
}

/// One transformer block over a feature map. Shape preserving.
#[derive(Module, Debug)]
pub struct StokenLayer<B: Backend> {
    pos_embed: Conv2d<B>,
    norm1: BatchNorm<B, 2>,
    attn: StokenAttention<B>,
    norm2: BatchNorm<B, 2>,
    mlp: Mlp<B>,
}

impl<B: Backend> StokenLayer<B> {
    pub fn new(
        dim: usize,
        stage: &StageConfig,
        mlp_ratio: f32,
        n_iter: usize,
        device: &B::Device,
    ) -> Self {
        let hidden = ((dim as f32 * mlp_ratio) as usize).max(1);
        Self {
            pos_embed: Conv2dConfig::new([dim, dim], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_groups(dim)
                .init(device),
            norm1: BatchNormConfig::new(dim).init(device),
            attn: StokenAttention::new(dim, stage.stoken_size, stage.heads, n_iter, device),
            norm2: BatchNormConfig::new(dim).init(device),
            mlp: Mlp::new(dim, hidden, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = x.clone() + self.pos_embed.forward(x);
        let x = x.clone() + self.attn.forward(self.norm1.forward(x));
        x.clone() + self.mlp.forward(self.norm2.forward(x))
    }
}

/// Stack of `depth` [`StokenLayer`]s at a fixed width.
#[derive(Module, Debug)]
pub struct StokenStage<B: Backend> {
    layers: Vec<StokenLayer<B>>,
}

impl<B: Backend> StokenStage<B> {
    pub fn new(
        dim: usize,
        stage: &StageConfig,
        mlp_ratio: f32,
        n_iter: usize,
        device: &B::Device,
    ) -> Self {
        let layers = (0..stage.depth)
            .map(|_| StokenLayer::new(dim, stage, mlp_ratio, n_iter, device))
            .collect();
        Self { layers }
    }

    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.layers.iter().fold(x, |x, layer| layer.forward(x))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::Distribution;

    type B = NdArray<f32>;

    #[test]
    fn global_attention_preserves_shape() {
        let device = Default::default();
        let attn = StokenAttention::<B>::new(8, [1, 1], 2, 1, &device);
        let x = Tensor::<B, 4>::random([2, 8, 4, 4], Distribution::Default, &device);
        assert_eq!(attn.forward(x).dims(), [2, 8, 4, 4]);
    }

    #[test]
    fn super_token_attention_preserves_shape() {
        let device = Default::default();
        let attn = StokenAttention::<B>::new(8, [2, 2], 2, 2, &device);
        let x = Tensor::<B, 4>::random([1, 8, 8, 6], Distribution::Default, &device);
        assert_eq!(attn.forward(x).dims(), [1, 8, 8, 6]);
    }

    #[test]
    fn local_association_rows_sum_to_one() {
        let device = Default::default();
        let attn = StokenAttention::<B>::new(8, [4, 4], 2, 2, &device);
        // 30x22 pads to an 8x6 grid of 4x4 cells
        let x = Tensor::<B, 4>::random([2, 8, 30, 22], Distribution::Default, &device);
        assert_eq!(attn.forward(x.clone()).dims(), [2, 8, 30, 22]);

        let affinity = attn.affinity(x);
        assert_eq!(affinity.dims(), [2, 48, 16, 9]);
        let sums = affinity.clone().sum_dim(3).into_data().to_vec::<f32>().unwrap();
        assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-4));

        // the top-left cell has no neighbour above or to the left
        let corner = affinity
            .slice([0..2, 0..1, 0..16, 0..3])
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        assert!(corner.iter().all(|w| *w < 1e-6));
    }

    #[test]
    fn full_resolution_stage_keeps_shape() {
        let device = Default::default();
        let attn = StokenAttention::<B>::new(16, [4, 4], 2, 1, &device);
        let x = Tensor::<B, 4>::random([1, 16, 96, 96], Distribution::Default, &device);
        assert_eq!(attn.forward(x.clone()).dims(), [1, 16, 96, 96]);
        assert_eq!(attn.affinity(x).dims(), [1, 576, 16, 9]);
    }

    #[test]
    fn stage_stacks_requested_depth() {
        let device = Default::default();
        let cfg = StageConfig::new(3, [2, 2], 4);
        let stage = StokenStage::<B>::new(16, &cfg, 4.0, 1, &device);
        assert_eq!(stage.depth(), 3);
        let x = Tensor::<B, 4>::random([1, 16, 4, 4], Distribution::Default, &device);
        assert_eq!(stage.forward(x).dims(), [1, 16, 4, 4]);
    }
}
