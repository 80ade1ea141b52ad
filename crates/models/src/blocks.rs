//! Convolutional building blocks of the U-Net: the double-conv block, the
//! encoder/decoder stages and the additive attention gate.
//!
//! Shapes are NCHW throughout.

use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d};
use burn::tensor::activation::{relu, sigmoid};
use burn::tensor::{backend::Backend, Tensor};

/// Two 3x3 convolutions, each followed by batch norm and ReLU.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        let conv1 = Conv2dConfig::new([in_channels, out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);
        let conv2 = Conv2dConfig::new([out_channels, out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);
        Self {
            conv1,
            bn1: BatchNormConfig::new(out_channels).init(device),
            conv2,
            bn2: BatchNormConfig::new(out_channels).init(device),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = relu(self.bn1.forward(self.conv1.forward(input)));
        relu(self.bn2.forward(self.conv2.forward(x)))
    }
}

/// `ConvBlock` followed by 2x2 max pooling. Channels go `in -> out`, spatial size halves.
#[derive(Module, Debug)]
pub struct EncoderBlock<B: Backend> {
    conv: ConvBlock<B>,
    pool: MaxPool2d,
}

impl<B: Backend> EncoderBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            conv: ConvBlock::new(in_channels, out_channels, device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }

    /// Returns `(skip, pooled)`; `skip` keeps the input resolution.
    pub fn forward(&self, input: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let skip = self.conv.forward(input);
        let pooled = self.pool.forward(skip.clone());
        (skip, pooled)
    }
}

/// Additive attention gate: `x * sigmoid(psi(relu(W_g g + W_x x)))`.
#[derive(Module, Debug)]
pub struct AttentionGate<B: Backend> {
    w_g: Conv2d<B>,
    bn_g: BatchNorm<B, 2>,
    w_x: Conv2d<B>,
    bn_x: BatchNorm<B, 2>,
    psi: Conv2d<B>,
}

impl<B: Backend> AttentionGate<B> {
    pub fn new(
        gate_channels: usize,
        inter_channels: usize,
        in_channels: usize,
        device: &B::Device,
    ) -> Self {
        let inter_channels = inter_channels.max(1);
        Self {
            w_g: Conv2dConfig::new([gate_channels, inter_channels], [1, 1]).init(device),
            bn_g: BatchNormConfig::new(inter_channels).init(device),
            w_x: Conv2dConfig::new([in_channels, inter_channels], [1, 1]).init(device),
            bn_x: BatchNormConfig::new(inter_channels).init(device),
            psi: Conv2dConfig::new([inter_channels, 1], [1, 1]).init(device),
        }
    }

    pub fn forward(&self, gate: Tensor<B, 4>, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let g1 = self.bn_g.forward(self.w_g.forward(gate));
        let x1 = self.bn_x.forward(self.w_x.forward(x.clone()));
        let psi = sigmoid(self.psi.forward(relu(g1 + x1)));
        let dims = x.dims();
        x * psi.expand(dims)
    }
}

/// Transposed-conv upsampling, skip concatenation, then `ConvBlock(2*out -> out)`.
///
/// With a gate the skip is reweighted by the attention gate before concatenation
/// and the gated tensor replaces the upsampled one in the concat.
#[derive(Module, Debug)]
pub struct DecoderBlock<B: Backend> {
    up: ConvTranspose2d<B>,
    gate: Option<AttentionGate<B>>,
    conv: ConvBlock<B>,
}

impl<B: Backend> DecoderBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            up: Self::upsampler(in_channels, out_channels, device),
            gate: None,
            conv: ConvBlock::new(out_channels * 2, out_channels, device),
        }
    }

    pub fn gated(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            up: Self::upsampler(in_channels, out_channels, device),
            gate: Some(AttentionGate::new(
                out_channels,
                out_channels / 2,
                out_channels,
                device,
            )),
            conv: ConvBlock::new(out_channels * 2, out_channels, device),
        }
    }

    fn upsampler(in_channels: usize, out_channels: usize, device: &B::Device) -> ConvTranspose2d<B> {
        ConvTranspose2dConfig::new([in_channels, out_channels], [2, 2])
            .with_stride([2, 2])
            .init(device)
    }

    /// The `[upsampled | skip]` tensor fed to the conv block.
    pub fn concat(&self, input: Tensor<B, 4>, skip: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.up.forward(input);
        let x = match &self.gate {
            Some(gate) => gate.forward(x, skip.clone()),
            None => x,
        };
        Tensor::cat(vec![x, skip], 1)
    }

    pub fn forward(&self, input: Tensor<B, 4>, skip: Tensor<B, 4>) -> Tensor<B, 4> {
        self.conv.forward(self.concat(input, skip))
    }
}

/// Decoder stage for inputs already at the skip resolution: concat, then `ConvBlock(2*in -> out)`.
#[derive(Module, Debug)]
pub struct SameScaleDecoderBlock<B: Backend> {
    conv: ConvBlock<B>,
}

impl<B: Backend> SameScaleDecoderBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            conv: ConvBlock::new(in_channels * 2, out_channels, device),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>, skip: Tensor<B, 4>) -> Tensor<B, 4> {
        self.conv.forward(Tensor::cat(vec![input, skip], 1))
    }
}
