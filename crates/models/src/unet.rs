//! UNet-STA: a four-level U-Net whose encoder and decoder stages are each
//! followed by a super-token attention stage.
//!
//! Shapes for an input `[N, C_in, H, W]` and base width `b` (default 64):
//! - encoder: `b, 2b, 4b, 8b` channels at `H/2 .. H/16` after pooling
//! - bottleneck: `16b` at `H/16`
//! - decoder: `8b, 4b, 2b, b` at `H/8 .. H`
//! - logits: `[N, num_classes, H, W]`

use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::tensor::{backend::Backend, Tensor};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::blocks::{ConvBlock, DecoderBlock, EncoderBlock};
use crate::stoken::{StageConfig, StokenStage};

#[derive(Debug, Error, PartialEq)]
pub enum ModelConfigError {
    #[error("{stage}: {heads} heads do not divide {channels} channels")]
    HeadsMismatch {
        stage: String,
        heads: usize,
        channels: usize,
    },
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
}

/// Which decoder block the network uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecoderVariant {
    /// Transposed conv, concat, double conv.
    #[default]
    Transposed,
    /// As `Transposed`, with an additive attention gate on the skip.
    Gated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UNetStaConfig {
    pub in_channels: usize,
    pub num_classes: usize,
    pub base_channels: usize,
    pub encoder_stages: [StageConfig; 4],
    pub decoder_stages: [StageConfig; 4],
    pub mlp_ratio: f32,
    pub n_iter: usize,
    pub decoder: DecoderVariant,
}

impl UNetStaConfig {
    pub fn new(in_channels: usize, num_classes: usize) -> Self {
        Self {
            in_channels,
            num_classes,
            base_channels: 64,
            encoder_stages: [
                StageConfig::new(1, [4, 4], 2),
                StageConfig::new(2, [2, 2], 4),
                StageConfig::new(3, [1, 1], 8),
                StageConfig::new(4, [1, 1], 16),
            ],
            decoder_stages: [
                StageConfig::new(4, [1, 1], 16),
                StageConfig::new(3, [1, 1], 8),
                StageConfig::new(2, [2, 2], 4),
                StageConfig::new(1, [4, 4], 2),
            ],
            mlp_ratio: 4.0,
            n_iter: 1,
            decoder: DecoderVariant::Transposed,
        }
    }

    pub fn with_base_channels(mut self, base_channels: usize) -> Self {
        self.base_channels = base_channels;
        self
    }

    pub fn with_decoder(mut self, decoder: DecoderVariant) -> Self {
        self.decoder = decoder;
        self
    }

    /// Output channels of e1..e4.
    pub fn encoder_channels(&self) -> [usize; 4] {
        let b = self.base_channels;
        [b, 2 * b, 4 * b, 8 * b]
    }

    /// Output channels of d1..d4.
    pub fn decoder_channels(&self) -> [usize; 4] {
        let [c1, c2, c3, c4] = self.encoder_channels();
        [c4, c3, c2, c1]
    }

    pub fn bottleneck_channels(&self) -> usize {
        16 * self.base_channels
    }

    /// `(upsampled, skip)` channel counts concatenated by each decoder stage.
    pub fn decoder_concat_channels(&self) -> [(usize, usize); 4] {
        let enc = self.encoder_channels();
        let dec = self.decoder_channels();
        [
            (dec[0], enc[3]),
            (dec[1], enc[2]),
            (dec[2], enc[1]),
            (dec[3], enc[0]),
        ]
    }

    pub fn validate(&self) -> Result<(), ModelConfigError> {
        if self.in_channels == 0 {
            return Err(ModelConfigError::Zero {
                field: "in_channels",
            });
        }
        if self.num_classes == 0 {
            return Err(ModelConfigError::Zero {
                field: "num_classes",
            });
        }
        if self.base_channels == 0 {
            return Err(ModelConfigError::Zero {
                field: "base_channels",
            });
        }
        let stages = self
            .encoder_channels()
            .into_iter()
            .zip(self.encoder_stages.iter())
            .enumerate()
            .map(|(i, (c, s))| (format!("encoder stage {}", i + 1), c, s))
            .chain(
                self.decoder_channels()
                    .into_iter()
                    .zip(self.decoder_stages.iter())
                    .enumerate()
                    .map(|(i, (c, s))| (format!("decoder stage {}", i + 1), c, s)),
            );
        for (stage, channels, cfg) in stages {
            if cfg.heads == 0 || channels % cfg.heads != 0 {
                return Err(ModelConfigError::HeadsMismatch {
                    stage,
                    heads: cfg.heads,
                    channels,
                });
            }
        }
        Ok(())
    }
}

/// Logits plus the intermediate maps consumed by feature distillation.
#[derive(Debug, Clone)]
pub struct UNetFeatures<B: Backend> {
    pub logits: Tensor<B, 4>,
    /// Refined pooled outputs of e1..e4.
    pub encoder: Vec<Tensor<B, 4>>,
    /// Refined outputs of d1..d3.
    pub decoder: Vec<Tensor<B, 4>>,
    /// Refined output of d4, at input resolution.
    pub final_up: Tensor<B, 4>,
}

#[derive(Module, Debug)]
pub struct UNetSta<B: Backend> {
    encoders: Vec<EncoderBlock<B>>,
    encoder_refine: Vec<StokenStage<B>>,
    bottleneck: ConvBlock<B>,
    decoders: Vec<DecoderBlock<B>>,
    decoder_refine: Vec<StokenStage<B>>,
    head: Conv2d<B>,
}

impl<B: Backend> UNetSta<B> {
    pub fn new(cfg: &UNetStaConfig, device: &B::Device) -> Self {
        let enc = cfg.encoder_channels();
        let dec = cfg.decoder_channels();

        let mut encoders = Vec::with_capacity(4);
        let mut encoder_refine = Vec::with_capacity(4);
        let mut in_channels = cfg.in_channels;
        for (channels, stage) in enc.iter().zip(cfg.encoder_stages.iter()) {
            encoders.push(EncoderBlock::new(in_channels, *channels, device));
            encoder_refine.push(StokenStage::new(
                *channels,
                stage,
                cfg.mlp_ratio,
                cfg.n_iter,
                device,
            ));
            in_channels = *channels;
        }

        let bottleneck = ConvBlock::new(enc[3], cfg.bottleneck_channels(), device);

        let mut decoders = Vec::with_capacity(4);
        let mut decoder_refine = Vec::with_capacity(4);
        let mut in_channels = cfg.bottleneck_channels();
        for (channels, stage) in dec.iter().zip(cfg.decoder_stages.iter()) {
            let block = match cfg.decoder {
                DecoderVariant::Transposed => DecoderBlock::new(in_channels, *channels, device),
                DecoderVariant::Gated => DecoderBlock::gated(in_channels, *channels, device),
            };
            decoders.push(block);
            decoder_refine.push(StokenStage::new(
                *channels,
                stage,
                cfg.mlp_ratio,
                cfg.n_iter,
                device,
            ));
            in_channels = *channels;
        }

        let head = Conv2dConfig::new([dec[3], cfg.num_classes], [1, 1]).init(device);

        Self {
            encoders,
            encoder_refine,
            bottleneck,
            decoders,
            decoder_refine,
            head,
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.forward_features(input).logits
    }

    pub fn forward_features(&self, input: Tensor<B, 4>) -> UNetFeatures<B> {
        let mut skips = Vec::with_capacity(self.encoders.len());
        let mut encoder = Vec::with_capacity(self.encoders.len());
        let mut x = input;
        for (block, refine) in self.encoders.iter().zip(self.encoder_refine.iter()) {
            let (skip, pooled) = block.forward(x);
            x = refine.forward(pooled);
            skips.push(skip);
            encoder.push(x.clone());
        }

        x = self.bottleneck.forward(x);

        let mut decoder = Vec::with_capacity(self.decoders.len());
        for ((block, refine), skip) in self
            .decoders
            .iter()
            .zip(self.decoder_refine.iter())
            .zip(skips.into_iter().rev())
        {
            x = refine.forward(block.forward(x, skip));
            decoder.push(x.clone());
        }

        let final_up = x;
        decoder.pop();
        UNetFeatures {
            logits: self.head.forward(final_up.clone()),
            encoder,
            decoder,
            final_up,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_reference_widths() {
        let cfg = UNetStaConfig::new(1, 9);
        assert_eq!(cfg.encoder_channels(), [64, 128, 256, 512]);
        assert_eq!(cfg.bottleneck_channels(), 1024);
        assert_eq!(cfg.decoder_channels(), [512, 256, 128, 64]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_heads_that_do_not_divide_width() {
        let mut cfg = UNetStaConfig::new(1, 2).with_base_channels(6);
        cfg.encoder_stages[0].heads = 4;
        assert!(matches!(
            cfg.validate(),
            Err(ModelConfigError::HeadsMismatch { channels: 6, heads: 4, .. })
        ));
    }

    #[test]
    fn validate_rejects_zero_classes() {
        let cfg = UNetStaConfig::new(1, 0);
        assert_eq!(
            cfg.validate(),
            Err(ModelConfigError::Zero {
                field: "num_classes"
            })
        );
    }
}
