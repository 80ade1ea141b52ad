//! Burn modules for UNet-STA, a U-Net with super-token attention stages.
//!
//! - `blocks`: double-conv block, encoder/decoder stages, attention gate.
//! - `stoken`: super-token attention refinement stages.
//! - `unet`: the full encoder/decoder network and its config.
//!
//! These are pure Burn modules; losses, data and the training driver live in
//! the `training` and `seg_dataset` crates.

pub mod blocks;
pub mod stoken;
pub mod unet;

pub use blocks::{AttentionGate, ConvBlock, DecoderBlock, EncoderBlock, SameScaleDecoderBlock};
pub use stoken::{StageConfig, StokenAttention, StokenLayer, StokenStage};
pub use unet::{DecoderVariant, ModelConfigError, UNetFeatures, UNetSta, UNetStaConfig};

pub mod prelude {
    pub use super::{DecoderVariant, UNetFeatures, UNetSta, UNetStaConfig};
}
