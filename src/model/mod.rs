mod generator;
pub mod init;
mod stage;
mod types;

pub use generator::{
    DECODER_CHANNELS, ENCODER_CHANNELS, UNetGenerator, concat_skip, validate_topology,
};
pub use stage::{Activation, DecoderStage, EncoderStage};
pub use types::{GeneratorMetadata, PipelineState};
