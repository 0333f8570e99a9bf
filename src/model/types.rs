use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct GeneratorMetadata {
    pub device: String,
    pub parameter_count: usize,
    pub seed: Option<i64>,
    pub image_size: u32,
    pub encoder_stages: usize,
    pub decoder_stages: usize,
    pub skip_connections: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Uninitialized,
    Ready,
}
