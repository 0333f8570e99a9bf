use std::time::Instant;

use tch::{Device, Tensor, nn};

use crate::{
    codec::RGB_CHANNELS,
    config::{SPATIAL_MULTIPLE, device_label},
    error::ServiceError,
    model::{
        GeneratorMetadata, init,
        stage::{Activation, DECODER_DROPOUT, DecoderStage, EncoderStage, LEAKY_SLOPE},
    },
};

/// Channel widths along the encoder: entry `i` feeds stage `i + 1`.
pub const ENCODER_CHANNELS: [i64; 9] = [RGB_CHANNELS, 64, 128, 256, 512, 512, 512, 512, 512];

/// `(input, output)` widths of each decoder stage. Inputs of stages 2..8
/// include the concatenated skip connection.
pub const DECODER_CHANNELS: [(i64, i64); 8] = [
    (512, 512),
    (1024, 512),
    (1024, 512),
    (1024, 512),
    (1024, 256),
    (512, 128),
    (256, 64),
    (128, RGB_CHANNELS),
];

/// Decoder stages that carry a dropout step.
const DROPOUT_STAGES: usize = 3;

/// U-Net generator: eight strided-convolution encoder stages, eight
/// transposed-convolution decoder stages, and seven skip connections joining
/// encoder stage `9 - k` to the input of decoder stage `k`.
///
/// Parameters are drawn once in [`UNetGenerator::new`] and never change.
pub struct UNetGenerator {
    vs: nn::VarStore,
    encoder: Vec<EncoderStage>,
    decoder: Vec<DecoderStage>,
    seed: Option<i64>,
}

impl UNetGenerator {
    pub fn new(device: Device, seed: Option<i64>) -> Result<Self, ServiceError> {
        validate_topology(&ENCODER_CHANNELS, &DECODER_CHANNELS)?;
        if device.is_cuda() && !tch::Cuda::is_available() {
            return Err(ServiceError::Device(format!(
                "{} requested but no CUDA runtime is available",
                device_label(device)
            )));
        }

        let start = Instant::now();
        let init_guard = init::parameter_init_guard();
        init::seed_parameters(seed);

        let vs = nn::VarStore::new(device);
        let root = vs.root();

        let last_encoder = ENCODER_CHANNELS.len() - 2;
        let encoder = ENCODER_CHANNELS
            .windows(2)
            .enumerate()
            .map(|(idx, widths)| {
                let (normalize, activation) = match idx {
                    0 => (false, Activation::LeakyRelu(LEAKY_SLOPE)),
                    i if i == last_encoder => (false, Activation::Relu),
                    _ => (true, Activation::LeakyRelu(LEAKY_SLOPE)),
                };
                EncoderStage::new(
                    &root / format!("enc{}", idx + 1),
                    widths[0],
                    widths[1],
                    normalize,
                    activation,
                )
            })
            .collect();

        let last_decoder = DECODER_CHANNELS.len() - 1;
        let decoder = DECODER_CHANNELS
            .iter()
            .enumerate()
            .map(|(idx, &(in_channels, out_channels))| {
                let head = idx == last_decoder;
                let dropout = (idx < DROPOUT_STAGES).then_some(DECODER_DROPOUT);
                let activation = if head {
                    Activation::Tanh
                } else {
                    Activation::Relu
                };
                DecoderStage::new(
                    &root / format!("dec{}", idx + 1),
                    in_channels,
                    out_channels,
                    !head,
                    dropout,
                    activation,
                )
            })
            .collect();

        drop(init_guard);

        let generator = Self {
            vs,
            encoder,
            decoder,
            seed,
        };

        tracing::info!(
            device = %device_label(device),
            parameters = generator.parameter_count(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "generator initialized"
        );

        Ok(generator)
    }

    pub fn device(&self) -> Device {
        self.vs.device()
    }

    pub fn parameter_count(&self) -> usize {
        self.vs
            .trainable_variables()
            .iter()
            .map(Tensor::numel)
            .sum()
    }

    /// Describe this generator as evaluated at `image_size` × `image_size`.
    pub fn metadata(&self, image_size: u32) -> GeneratorMetadata {
        GeneratorMetadata {
            device: device_label(self.device()),
            parameter_count: self.parameter_count(),
            seed: self.seed,
            image_size,
            encoder_stages: self.encoder.len(),
            decoder_stages: self.decoder.len(),
            skip_connections: self.decoder.len().saturating_sub(1),
        }
    }

    /// Run the network in inference mode on a `(1, 3, H, W)` tensor whose
    /// sides are multiples of 256. The result has the same shape, lives on the
    /// generator's device, and is bounded to [-1, 1].
    pub fn forward(&self, input: &Tensor) -> Result<Tensor, ServiceError> {
        check_input_shape(input)?;
        let xs = input.to(self.device());
        tch::no_grad(|| self.forward_inference(&xs))
    }

    fn forward_inference(&self, input: &Tensor) -> Result<Tensor, ServiceError> {
        let mut features = Vec::with_capacity(self.encoder.len());
        let mut xs = input.shallow_clone();
        for stage in &self.encoder {
            xs = stage.forward(&xs);
            features.push(xs.shallow_clone());
        }

        let (bottleneck, skips) = features
            .split_last()
            .ok_or_else(|| ServiceError::shape_mismatch("8 encoder stages", "none"))?;
        let (first, rest) = self
            .decoder
            .split_first()
            .ok_or_else(|| ServiceError::shape_mismatch("8 decoder stages", "none"))?;

        let mut ys = first.forward(bottleneck);
        for (stage, skip) in rest.iter().zip(skips.iter().rev()) {
            let joined = concat_skip(&ys, skip, stage.in_channels)?;
            ys = stage.forward(&joined);
        }
        Ok(ys)
    }
}

/// Check the channel bookkeeping of a topology: decoder stage 1 reads the
/// bottleneck, stage `k > 1` reads stage `k - 1` plus encoder stage `9 - k`.
pub fn validate_topology(encoder: &[i64], decoder: &[(i64, i64)]) -> Result<(), ServiceError> {
    let stages = encoder.len().saturating_sub(1);
    if stages == 0 || decoder.len() != stages {
        return Err(ServiceError::shape_mismatch(
            format!("{stages} decoder stages"),
            format!("{} decoder stages", decoder.len()),
        ));
    }

    // encoder[i + 1] is the output width of encoder stage i + 1.
    let bottleneck = encoder[stages];
    if decoder[0].0 != bottleneck {
        return Err(ServiceError::shape_mismatch(
            format!("decoder stage 1 input of {bottleneck} channels"),
            format!("{} channels", decoder[0].0),
        ));
    }

    for k in 1..stages {
        let skip = encoder[stages - k];
        let expected = decoder[k - 1].1 + skip;
        if decoder[k].0 != expected {
            return Err(ServiceError::shape_mismatch(
                format!("decoder stage {} input of {expected} channels", k + 1),
                format!("{} channels", decoder[k].0),
            ));
        }
    }

    let out = decoder[stages - 1].1;
    if out != encoder[0] {
        return Err(ServiceError::shape_mismatch(
            format!("{} output channels", encoder[0]),
            format!("{out} channels"),
        ));
    }

    Ok(())
}

/// Join a decoder output with its skip connection along the channel axis.
pub fn concat_skip(up: &Tensor, skip: &Tensor, expected_channels: i64) -> Result<Tensor, ServiceError> {
    let up_size = up.size();
    let skip_size = skip.size();

    let compatible = up_size.len() == 4
        && skip_size.len() == 4
        && up_size[0] == skip_size[0]
        && up_size[2..] == skip_size[2..]
        && up_size[1] + skip_size[1] == expected_channels;
    if !compatible {
        return Err(ServiceError::shape_mismatch(
            format!("{expected_channels} channels at matching resolution"),
            format!("{up_size:?} + {skip_size:?}"),
        ));
    }

    Ok(Tensor::cat(&[up, skip], 1))
}

fn check_input_shape(input: &Tensor) -> Result<(), ServiceError> {
    let size = input.size();
    let multiple = i64::from(SPATIAL_MULTIPLE);
    let valid = match size.as_slice() {
        &[1, RGB_CHANNELS, h, w] => h > 0 && w > 0 && h % multiple == 0 && w % multiple == 0,
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ServiceError::shape_mismatch(
            format!("(1, 3, H, W) with H and W multiples of {multiple}"),
            format!("{size:?}"),
        ))
    }
}
