use tch::{
    Tensor,
    nn::{self, Module, ModuleT},
};

use crate::model::init::{self, KERNEL_SIZE};

/// Slope of the leaky rectifier used throughout the encoder.
pub const LEAKY_SLOPE: f64 = 0.2;

/// Dropout rate of the first decoder stages. Only active in training mode,
/// which this crate never enters.
pub const DECODER_DROPOUT: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Activation {
    LeakyRelu(f64),
    Relu,
    Tanh,
}

impl Activation {
    pub fn apply(self, xs: &Tensor) -> Tensor {
        match self {
            // max(x, 0) + slope * min(x, 0)
            Activation::LeakyRelu(slope) => xs.relu() - xs.neg().relu() * slope,
            Activation::Relu => xs.relu(),
            Activation::Tanh => xs.tanh(),
        }
    }
}

/// One downsampling block: strided convolution, optional normalization,
/// activation.
pub struct EncoderStage {
    pub in_channels: i64,
    pub out_channels: i64,
    conv: nn::Conv2D,
    norm: Option<nn::BatchNorm>,
    activation: Activation,
}

impl EncoderStage {
    pub fn new(
        path: nn::Path,
        in_channels: i64,
        out_channels: i64,
        normalize: bool,
        activation: Activation,
    ) -> Self {
        let conv = nn::conv2d(
            &path / "conv",
            in_channels,
            out_channels,
            KERNEL_SIZE,
            init::downsample_config(in_channels, out_channels),
        );
        let norm = normalize
            .then(|| nn::batch_norm2d(&path / "norm", out_channels, init::norm_config()));

        Self {
            in_channels,
            out_channels,
            conv,
            norm,
            activation,
        }
    }

    pub fn forward(&self, xs: &Tensor) -> Tensor {
        let xs = self.conv.forward(xs);
        let xs = match &self.norm {
            Some(norm) => norm.forward_t(&xs, false),
            None => xs,
        };
        self.activation.apply(&xs)
    }
}

/// One upsampling block: strided transposed convolution, optional
/// normalization, optional dropout, activation.
pub struct DecoderStage {
    pub in_channels: i64,
    pub out_channels: i64,
    deconv: nn::ConvTranspose2D,
    norm: Option<nn::BatchNorm>,
    dropout: Option<f64>,
    activation: Activation,
}

impl DecoderStage {
    pub fn new(
        path: nn::Path,
        in_channels: i64,
        out_channels: i64,
        normalize: bool,
        dropout: Option<f64>,
        activation: Activation,
    ) -> Self {
        let deconv = nn::conv_transpose2d(
            &path / "deconv",
            in_channels,
            out_channels,
            KERNEL_SIZE,
            init::upsample_config(in_channels, out_channels),
        );
        let norm = normalize
            .then(|| nn::batch_norm2d(&path / "norm", out_channels, init::norm_config()));

        Self {
            in_channels,
            out_channels,
            deconv,
            norm,
            dropout,
            activation,
        }
    }

    pub fn forward(&self, xs: &Tensor) -> Tensor {
        let xs = self.deconv.forward(xs);
        let xs = match &self.norm {
            Some(norm) => norm.forward_t(&xs, false),
            None => xs,
        };
        let xs = match self.dropout {
            Some(rate) => xs.dropout(rate, false),
            None => xs,
        };
        self.activation.apply(&xs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn leaky_relu_scales_negative_side() {
        let xs = Tensor::from_slice(&[-2.0f32, -0.5, 0.0, 3.0]);
        let ys = Activation::LeakyRelu(LEAKY_SLOPE).apply(&xs);
        let ys = Vec::<f32>::try_from(&ys).unwrap();
        let expected = [-0.4f32, -0.1, 0.0, 3.0];
        for (y, e) in ys.iter().zip(expected) {
            assert!((y - e).abs() < 1e-6, "{y} != {e}");
        }
    }

    #[test]
    fn encoder_stage_halves_resolution() {
        let _init = init::parameter_init_guard();
        let vs = nn::VarStore::new(Device::Cpu);
        let stage = EncoderStage::new(
            &vs.root() / "e",
            3,
            8,
            true,
            Activation::LeakyRelu(LEAKY_SLOPE),
        );
        let xs = Tensor::linspace(-1.0, 1.0, 3 * 32 * 32, (Kind::Float, Device::Cpu))
            .reshape([1, 3, 32, 32]);
        let ys = tch::no_grad(|| stage.forward(&xs));
        assert_eq!(ys.size(), vec![1, 8, 16, 16]);
    }

    #[test]
    fn decoder_stage_doubles_resolution_and_is_deterministic() {
        let _init = init::parameter_init_guard();
        let vs = nn::VarStore::new(Device::Cpu);
        let stage = DecoderStage::new(
            &vs.root() / "d",
            8,
            4,
            true,
            Some(DECODER_DROPOUT),
            Activation::Relu,
        );
        let xs = Tensor::linspace(-1.0, 1.0, 8 * 4 * 4, (Kind::Float, Device::Cpu))
            .reshape([1, 8, 4, 4]);
        let (a, b) = tch::no_grad(|| (stage.forward(&xs), stage.forward(&xs)));
        assert_eq!(a.size(), vec![1, 4, 8, 8]);
        assert!(a.equal(&b));
        assert!(a.min().double_value(&[]) >= 0.0);
    }

    #[test]
    fn normalization_starts_as_identity() {
        let _init = init::parameter_init_guard();
        let vs = nn::VarStore::new(Device::Cpu);
        let _stage = EncoderStage::new(&vs.root() / "e", 3, 4, true, Activation::Relu);
        let vars = vs.variables();
        assert!(vars["e.norm.weight"].equal(&Tensor::ones([4], (Kind::Float, Device::Cpu))));
        assert!(vars["e.norm.bias"].equal(&Tensor::zeros([4], (Kind::Float, Device::Cpu))));
        assert!(vars["e.conv.bias"].equal(&Tensor::zeros([4], (Kind::Float, Device::Cpu))));

        let bound = init::xavier_bound(3, 4, KERNEL_SIZE);
        let weights = &vars["e.conv.weight"];
        assert_eq!(weights.size(), vec![4, 3, 4, 4]);
        assert!(weights.abs().max().double_value(&[]) <= bound + 1e-6);
    }
}
