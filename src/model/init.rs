//! Parameter initialization applied once when the generator is built.
//!
//! Convolution weights follow the uniform Xavier/Glorot scheme, biases start
//! at zero and normalization layers start as the identity (unit scale, zero
//! shift, zero running mean, unit running variance).

use parking_lot::{Mutex, MutexGuard};
use tch::nn::{self, Init};

pub const KERNEL_SIZE: i64 = 4;
pub const STRIDE: i64 = 2;
pub const PADDING: i64 = 1;

/// Glorot bound `sqrt(6 / (fan_in + fan_out))` for a square `kernel` mapping
/// `in_channels` to `out_channels`.
///
/// Transposed convolutions store their weight as `(in, out, k, k)`, which swaps
/// the two fans but leaves their sum, and so the bound, unchanged.
pub fn xavier_bound(in_channels: i64, out_channels: i64, kernel: i64) -> f64 {
    let receptive_field = (kernel * kernel) as f64;
    let fan_in = in_channels as f64 * receptive_field;
    let fan_out = out_channels as f64 * receptive_field;
    (6.0 / (fan_in + fan_out)).sqrt()
}

pub fn xavier_uniform(in_channels: i64, out_channels: i64, kernel: i64) -> Init {
    let bound = xavier_bound(in_channels, out_channels, kernel);
    Init::Uniform {
        lo: -bound,
        up: bound,
    }
}

pub fn downsample_config(in_channels: i64, out_channels: i64) -> nn::ConvConfig {
    nn::ConvConfig {
        stride: STRIDE,
        padding: PADDING,
        ws_init: xavier_uniform(in_channels, out_channels, KERNEL_SIZE),
        bs_init: Init::Const(0.0),
        ..Default::default()
    }
}

pub fn upsample_config(in_channels: i64, out_channels: i64) -> nn::ConvTransposeConfig {
    nn::ConvTransposeConfig {
        stride: STRIDE,
        padding: PADDING,
        ws_init: xavier_uniform(in_channels, out_channels, KERNEL_SIZE),
        bs_init: Init::Const(0.0),
        ..Default::default()
    }
}

pub fn norm_config() -> nn::BatchNormConfig {
    nn::BatchNormConfig {
        ws_init: Init::Const(1.0),
        bs_init: Init::Const(0.0),
        ..Default::default()
    }
}

// libtorch draws every initial value from one process-wide generator.
static PARAMETER_INIT: Mutex<()> = Mutex::new(());

/// Hold this while seeding and drawing parameters so a seeded construction
/// sees an uninterrupted random stream.
pub fn parameter_init_guard() -> MutexGuard<'static, ()> {
    PARAMETER_INIT.lock()
}

/// Seed libtorch's global generator so parameter values are reproducible
/// across process starts. Without a seed every start draws fresh values.
pub fn seed_parameters(seed: Option<i64>) {
    if let Some(seed) = seed {
        tracing::debug!(seed, "seeding parameter initialization");
        tch::manual_seed(seed);
    }
}
