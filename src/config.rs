use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use tch::Device;

/// Spatial resolution the generator is evaluated at.
pub const DEFAULT_IMAGE_SIZE: u32 = 256;

/// Eight halving stages: every side fed to the generator must be a multiple of this.
pub const SPATIAL_MULTIPLE: u32 = 256;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub device: Device,
    pub image_size: u32,
    pub seed: Option<i64>,
    pub inference_timeout: Option<Duration>,
    pub eager_init: bool,
    pub warmup_iters: usize,
    pub cors_origins: Vec<String>,
    pub max_body_bytes: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 3001),
            device: parse_device("auto"),
            image_size: DEFAULT_IMAGE_SIZE,
            seed: None,
            inference_timeout: None,
            eager_init: false,
            warmup_iters: 1,
            cors_origins: vec![
                "http://localhost:5173".to_string(),
                "http://localhost:3000".to_string(),
            ],
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let listen_addr = env::var("SERVER_ADDR")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.listen_addr);

        let device = env::var("DEVICE")
            .map(|raw| parse_device(&raw))
            .unwrap_or(defaults.device);

        let image_size = validate_image_size(
            env::var("IMAGE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.image_size),
        )?;

        let seed = env::var("GENERATOR_SEED").ok().and_then(|v| v.parse().ok());
        let inference_timeout = env::var("INFERENCE_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs);

        let eager_init = env::var("EAGER_INIT")
            .ok()
            .map(|v| parse_flag(&v))
            .unwrap_or(defaults.eager_init);
        let warmup_iters = env::var("WARMUP_ITERS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.warmup_iters);

        let cors_origins = env::var("CORS_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or(defaults.cors_origins);

        let max_body_bytes = env::var("MAX_BODY_BYTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_body_bytes);

        Ok(Self {
            listen_addr,
            device,
            image_size,
            seed,
            inference_timeout,
            eager_init,
            warmup_iters,
            cors_origins,
            max_body_bytes,
        })
    }
}

/// Short label for a device, e.g. `cpu` or `cuda:0`.
pub fn device_label(device: Device) -> String {
    match device {
        Device::Cpu => "cpu".to_string(),
        Device::Cuda(idx) => format!("cuda:{idx}"),
        other => format!("{other:?}").to_lowercase(),
    }
}

pub fn parse_device(raw: &str) -> Device {
    let lower = raw.trim().to_lowercase();
    if lower == "auto" {
        Device::cuda_if_available()
    } else if lower.starts_with("cuda") {
        let idx = lower
            .split(':')
            .nth(1)
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0);
        if tch::Cuda::is_available() {
            Device::Cuda(idx)
        } else {
            tracing::warn!(requested = %raw, "CUDA not available, falling back to cpu");
            Device::Cpu
        }
    } else {
        Device::Cpu
    }
}

fn validate_image_size(size: u32) -> anyhow::Result<u32> {
    anyhow::ensure!(
        size > 0 && size % SPATIAL_MULTIPLE == 0,
        "IMAGE_SIZE must be a positive multiple of {SPATIAL_MULTIPLE}, got {size}"
    );
    Ok(size)
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
