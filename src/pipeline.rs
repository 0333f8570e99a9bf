use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use image::{Rgb, RgbImage};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tch::Device;
use tokio::task;

use crate::{
    codec,
    config::{AppConfig, device_label},
    error::ServiceError,
    model::{GeneratorMetadata, PipelineState, UNetGenerator},
};

/// Owns the process-wide generator and runs requests through
/// decode → resize → normalize → forward → denormalize → encode.
///
/// The generator is built on first use. Concurrent first callers wait on the
/// same guard, so at most one construction ever succeeds.
pub struct InferencePipeline {
    device: Device,
    seed: Option<i64>,
    image_size: u32,
    timeout: Option<Duration>,
    generator: OnceCell<Arc<UNetGenerator>>,
    constructions: AtomicUsize,
    // Accelerator contexts get one forward pass at a time.
    device_lock: Option<Mutex<()>>,
}

impl InferencePipeline {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            device: config.device,
            seed: config.seed,
            image_size: config.image_size,
            timeout: config.inference_timeout,
            generator: OnceCell::new(),
            constructions: AtomicUsize::new(0),
            device_lock: config.device.is_cuda().then(|| Mutex::new(())),
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn image_size(&self) -> u32 {
        self.image_size
    }

    pub fn state(&self) -> PipelineState {
        if self.generator.get().is_some() {
            PipelineState::Ready
        } else {
            PipelineState::Uninitialized
        }
    }

    /// Number of construction attempts made by this pipeline.
    pub fn constructions(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }

    pub fn metadata(&self) -> Option<GeneratorMetadata> {
        self.generator
            .get()
            .map(|generator| generator.metadata(self.image_size))
    }

    /// Return the generator, building it if this is the first call. A failed
    /// construction leaves the pipeline uninitialized.
    pub fn generator(&self) -> Result<Arc<UNetGenerator>, ServiceError> {
        self.generator
            .get_or_try_init(|| {
                self.constructions.fetch_add(1, Ordering::SeqCst);
                tracing::info!(device = %device_label(self.device), "initializing U-Net generator");
                UNetGenerator::new(self.device, self.seed).map(Arc::new)
            })
            .cloned()
    }

    /// Translate one encoded input image into PNG bytes. Blocks for the whole
    /// forward pass.
    pub fn handle_request(&self, raw: &[u8]) -> Result<Vec<u8>, ServiceError> {
        let generator = self.generator()?;

        let image = codec::decode_and_resize(raw, (self.image_size, self.image_size))?;
        let input = codec::to_tensor(&image);

        let output = match &self.device_lock {
            Some(lock) => {
                let _guard = lock.lock();
                generator.forward(&input)?
            }
            None => generator.forward(&input)?,
        };

        let translated = codec::from_tensor(&output)?;
        codec::encode_png(&translated)
    }

    /// Run [`Self::handle_request`] on the blocking pool, bounded by the
    /// configured timeout when one is set.
    pub async fn translate(self: &Arc<Self>, raw: Vec<u8>) -> Result<Vec<u8>, ServiceError> {
        let start = Instant::now();
        let input_bytes = raw.len();
        let pipeline = Arc::clone(self);
        let job = task::spawn_blocking(move || pipeline.handle_request(&raw));

        let joined = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, job)
                .await
                .map_err(|_| ServiceError::Timeout(limit))?,
            None => job.await,
        };
        let png = joined
            .map_err(|err| ServiceError::Device(format!("inference task failed: {err}")))??;

        tracing::info!(
            input_bytes,
            output_bytes = png.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "image translated"
        );
        Ok(png)
    }

    /// Build the generator now and push `iterations` mid-gray frames through
    /// it. Returns the mean forward latency.
    pub fn warm_up(&self, iterations: usize) -> Result<Duration, ServiceError> {
        self.generator()?;
        if iterations == 0 {
            return Ok(Duration::ZERO);
        }

        let gray = RgbImage::from_pixel(self.image_size, self.image_size, Rgb([128, 128, 128]));
        let raw = codec::encode_png(&gray)?;

        let start = Instant::now();
        for _ in 0..iterations {
            self.handle_request(&raw)?;
        }
        let mean = mean_latency(start.elapsed(), iterations);
        tracing::info!(iterations, mean_ms = mean.as_millis() as u64, "warm-up finished");
        Ok(mean)
    }
}

fn mean_latency(total: Duration, iterations: usize) -> Duration {
    if iterations == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(total.as_secs_f64() / iterations as f64)
}
