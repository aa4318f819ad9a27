//! Webcam acquisition abstraction layer.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use protofit_types::{
    config::{CameraBackend, CameraConfig},
    vision::ImageFrame,
    ProtofitError, Result,
};
use tokio::time::{sleep, Duration};
use tracing::info;

#[cfg(feature = "opencv")]
mod opencv_camera;

#[cfg(feature = "opencv")]
pub use opencv_camera::OpencvCamera;

/// Aggregated camera counters.
#[derive(Debug, Default, Clone)]
pub struct CameraMetrics {
    pub acquisitions: u64,
    pub releases: u64,
    pub frames_captured: u64,
    pub failed_captures: u64,
    pub last_frame_at: Option<DateTime<Utc>>,
}

/// A webcam stream plus the sink decoding it.
///
/// `acquire` corresponds to asking the host for camera access; once it
/// returns, the source may still take a while before `dimensions` is known
/// and `is_ready` reports decodable frames.
#[async_trait]
pub trait CameraSource: Send + Sync {
    async fn acquire(&self) -> Result<()>;
    fn dimensions(&self) -> Option<(u32, u32)>;
    fn is_ready(&self) -> bool;
    async fn capture_frame(&self) -> Result<ImageFrame>;
    async fn release(&self) -> Result<()>;
    fn metrics(&self) -> CameraMetrics;
}

#[async_trait]
impl<T: CameraSource + ?Sized> CameraSource for Arc<T> {
    async fn acquire(&self) -> Result<()> {
        (**self).acquire().await
    }

    fn dimensions(&self) -> Option<(u32, u32)> {
        (**self).dimensions()
    }

    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }

    async fn capture_frame(&self) -> Result<ImageFrame> {
        (**self).capture_frame().await
    }

    async fn release(&self) -> Result<()> {
        (**self).release().await
    }

    fn metrics(&self) -> CameraMetrics {
        (**self).metrics()
    }
}

/// Synthetic camera used for tests and machines without a webcam.
///
/// Produces a moving gradient so consecutive frames differ.
pub struct MockCamera {
    width: u32,
    height: u32,
    deny_reason: Mutex<Option<String>>,
    streaming: AtomicBool,
    ready: AtomicBool,
    auto_ready: bool,
    acquire_delay: Duration,
    frame_delay: Duration,
    frame_counter: AtomicU64,
    metrics: Mutex<CameraMetrics>,
}

impl MockCamera {
    pub const DEFAULT_RESOLUTION: (u32, u32) = (640, 480);

    pub fn new(config: &CameraConfig) -> Self {
        let (width, height) = config.resolution.unwrap_or(Self::DEFAULT_RESOLUTION);
        Self::with_resolution(width, height)
    }

    pub fn with_resolution(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            deny_reason: Mutex::new(None),
            streaming: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            auto_ready: true,
            acquire_delay: Duration::from_millis(5),
            frame_delay: Duration::ZERO,
            frame_counter: AtomicU64::new(0),
            metrics: Mutex::new(CameraMetrics::default()),
        }
    }

    /// Every `acquire` fails with `reason` until `allow` is called.
    pub fn denying(self, reason: impl Into<String>) -> Self {
        if let Ok(mut guard) = self.deny_reason.lock() {
            *guard = Some(reason.into());
        }
        self
    }

    /// Keep the sink from producing frames after `acquire` until `set_ready(true)`.
    pub fn manual_ready(mut self) -> Self {
        self.auto_ready = false;
        self
    }

    /// How long `acquire` takes, like a webcam warming up.
    pub fn acquire_delay(mut self, delay: Duration) -> Self {
        self.acquire_delay = delay;
        self
    }

    /// Extra latency for every `capture_frame` once the sink is ready.
    pub fn frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = delay;
        self
    }

    pub fn allow(&self) {
        if let Ok(mut guard) = self.deny_reason.lock() {
            *guard = None;
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    fn render_gradient(&self, tick: u64) -> Vec<u8> {
        let mut data = Vec::with_capacity((self.width as usize) * (self.height as usize) * 4);
        let width = self.width.max(1);
        let height = self.height.max(1);
        let shift = ((tick * 4) % u64::from(width)) as u32;
        for y in 0..self.height {
            for x in 0..self.width {
                let r = (((x + shift) % width) * 255 / width) as u8;
                let g = (y * 255 / height) as u8;
                let b = (tick % 256) as u8;
                data.extend_from_slice(&[r, g, b, 255]);
            }
        }
        data
    }
}

#[async_trait]
impl CameraSource for MockCamera {
    async fn acquire(&self) -> Result<()> {
        let denied = self
            .deny_reason
            .lock()
            .map_err(|_| camera_error("failed to lock mock camera state"))?
            .clone();
        if let Some(reason) = denied {
            info!("Mock camera denying access: {}", reason);
            return Err(camera_error(reason));
        }
        info!("Acquiring mock camera {}x{}", self.width, self.height);
        sleep(self.acquire_delay).await;
        self.streaming.store(true, Ordering::SeqCst);
        if self.auto_ready {
            self.ready.store(true, Ordering::SeqCst);
        }
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.acquisitions += 1;
        }
        Ok(())
    }

    fn dimensions(&self) -> Option<(u32, u32)> {
        if self.streaming.load(Ordering::SeqCst) {
            Some((self.width, self.height))
        } else {
            None
        }
    }

    fn is_ready(&self) -> bool {
        self.streaming.load(Ordering::SeqCst) && self.ready.load(Ordering::SeqCst)
    }

    async fn capture_frame(&self) -> Result<ImageFrame> {
        if !self.is_ready() {
            if let Ok(mut metrics) = self.metrics.lock() {
                metrics.failed_captures += 1;
            }
            return Err(camera_error("mock camera is not producing frames"));
        }
        if !self.frame_delay.is_zero() {
            sleep(self.frame_delay).await;
        }
        let tick = self.frame_counter.fetch_add(1, Ordering::SeqCst);
        let frame = ImageFrame::from_rgba(self.width, self.height, self.render_gradient(tick));
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.frames_captured += 1;
            metrics.last_frame_at = Some(frame.captured_at);
        }
        Ok(frame)
    }

    async fn release(&self) -> Result<()> {
        if self.streaming.swap(false, Ordering::SeqCst) {
            info!("Releasing mock camera");
            if let Ok(mut metrics) = self.metrics.lock() {
                metrics.releases += 1;
            }
        }
        if self.auto_ready {
            self.ready.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    fn metrics(&self) -> CameraMetrics {
        self.metrics.lock().map(|m| m.clone()).unwrap_or_default()
    }
}

/// Build the configured camera backend.
pub fn open_camera(config: &CameraConfig) -> Result<Arc<dyn CameraSource>> {
    match config.backend {
        CameraBackend::Mock => Ok(Arc::new(MockCamera::new(config))),
        #[cfg(feature = "opencv")]
        CameraBackend::Opencv => Ok(Arc::new(OpencvCamera::new(config.clone()))),
        #[cfg(not(feature = "opencv"))]
        CameraBackend::Opencv => Err(camera_error(
            "camera.backend = \"opencv\" requires building with the `opencv` feature",
        )),
    }
}

/// Generate an error aligned with camera semantics.
pub fn camera_error(message: impl Into<String>) -> ProtofitError {
    ProtofitError::Camera(message.into())
}
