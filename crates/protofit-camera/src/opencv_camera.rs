use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use opencv::{
    core::Mat,
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureAPIs},
};
use protofit_types::{config::CameraConfig, vision::ImageFrame, Result};
use tracing::{debug, info};

use crate::{camera_error, CameraMetrics, CameraSource};

const PROBE_ATTEMPTS: u32 = 20;
const PROBE_DELAY: std::time::Duration = std::time::Duration::from_millis(50);

/// Local webcam read through OpenCV's `VideoCapture`.
pub struct OpencvCamera {
    config: CameraConfig,
    capture: Arc<Mutex<Option<VideoCapture>>>,
    dimensions: Arc<Mutex<Option<(u32, u32)>>>,
    ready: Arc<AtomicBool>,
    metrics: Arc<Mutex<CameraMetrics>>,
}

impl OpencvCamera {
    pub fn new(config: CameraConfig) -> Self {
        Self {
            config,
            capture: Arc::new(Mutex::new(None)),
            dimensions: Arc::new(Mutex::new(None)),
            ready: Arc::new(AtomicBool::new(false)),
            metrics: Arc::new(Mutex::new(CameraMetrics::default())),
        }
    }

    fn open_device(config: &CameraConfig) -> Result<(VideoCapture, (u32, u32))> {
        let mut capture =
            VideoCapture::new(config.device_index, VideoCaptureAPIs::CAP_ANY as i32).map_err(
                |err| camera_error(format!("failed to open camera {}: {err}", config.device_index)),
            )?;
        let opened = capture
            .is_opened()
            .map_err(|err| camera_error(format!("camera state query failed: {err}")))?;
        if !opened {
            return Err(camera_error(format!(
                "camera {} could not be opened (missing device or permission denied)",
                config.device_index
            )));
        }
        if let Some((width, height)) = config.resolution {
            capture
                .set(videoio::CAP_PROP_FRAME_WIDTH, f64::from(width))
                .map_err(|err| camera_error(format!("failed to request width: {err}")))?;
            capture
                .set(videoio::CAP_PROP_FRAME_HEIGHT, f64::from(height))
                .map_err(|err| camera_error(format!("failed to request height: {err}")))?;
        }
        // Devices commonly hand out a few empty frames while warming up.
        for attempt in 0..PROBE_ATTEMPTS {
            match Self::read_rgba(&mut capture) {
                Ok(frame) => return Ok((capture, frame.dimensions())),
                Err(err) => {
                    debug!("Webcam probe {} failed: {}", attempt + 1, err);
                    std::thread::sleep(PROBE_DELAY);
                }
            }
        }
        Err(camera_error(format!(
            "camera {} opened but produced no frames",
            config.device_index
        )))
    }

    fn read_rgba(capture: &mut VideoCapture) -> Result<ImageFrame> {
        let mut frame = Mat::default();
        capture
            .read(&mut frame)
            .map_err(|err| camera_error(format!("frame read failed: {err}")))?;
        if frame.empty() {
            return Err(camera_error("camera returned an empty frame"));
        }
        let mut rgba = Mat::default();
        imgproc::cvt_color(&frame, &mut rgba, imgproc::COLOR_BGR2RGBA, 0)
            .map_err(|err| camera_error(format!("color conversion failed: {err}")))?;
        let width = rgba.cols() as u32;
        let height = rgba.rows() as u32;
        let data = rgba
            .data_bytes()
            .map_err(|err| camera_error(format!("frame buffer unavailable: {err}")))?
            .to_vec();
        Ok(ImageFrame::from_rgba(width, height, data))
    }
}

#[async_trait]
impl CameraSource for OpencvCamera {
    async fn acquire(&self) -> Result<()> {
        info!("Opening webcam device {}", self.config.device_index);
        let config = self.config.clone();
        let (capture, dims) = tokio::task::spawn_blocking(move || Self::open_device(&config))
            .await
            .map_err(|err| camera_error(format!("camera open task failed: {err}")))??;

        *self
            .capture
            .lock()
            .map_err(|_| camera_error("failed to lock camera handle"))? = Some(capture);
        if let Ok(mut guard) = self.dimensions.lock() {
            *guard = Some(dims);
        }
        self.ready.store(true, Ordering::SeqCst);
        info!("Webcam producing {}x{} frames", dims.0, dims.1);
        if let Ok(mut metrics) = self.metrics.lock() {
            metrics.acquisitions += 1;
        }
        Ok(())
    }

    fn dimensions(&self) -> Option<(u32, u32)> {
        self.dimensions.lock().ok().and_then(|guard| *guard)
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn capture_frame(&self) -> Result<ImageFrame> {
        let capture = Arc::clone(&self.capture);
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = capture
                .lock()
                .map_err(|_| camera_error("failed to lock camera handle"))?;
            match guard.as_mut() {
                Some(capture) => Self::read_rgba(capture),
                None => Err(camera_error("camera is not open")),
            }
        })
        .await
        .map_err(|err| camera_error(format!("frame read task failed: {err}")))?;

        let mut metrics = self
            .metrics
            .lock()
            .map_err(|_| camera_error("failed to lock camera metrics"))?;
        match result {
            Ok(frame) => {
                if let Ok(mut dims) = self.dimensions.lock() {
                    *dims = Some((frame.width, frame.height));
                }
                metrics.frames_captured += 1;
                metrics.last_frame_at = Some(frame.captured_at);
                Ok(frame)
            }
            Err(err) => {
                metrics.failed_captures += 1;
                Err(err)
            }
        }
    }

    async fn release(&self) -> Result<()> {
        self.ready.store(false, Ordering::SeqCst);
        let taken = self
            .capture
            .lock()
            .map_err(|_| camera_error("failed to lock camera handle"))?
            .take();
        if let Some(mut capture) = taken {
            info!("Releasing webcam device {}", self.config.device_index);
            capture
                .release()
                .map_err(|err| camera_error(format!("camera release failed: {err}")))?;
            if let Ok(mut metrics) = self.metrics.lock() {
                metrics.releases += 1;
            }
        }
        if let Ok(mut dims) = self.dimensions.lock() {
            *dims = None;
        }
        Ok(())
    }

    fn metrics(&self) -> CameraMetrics {
        self.metrics.lock().map(|m| m.clone()).unwrap_or_default()
    }
}
