use crate::camera::rpi_camera::RpiCamera;
use crate::camera::simulated_camera::SimulatedCamera;
use crate::camera_config::{CameraBackend, CameraConfig};
use crate::core::capture_source::{CameraMetadata, CameraParams, CameraSource, Frame, StreamSink};
use crate::errors::AppError;
use anyhow::{Context, Result, bail};
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::RwLock;

/// Process-wide owner of the camera device.
///
/// Snapshots and stream control share a read lock and may overlap, including
/// with a running timelapse. Reconfiguration takes the write lock and is
/// refused while a timelapse holds the capture lease, so a session's frames
/// always share one resolution.
pub struct CameraManager {
    device: RwLock<Box<dyn CameraSource>>,
    leased: AtomicBool,
}

/// Held by the running timelapse; releases the device on drop.
pub struct CaptureLease {
    manager: Arc<CameraManager>,
}

impl Drop for CaptureLease {
    fn drop(&mut self) {
        self.manager.leased.store(false, Ordering::SeqCst);
        debug!("🔓 Capture lease released.");
    }
}

impl CameraManager {
    pub fn with_source(source: Box<dyn CameraSource>) -> Self {
        CameraManager {
            device: RwLock::new(source),
            leased: AtomicBool::new(false),
        }
    }

    /// Picks a backend by probing the environment and applies the configured parameters.
    pub async fn from_config(config: &CameraConfig) -> Result<Self> {
        debug!("🛠️ Initializing CameraManager...");
        let start_time = Instant::now();

        let source: Box<dyn CameraSource> = match config.backend {
            CameraBackend::Simulated => Box::new(SimulatedCamera::new(config.preview_fps)),
            CameraBackend::Rpi => match RpiCamera::probe(config.preview_fps) {
                Some(camera) => Box::new(camera),
                None => bail!("❌ Raspberry Pi camera requested but none was found."),
            },
            CameraBackend::Auto => match RpiCamera::probe(config.preview_fps) {
                Some(camera) => Box::new(camera),
                None => {
                    warn!("⚠️ No Raspberry Pi camera detected, using the simulated camera.");
                    Box::new(SimulatedCamera::new(config.preview_fps))
                }
            },
        };

        let manager = CameraManager::with_source(source);
        let params = CameraParams {
            name: config.name.clone(),
            width: config.width,
            height: config.height,
            exposure_us: config.exposure_us,
            gain: config.gain,
        };
        if !params.is_empty() {
            let changes = manager
                .set_params(&params)
                .await
                .context("Failed to apply configured camera parameters")?;
            debug!("Applied configured camera parameters:\n{}", changes);
        }

        info!(
            "✅ CameraManager initialized with '{}' ({}) in {:?}.",
            manager.metadata().await.name,
            manager.kind().await,
            start_time.elapsed()
        );
        Ok(manager)
    }

    pub async fn kind(&self) -> String {
        self.device.read().await.get_type()
    }

    pub async fn metadata(&self) -> CameraMetadata {
        self.device.read().await.metadata()
    }

    pub async fn snap(&self) -> Result<Frame> {
        let device = self.device.read().await;
        device.snap().await
    }

    pub async fn set_params(&self, params: &CameraParams) -> Result<String, AppError> {
        let mut device = self.device.write().await;
        if self.leased.load(Ordering::SeqCst) {
            return Err(AppError::DeviceBusy(
                "camera settings cannot change while a timelapse is running".to_string(),
            ));
        }
        let changes = device
            .set_params(params)
            .await
            .map_err(|e| AppError::Unexpected(format!("{:#}", e)))?;
        info!("🔧 Camera parameters updated:\n{}", changes);
        Ok(changes)
    }

    pub async fn start_stream(&self, sink: StreamSink) -> Result<()> {
        self.device.read().await.start_stream(sink).await
    }

    pub async fn stop_stream(&self) -> Result<()> {
        self.device.read().await.stop_stream().await
    }

    /// Claims the device for a timelapse. Returns `None` if another session holds it.
    pub fn try_lease(self: &Arc<Self>) -> Option<CaptureLease> {
        self.leased
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| {
                debug!("🔒 Capture lease acquired.");
                CaptureLease {
                    manager: Arc::clone(self),
                }
            })
    }

    pub fn is_leased(&self) -> bool {
        self.leased.load(Ordering::SeqCst)
    }
}
