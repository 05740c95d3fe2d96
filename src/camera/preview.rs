use crate::core::camera_manager::CameraManager;
use anyhow::Result;
use log::{debug, info};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

pub type PreviewFrame = Option<Arc<Vec<u8>>>;

/// Shares one device stream between any number of preview viewers. The
/// stream runs only while at least one viewer is subscribed.
pub struct PreviewHub {
    camera: Arc<CameraManager>,
    sink: Arc<watch::Sender<PreviewFrame>>,
    clients: Mutex<usize>,
}

impl PreviewHub {
    pub fn new(camera: Arc<CameraManager>) -> Self {
        let (sink, _) = watch::channel(None);
        PreviewHub {
            camera,
            sink: Arc::new(sink),
            clients: Mutex::new(0),
        }
    }

    pub async fn client_count(&self) -> usize {
        *self.clients.lock().await
    }

    pub async fn subscribe(&self) -> Result<watch::Receiver<PreviewFrame>> {
        let mut clients = self.clients.lock().await;
        let receiver = self.sink.subscribe();
        if *clients == 0 {
            debug!("First preview client connected, starting device stream.");
            self.camera.start_stream(Arc::clone(&self.sink)).await?;
        }
        *clients += 1;
        info!("👀 Preview clients: {}", *clients);
        Ok(receiver)
    }

    pub async fn unsubscribe(&self, receiver: watch::Receiver<PreviewFrame>) -> Result<()> {
        let mut clients = self.clients.lock().await;
        drop(receiver);
        if *clients == 0 {
            return Ok(());
        }
        *clients -= 1;
        if *clients == 0 {
            debug!("Last preview client left, stopping device stream.");
            self.camera.stop_stream().await?;
            self.sink.send_replace(None);
        }
        info!("👀 Preview clients: {}", *clients);
        Ok(())
    }
}
