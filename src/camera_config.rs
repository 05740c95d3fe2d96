use serde::Deserialize;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CameraBackend {
    /// Probe for a Raspberry Pi camera, fall back to the simulated one.
    Auto,
    Rpi,
    Simulated,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CameraConfig {
    pub backend: CameraBackend,
    pub name: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub exposure_us: Option<u32>,
    pub gain: Option<f32>,
    pub preview_fps: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        CameraConfig {
            backend: CameraBackend::Auto,
            name: None,
            width: None,
            height: None,
            exposure_us: None,
            gain: None,
            preview_fps: 10,
        }
    }
}
