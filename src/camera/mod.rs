pub mod simulated_camera;
pub mod rpi_camera;
pub mod preview;
