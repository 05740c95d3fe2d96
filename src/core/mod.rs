pub mod capture_source;
pub mod camera_manager;
