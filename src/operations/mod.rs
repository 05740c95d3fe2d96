pub mod op_helper;
pub mod snapshot_op;
pub mod timelapse_op;
pub mod archive_op;
pub mod camera_control_op;
pub mod console_op;
