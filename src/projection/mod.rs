// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 投影系统 (Projection System)
///
/// 像素 + 深度 → 相机坐标 (米)
/// - PinholeCamera: 可重新标定的针孔相机投影器
pub mod camera;

pub use camera::{CameraIntrinsics, PinholeCamera, ProjectionError, MAX_DEPTH};
