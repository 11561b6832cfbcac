// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod config; // 运行参数
pub mod detection; // 检测数据结构
pub mod error; // 错误类型
pub mod pipeline; // 帧处理流水线
pub mod projection; // 针孔相机投影
pub mod render; // 标注帧渲染
pub mod service; // 服务入口
pub mod session; // 流会话注册表
pub mod tracking; // 三维空间跟踪

pub use crate::config::SpatialConfig;
pub use crate::detection::{BBox, DepthMap, Detection, Position3D};
pub use crate::error::{Result, SpatialError};
pub use crate::pipeline::{
    DepthEstimator, DetectionPayload, DetectionRecord, FrameRenderer, ObjectDetector,
    PipelineContext, ProcessedFrame, ProcessingLoop,
};
pub use crate::projection::{CameraIntrinsics, PinholeCamera};
pub use crate::render::OverlayRenderer;
pub use crate::service::{ServiceStatus, SpatialService};
pub use crate::session::{IngestStatus, SessionEvent, SessionId, SessionMeta, SessionRegistry};
pub use crate::tracking::{MapSnapshot, SpatialMap, TrackedObject};

/// 时间字符串 (北京时间), 用于输出文件命名
pub fn gen_time_string(delimiter: &str) -> String {
    let fmt = format!(
        "%Y{}%m{}%d{}%H{}%M{}%S{}%f",
        delimiter, delimiter, delimiter, delimiter, delimiter, delimiter
    );
    let now = chrono::Utc::now();
    match chrono::FixedOffset::east_opt(8 * 60 * 60) {
        Some(offset) => now.with_timezone(&offset).format(&fmt).to_string(),
        None => now.format(&fmt).to_string(),
    }
}
