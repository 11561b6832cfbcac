// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 检测数据 (Detection Data)
///
/// 外部检测/深度模型与核心之间交换的数据结构
/// - BBox / Detection: 检测模型输出
/// - Position3D:       投影后的相机坐标
/// - DepthMap:         归一化稠密深度图
pub mod types;

pub use types::{BBox, DepthMap, Detection, Position3D};
