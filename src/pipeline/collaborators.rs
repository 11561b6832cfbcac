// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 外部协作者接口
//!
//! 检测模型, 深度模型和渲染器都在核心之外实现, 处理循环只依赖这些trait.
//! 实现需要 `Send + Sync`: 检测与深度调用在独立的推理线程上执行.

use anyhow::Result;
use image::RgbImage;

use crate::detection::{Detection, DepthMap, Position3D};
use crate::tracking::MapSnapshot;

/// 目标检测模型
pub trait ObjectDetector: Send + Sync {
    /// 检测一帧, 返回像素坐标系下的检测框
    fn detect(&self, frame: &RgbImage) -> Result<Vec<Detection>>;

    fn name(&self) -> &str {
        "detector"
    }
}

/// 单目深度模型
pub trait DepthEstimator: Send + Sync {
    /// 估计稠密深度图
    fn estimate(&self, frame: &RgbImage) -> Result<DepthMap>;

    /// 查询单点深度, 越界返回None
    fn query_point(&self, depth: &DepthMap, x: i64, y: i64) -> Option<f32> {
        depth.get(x, y)
    }

    fn name(&self) -> &str {
        "depth"
    }
}

/// 检测 + 投影结果, 渲染器输入
#[derive(Clone, Debug, PartialEq)]
pub struct ProjectedDetection {
    pub detection: Detection,
    /// 投影失败时为零向量
    pub position: Position3D,
}

/// 标注帧渲染器, 输出编码后的字节
pub trait FrameRenderer: Send + Sync {
    fn render(
        &self,
        frame: &RgbImage,
        detections: &[ProjectedDetection],
        depth: &DepthMap,
        snapshot: &MapSnapshot,
    ) -> Result<Vec<u8>>;
}
