// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 处理上下文: 显式注入的协作者与配置

use std::sync::Arc;

use super::collaborators::{DepthEstimator, FrameRenderer, ObjectDetector};
use crate::config::SpatialConfig;
use crate::projection::PinholeCamera;

/// 处理循环所需的全部依赖, 构造一次后交给处理循环
#[derive(Clone)]
pub struct PipelineContext {
    pub config: SpatialConfig,
    pub detector: Arc<dyn ObjectDetector>,
    pub depth: Arc<dyn DepthEstimator>,
    pub renderer: Option<Arc<dyn FrameRenderer>>,
    /// 预先标定的相机; 为None时由首帧尺寸构建
    pub camera: Option<Arc<PinholeCamera>>,
}

impl PipelineContext {
    pub fn new(
        config: SpatialConfig,
        detector: Arc<dyn ObjectDetector>,
        depth: Arc<dyn DepthEstimator>,
    ) -> Self {
        Self {
            config: config.validated(),
            detector,
            depth,
            renderer: None,
            camera: None,
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn FrameRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn with_camera(mut self, camera: Arc<PinholeCamera>) -> Self {
        self.camera = Some(camera);
        self
    }
}
