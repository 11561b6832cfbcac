// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 空间检测服务: 会话注册表 + 处理循环的统一入口
//!
//! 首个会话注册时启动处理循环; 最后一个会话断开时处理循环暂停但不销毁,
//! 重新注册后恢复. `shutdown` 是唯一的停止路径.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam_channel::Receiver;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::SpatialConfig;
use crate::error::Result;
use crate::pipeline::{
    DepthEstimator, FrameRenderer, ObjectDetector, PipelineContext, ProcessedFrame, ProcessingLoop,
};
use crate::projection::PinholeCamera;
use crate::render::{DisplayOptions, DisplayUpdate, OverlayRenderer};
use crate::session::{
    IngestStatus, SessionEvent, SessionId, SessionMeta, SessionRegistry, StreamSession,
};

/// 默认相机尺寸, 首个会话注册后按其帧尺寸调整
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;

/// 服务状态
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    /// "idle" | "running" | "paused" | "stopped" | "failed"
    pub status: String,
    pub connected_devices: Vec<SessionId>,
    pub active_stream: Option<SessionId>,
    pub detector_ready: bool,
    pub depth_ready: bool,
    pub frames_processed: u64,
}

/// 空间检测服务
pub struct SpatialService {
    registry: Arc<SessionRegistry>,
    ctx: PipelineContext,
    camera: Arc<PinholeCamera>,
    renderer: Option<Arc<OverlayRenderer>>,
    processing: Mutex<Option<ProcessingLoop>>,
    stopped: AtomicBool,
}

impl SpatialService {
    pub fn new(
        config: SpatialConfig,
        detector: Arc<dyn ObjectDetector>,
        depth: Arc<dyn DepthEstimator>,
    ) -> Self {
        let config = config.validated();
        let camera = Arc::new(
            PinholeCamera::with_image_size(DEFAULT_WIDTH, DEFAULT_HEIGHT, config.default_focal_length)
                .with_max_depth(config.max_depth),
        );
        let ctx = PipelineContext::new(config, detector, depth).with_camera(Arc::clone(&camera));
        Self {
            registry: Arc::new(SessionRegistry::new()),
            ctx,
            camera,
            renderer: None,
            processing: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    /// 使用叠加渲染器输出标注帧
    pub fn with_renderer(mut self, renderer: OverlayRenderer) -> Self {
        let renderer = Arc::new(renderer);
        let shared: Arc<dyn FrameRenderer> = renderer.clone();
        self.ctx.renderer = Some(shared);
        self.renderer = Some(renderer);
        self
    }

    /// 加载相机标定文件, 返回接受的字段数
    pub fn load_calibration<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        self.camera.load_calibration(path)
    }

    pub fn save_calibration<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.camera.save_calibration(path)
    }

    pub fn camera(&self) -> &Arc<PinholeCamera> {
        &self.camera
    }

    pub fn config(&self) -> &SpatialConfig {
        &self.ctx.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    fn processing(&self) -> MutexGuard<'_, Option<ProcessingLoop>> {
        self.processing.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    /// 注册客户端; 首个注册时启动处理循环
    pub fn register(&self, meta: SessionMeta) -> Result<SessionId> {
        let id = self.registry.register(meta);
        if self.is_stopped() {
            return Ok(id);
        }
        let mut processing = self.processing();
        if processing.is_none() {
            let worker = ProcessingLoop::start(Arc::clone(&self.registry), self.ctx.clone())?;
            *processing = Some(worker);
        }
        Ok(id)
    }

    pub fn ingest_frame(&self, id: SessionId, image: RgbImage) -> IngestStatus {
        self.registry.ingest_frame(id, image)
    }

    pub fn ingest_encoded(&self, id: SessionId, bytes: &[u8]) -> IngestStatus {
        self.registry.ingest_encoded(id, bytes)
    }

    pub fn select(&self, id: SessionId) -> Result<SessionEvent> {
        self.registry.select(id)
    }

    pub fn disconnect(&self, id: SessionId) -> Result<SessionEvent> {
        self.registry.disconnect(id)
    }

    pub fn sessions(&self) -> Vec<StreamSession> {
        self.registry.sessions()
    }

    /// 会话生命周期事件
    pub fn events(&self) -> Receiver<SessionEvent> {
        self.registry.events()
    }

    /// 处理结果订阅; 处理循环未启动时为None
    pub fn outputs(&self) -> Option<Receiver<ProcessedFrame>> {
        self.processing().as_ref().map(|p| p.outputs())
    }

    pub fn latest(&self) -> Option<ProcessedFrame> {
        self.processing().as_ref().and_then(|p| p.latest())
    }

    pub fn display_options(&self) -> Option<DisplayOptions> {
        self.renderer.as_ref().map(|r| r.options())
    }

    pub fn update_display(&self, update: DisplayUpdate) -> Option<DisplayOptions> {
        self.renderer.as_ref().map(|r| r.update_options(update))
    }

    pub fn status(&self) -> ServiceStatus {
        let processing = self.processing();
        let status = match processing.as_ref() {
            _ if self.is_stopped() => "stopped",
            None => "idle",
            Some(p) if !p.is_running() => "failed",
            Some(p) if p.is_paused() => "paused",
            Some(_) => "running",
        };
        ServiceStatus {
            status: status.to_string(),
            connected_devices: self.registry.sessions().iter().map(|s| s.id).collect(),
            active_stream: self.registry.active(),
            detector_ready: processing.is_some(),
            depth_ready: processing.is_some(),
            frames_processed: processing.as_ref().map_or(0, |p| p.frames_processed()),
        }
    }

    /// 停止处理循环; 之后的注册不再启动处理
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        let worker = self.processing().take();
        if let Some(mut worker) = worker {
            worker.shutdown();
        }
        info!("🛑 服务已关闭");
    }
}

impl Drop for SpatialService {
    fn drop(&mut self) {
        let worker = self.processing().take();
        if let Some(mut worker) = worker {
            worker.shutdown();
        }
    }
}
