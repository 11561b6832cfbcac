// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 帧处理流水线 (Frame Processing Pipeline)
///
/// 双线程架构, 通过crossbeam通道通信:
/// - Processing: 取活动会话最新帧, 投影/跟踪/渲染, 发布结果
/// - Inference:  调用检测与深度协作者 (带超时)
///
/// 协作者通过 `PipelineContext` 显式注入.
pub mod collaborators;
pub mod context;
pub mod inference;
pub mod payload;
pub mod processor;
pub mod synthetic;
pub mod worker;

pub use collaborators::{DepthEstimator, FrameRenderer, ObjectDetector, ProjectedDetection};
pub use context::PipelineContext;
pub use inference::InferenceWorker;
pub use payload::{DetectionPayload, DetectionRecord};
pub use processor::{FrameProcessor, ProcessedFrame};
pub use worker::ProcessingLoop;
