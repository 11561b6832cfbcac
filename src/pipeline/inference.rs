// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 推理线程: 检测 + 深度调用, 带超时
//!
//! 处理循环把帧交给推理线程后以 `recv_timeout` 等待结果. 超时的结果在迟到时按序号丢弃,
//! 任务队列已满时新的请求直接返回 `WorkerUnavailable`.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use image::RgbImage;
use tracing::{debug, info, warn};

use super::collaborators::{DepthEstimator, ObjectDetector};
use crate::detection::{Detection, DepthMap};
use crate::error::{Result, SpatialError};

struct InferenceJob {
    seq: u64,
    image: Arc<RgbImage>,
}

struct InferenceOutput {
    seq: u64,
    result: Result<(Vec<Detection>, DepthMap)>,
    elapsed: Duration,
}

/// 推理线程句柄
pub struct InferenceWorker {
    detector: Arc<dyn ObjectDetector>,
    depth: Arc<dyn DepthEstimator>,
    tx_job: Sender<InferenceJob>,
    rx_output: Receiver<InferenceOutput>,
    handle: Option<JoinHandle<()>>,
    restarts: u32,
}

impl InferenceWorker {
    pub fn spawn(detector: Arc<dyn ObjectDetector>, depth: Arc<dyn DepthEstimator>) -> Result<Self> {
        let (tx_job, rx_output, handle) = Self::start_thread(&detector, &depth)?;
        Ok(Self {
            detector,
            depth,
            tx_job,
            rx_output,
            handle: Some(handle),
            restarts: 0,
        })
    }

    fn start_thread(
        detector: &Arc<dyn ObjectDetector>,
        depth: &Arc<dyn DepthEstimator>,
    ) -> Result<(Sender<InferenceJob>, Receiver<InferenceOutput>, JoinHandle<()>)> {
        // 最多一个执行中 + 一个排队
        let (tx_job, rx_job) = bounded::<InferenceJob>(1);
        let (tx_output, rx_output) = bounded::<InferenceOutput>(2);
        let detector = Arc::clone(detector);
        let depth = Arc::clone(depth);

        let handle = thread::Builder::new()
            .name("inference".to_string())
            .spawn(move || inference_thread(rx_job, tx_output, detector, depth))
            .map_err(|e| SpatialError::Spawn(e.to_string()))?;
        Ok((tx_job, rx_output, handle))
    }

    /// 推理线程意外退出(协作者panic)时重启
    fn ensure_alive(&mut self) -> Result<()> {
        let finished = self.handle.as_ref().map_or(true, |h| h.is_finished());
        if !finished {
            return Ok(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.restarts += 1;
        warn!("🔄 推理线程已退出, 重启 (第{}次)", self.restarts);
        let (tx_job, rx_output, handle) = Self::start_thread(&self.detector, &self.depth)?;
        self.tx_job = tx_job;
        self.rx_output = rx_output;
        self.handle = Some(handle);
        Ok(())
    }

    /// 提交一帧并等待结果, 最多等待 `timeout`
    pub fn infer(
        &mut self,
        seq: u64,
        image: Arc<RgbImage>,
        timeout: Duration,
    ) -> Result<(Vec<Detection>, DepthMap)> {
        self.ensure_alive()?;

        match self.tx_job.try_send(InferenceJob { seq, image }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                return Err(SpatialError::WorkerUnavailable);
            }
        }

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx_output.recv_timeout(remaining) {
                Ok(output) if output.seq == seq => {
                    debug!("推理完成 #{} 耗时 {:.1}ms", seq, output.elapsed.as_secs_f64() * 1000.0);
                    return output.result;
                }
                Ok(output) => {
                    debug!("丢弃迟到的推理结果 #{}", output.seq);
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(SpatialError::CollaboratorTimeout(timeout.as_millis() as u64));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(SpatialError::WorkerUnavailable);
                }
            }
        }
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }
}

fn inference_thread(
    rx_job: Receiver<InferenceJob>,
    tx_output: Sender<InferenceOutput>,
    detector: Arc<dyn ObjectDetector>,
    depth: Arc<dyn DepthEstimator>,
) {
    info!("✅ 推理线程启动 ({} + {})", detector.name(), depth.name());

    while let Ok(job) = rx_job.recv() {
        let start = Instant::now();
        let result = detector
            .detect(&job.image)
            .map_err(|e| SpatialError::collaborator(detector.name(), e))
            .and_then(|detections| {
                depth
                    .estimate(&job.image)
                    .map(|map| (detections, map))
                    .map_err(|e| SpatialError::collaborator(depth.name(), e))
            });

        let output = InferenceOutput {
            seq: job.seq,
            result,
            elapsed: start.elapsed(),
        };
        match tx_output.try_send(output) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("推理结果无人接收, 丢弃 #{}", job.seq),
            Err(TrySendError::Disconnected(_)) => break,
        }
    }

    info!("🛑 推理线程退出");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BBox;
    use ndarray::Array2;

    struct FixedDetector {
        delay: Duration,
    }

    impl ObjectDetector for FixedDetector {
        fn detect(&self, _frame: &RgbImage) -> anyhow::Result<Vec<Detection>> {
            thread::sleep(self.delay);
            Ok(vec![Detection::new(BBox::new(1.0, 1.0, 3.0, 3.0), "cup", 0.6)])
        }
    }

    struct FlatDepth;

    impl DepthEstimator for FlatDepth {
        fn estimate(&self, frame: &RgbImage) -> anyhow::Result<DepthMap> {
            let (w, h) = frame.dimensions();
            Ok(DepthMap::from_normalized(Array2::from_elem(
                (h as usize, w as usize),
                0.5,
            )))
        }
    }

    struct BrokenDepth;

    impl DepthEstimator for BrokenDepth {
        fn estimate(&self, _frame: &RgbImage) -> anyhow::Result<DepthMap> {
            anyhow::bail!("model not loaded")
        }
    }

    fn image() -> Arc<RgbImage> {
        Arc::new(RgbImage::new(8, 8))
    }

    #[test]
    fn returns_detections_and_depth() {
        let mut worker = InferenceWorker::spawn(
            Arc::new(FixedDetector {
                delay: Duration::ZERO,
            }),
            Arc::new(FlatDepth),
        )
        .unwrap();
        let (dets, depth) = worker.infer(0, image(), Duration::from_secs(2)).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(depth.width(), 8);
    }

    #[test]
    fn collaborator_error_is_reported() {
        let mut worker = InferenceWorker::spawn(
            Arc::new(FixedDetector {
                delay: Duration::ZERO,
            }),
            Arc::new(BrokenDepth),
        )
        .unwrap();
        let err = worker.infer(0, image(), Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, SpatialError::Collaborator { .. }));
        assert!(err.to_string().contains("model not loaded"));
    }

    #[test]
    fn slow_collaborator_times_out_and_late_result_is_discarded() {
        let mut worker = InferenceWorker::spawn(
            Arc::new(FixedDetector {
                delay: Duration::from_millis(200),
            }),
            Arc::new(FlatDepth),
        )
        .unwrap();
        let err = worker
            .infer(0, image(), Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, SpatialError::CollaboratorTimeout(20)));

        // 等待上一个请求完成后, 新请求拿到的是自己的结果
        thread::sleep(Duration::from_millis(300));
        let (dets, _) = worker.infer(1, image(), Duration::from_secs(2)).unwrap();
        assert_eq!(dets.len(), 1);
    }
}
