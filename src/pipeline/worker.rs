// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 处理循环线程
//!
//! 单个后台线程: 取活动会话最新帧 → 推理线程(超时) → 投影/跟踪/渲染 → 发布结果.
//! 停止标志在每轮开头检查; 暂停时不销毁相机/跟踪器状态.
//! 单轮内的panic被捕获并计为跳过, 处理线程不会因此退出.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, error, info, warn};

use super::context::PipelineContext;
use super::inference::InferenceWorker;
use super::processor::{FrameProcessor, ProcessedFrame};
use crate::error::{Result, SpatialError};
use crate::session::{ControlMessage, SessionEvent, SessionRegistry, SessionStatus};

/// 结果通道容量, 消费慢时丢弃新结果
const OUTPUT_CAPACITY: usize = 8;

/// 会话超时检查间隔
const PRUNE_INTERVAL: Duration = Duration::from_secs(1);

/// 处理循环共享状态
struct LoopShared {
    stop: AtomicBool,
    paused: AtomicBool,
    frames_processed: AtomicU64,
    cycles_skipped: AtomicU64,
    latest: Mutex<Option<ProcessedFrame>>,
}

/// 处理循环句柄
pub struct ProcessingLoop {
    shared: Arc<LoopShared>,
    outputs: Receiver<ProcessedFrame>,
    handle: Option<JoinHandle<()>>,
    worker_id: ThreadId,
}

impl ProcessingLoop {
    /// 启动处理线程
    pub fn start(registry: Arc<SessionRegistry>, ctx: PipelineContext) -> Result<Self> {
        let shared = Arc::new(LoopShared {
            stop: AtomicBool::new(false),
            paused: AtomicBool::new(registry.active().is_none()),
            frames_processed: AtomicU64::new(0),
            cycles_skipped: AtomicU64::new(0),
            latest: Mutex::new(None),
        });
        let (tx_output, outputs) = bounded(OUTPUT_CAPACITY);
        let inference = InferenceWorker::spawn(Arc::clone(&ctx.detector), Arc::clone(&ctx.depth))?;

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("processing".to_string())
            .spawn(move || {
                let mut worker = Worker::new(registry, ctx, inference, thread_shared, tx_output);
                worker.run();
            })
            .map_err(|e| SpatialError::Spawn(e.to_string()))?;
        let worker_id = handle.thread().id();

        info!("🚀 处理循环已启动");
        Ok(Self {
            shared,
            outputs,
            handle: Some(handle),
            worker_id,
        })
    }

    /// 结果订阅
    pub fn outputs(&self) -> Receiver<ProcessedFrame> {
        self.outputs.clone()
    }

    /// 最近一次处理结果
    pub fn latest(&self) -> Option<ProcessedFrame> {
        self.shared
            .latest
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn frames_processed(&self) -> u64 {
        self.shared.frames_processed.load(Ordering::Relaxed)
    }

    pub fn cycles_skipped(&self) -> u64 {
        self.shared.cycles_skipped.load(Ordering::Relaxed)
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::Relaxed);
    }

    /// 停止处理线程; 在处理线程自身中调用时只设置标志不join
    pub fn shutdown(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        if thread::current().id() == self.worker_id {
            debug!("在处理线程内请求停止, 跳过join");
            return;
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("⚠️  处理线程异常退出");
            }
            info!("🛑 处理循环已停止");
        }
    }
}

impl Drop for ProcessingLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// 单轮结果
enum Cycle {
    Processed,
    Idle,
    Skipped,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct Worker {
    registry: Arc<SessionRegistry>,
    control: Receiver<ControlMessage>,
    inference: InferenceWorker,
    processor: FrameProcessor,
    shared: Arc<LoopShared>,
    tx_output: Sender<ProcessedFrame>,
    idle_sleep: Duration,
    timeout: Duration,
    session_timeout: Duration,
    last_prune: Instant,
    // 统计
    stats_count: u64,
    stats_last: Instant,
    stats_infer_ms: f64,
}

impl Worker {
    fn new(
        registry: Arc<SessionRegistry>,
        ctx: PipelineContext,
        inference: InferenceWorker,
        shared: Arc<LoopShared>,
        tx_output: Sender<ProcessedFrame>,
    ) -> Self {
        let control = registry.control_receiver();
        let processor = FrameProcessor::new(
            ctx.config.clone(),
            Arc::clone(&ctx.depth),
            ctx.renderer.clone(),
            ctx.camera.clone(),
        );
        Self {
            registry,
            control,
            inference,
            processor,
            shared,
            tx_output,
            idle_sleep: ctx.config.idle_sleep(),
            timeout: ctx.config.collaborator_timeout(),
            session_timeout: ctx.config.session_timeout(),
            last_prune: Instant::now(),
            stats_count: 0,
            stats_last: Instant::now(),
            stats_infer_ms: 0.0,
        }
    }

    fn run(&mut self) {
        info!("✅ 处理线程启动, 等待帧...");

        while !self.shared.stop.load(Ordering::Relaxed) {
            // 单轮中的panic (渲染器/深度查询等) 只跳过该轮
            match panic::catch_unwind(AssertUnwindSafe(|| self.cycle())) {
                Ok(Cycle::Processed) => {}
                Ok(Cycle::Idle) => thread::sleep(self.idle_sleep),
                Ok(Cycle::Skipped) => {
                    self.shared.cycles_skipped.fetch_add(1, Ordering::Relaxed);
                }
                Err(payload) => {
                    error!("❌ 处理周期异常, 跳过: {}", panic_message(payload.as_ref()));
                    self.shared.cycles_skipped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        info!("🛑 处理线程退出");
    }

    fn cycle(&mut self) -> Cycle {
        self.handle_control();
        self.prune_sessions();

        if self.shared.paused.load(Ordering::Relaxed) {
            return Cycle::Idle;
        }
        let Some(frame) = self.registry.take_latest_frame() else {
            return Cycle::Idle;
        };
        // 尺寸变化的重建消息先于帧入槽发送, 在处理该帧之前应用
        self.handle_control();
        if self.shared.paused.load(Ordering::Relaxed) {
            return Cycle::Idle;
        }

        let start = Instant::now();
        let (detections, depth) =
            match self.inference.infer(frame.seq, Arc::clone(&frame.image), self.timeout) {
                Ok(result) => result,
                Err(e @ SpatialError::Collaborator { .. }) => {
                    error!("❌ 跳过帧 #{}: {}", frame.seq, e);
                    return Cycle::Skipped;
                }
                Err(e) => {
                    warn!("⚠️  跳过帧 #{}: {}", frame.seq, e);
                    return Cycle::Skipped;
                }
            };
        let infer_ms = start.elapsed().as_secs_f64() * 1000.0;

        let processed = self.processor.process(&frame, detections, &depth);
        self.publish(processed);
        self.record_stats(infer_ms);
        Cycle::Processed
    }

    fn handle_control(&mut self) {
        while let Ok(msg) = self.control.try_recv() {
            match msg {
                ControlMessage::Reinitialize {
                    session_id,
                    width,
                    height,
                } => {
                    self.registry
                        .publish(SessionEvent::new(session_id, SessionStatus::Initializing));
                    self.processor.reinitialize(width, height);
                    self.registry
                        .publish(SessionEvent::new(session_id, SessionStatus::Ready));
                }
                ControlMessage::Pause => {
                    info!("⏸️  处理循环暂停");
                    self.shared.paused.store(true, Ordering::Relaxed);
                }
                ControlMessage::Resume => {
                    info!("▶️  处理循环恢复");
                    self.shared.paused.store(false, Ordering::Relaxed);
                }
            }
        }
    }

    fn prune_sessions(&mut self) {
        if self.last_prune.elapsed() < PRUNE_INTERVAL {
            return;
        }
        let now = Instant::now();
        self.last_prune = now;
        let pruned = self.registry.prune_stale(self.session_timeout, now);
        if !pruned.is_empty() {
            info!("🧹 清理 {} 个超时会话", pruned.len());
        }
    }

    fn publish(&mut self, processed: ProcessedFrame) {
        *self
            .shared
            .latest
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(processed.clone());
        self.shared.frames_processed.fetch_add(1, Ordering::Relaxed);
        if let Err(TrySendError::Full(dropped)) = self.tx_output.try_send(processed) {
            debug!("结果通道已满, 丢弃帧 #{}", dropped.payload.frame_seq);
        }
    }

    fn record_stats(&mut self, infer_ms: f64) {
        self.stats_count += 1;
        self.stats_infer_ms += infer_ms;

        let elapsed = self.stats_last.elapsed().as_secs_f64();
        if elapsed >= 1.0 {
            let fps = self.stats_count as f64 / elapsed;
            let avg_ms = self.stats_infer_ms / self.stats_count as f64;
            let tracks = self.processor.tracker().map_or(0, |t| t.track_count());
            info!(
                "📊 处理统计 | FPS: {:.1} | 推理: {:.1}ms | 跟踪: {} | 跳过: {}",
                fps,
                avg_ms,
                tracks,
                self.shared.cycles_skipped.load(Ordering::Relaxed)
            );
            self.stats_count = 0;
            self.stats_infer_ms = 0.0;
            self.stats_last = Instant::now();
        }
    }
}
