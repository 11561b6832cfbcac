// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 流会话注册表
//! Stream session registry: connected camera clients, the active source and the latest-frame slot

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, SpatialError};

/// 生命周期事件缓冲上限, 满时丢弃新事件
const EVENT_CAPACITY: usize = 256;

// ========== 数据结构 ==========

/// 会话ID (按注册顺序单调递增)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// 客户端注册信息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionMeta {
    pub device_name: String,
    pub frame_width: u32,
    pub frame_height: u32,
}

impl Default for SessionMeta {
    fn default() -> Self {
        Self {
            device_name: "Unknown Device".to_string(),
            frame_width: 640,
            frame_height: 480,
        }
    }
}

impl SessionMeta {
    pub fn new<S: Into<String>>(device_name: S, frame_width: u32, frame_height: u32) -> Self {
        Self {
            device_name: device_name.into(),
            frame_width,
            frame_height,
        }
    }
}

/// 已连接的流会话
#[derive(Clone, Debug)]
pub struct StreamSession {
    pub id: SessionId,
    pub meta: SessionMeta,
    pub registered_at: Instant,
    pub last_active: Instant,
    pub frames_received: u64,
}

/// 帧提交结果
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    /// 已写入最新帧槽
    Received,
    /// 该会话不是活动会话, 帧被忽略
    NotActive,
    /// 无法解码或尺寸为0
    InvalidFrame,
    UnknownSession,
}

/// 会话生命周期状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Registered,
    Selected,
    Disconnected,
    TimedOut,
    /// 处理循环开始按新尺寸重建相机/跟踪器
    Initializing,
    /// 重建完成
    Ready,
}

/// 会话生命周期事件
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: SessionId,
    pub status: SessionStatus,
}

impl SessionEvent {
    pub fn new(session_id: SessionId, status: SessionStatus) -> Self {
        Self { session_id, status }
    }
}

/// 注册表 → 处理循环 的控制消息
#[derive(Clone, Debug, PartialEq)]
pub enum ControlMessage {
    /// 活动会话变化, 按新尺寸重建
    Reinitialize {
        session_id: SessionId,
        width: u32,
        height: u32,
    },
    /// 没有剩余会话
    Pause,
    Resume,
}

/// 最新帧 (不可变共享)
#[derive(Clone, Debug)]
pub struct Frame {
    pub session_id: SessionId,
    /// 注册表内全局递增的帧序号
    pub seq: u64,
    pub image: Arc<RgbImage>,
    pub received_at: Instant,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

// ========== 注册表 ==========

#[derive(Default)]
struct RegistryState {
    sessions: BTreeMap<SessionId, StreamSession>,
    active: Option<SessionId>,
    next_id: u64,
    next_seq: u64,
    /// 单槽: 新帧直接覆盖旧帧
    slot: Option<Frame>,
}

/// 会话注册表
///
/// 会话集合, 活动指针和最新帧槽由同一把锁保护, 注册/选择/断开对活动指针是原子的.
/// 活动会话断开时确定性地提升最早注册的剩余会话.
pub struct SessionRegistry {
    state: Mutex<RegistryState>,
    control_tx: Sender<ControlMessage>,
    control_rx: Receiver<ControlMessage>,
    events_tx: Sender<SessionEvent>,
    events_rx: Receiver<SessionEvent>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        let (control_tx, control_rx) = unbounded();
        let (events_tx, events_rx) = bounded(EVENT_CAPACITY);
        Self {
            state: Mutex::new(RegistryState::default()),
            control_tx,
            control_rx,
            events_tx,
            events_rx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 处理循环消费的控制通道
    pub fn control_receiver(&self) -> Receiver<ControlMessage> {
        self.control_rx.clone()
    }

    /// 生命周期事件订阅
    pub fn events(&self) -> Receiver<SessionEvent> {
        self.events_rx.clone()
    }

    /// 发布生命周期事件 (非阻塞, 缓冲满时丢弃)
    pub fn publish(&self, event: SessionEvent) {
        match self.events_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                debug!("事件缓冲已满, 丢弃 {:?}", event);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn control(&self, msg: ControlMessage) {
        // 接收端由注册表自身持有, 不会断开
        let _ = self.control_tx.send(msg);
    }

    fn activate(&self, state: &mut RegistryState, id: SessionId) {
        state.active = Some(id);
        state.slot = None;
        if let Some(session) = state.sessions.get(&id) {
            self.control(ControlMessage::Reinitialize {
                session_id: id,
                width: session.meta.frame_width,
                height: session.meta.frame_height,
            });
        }
    }

    /// 注册新会话; 若当前无活动会话则其成为活动会话并恢复处理
    pub fn register(&self, meta: SessionMeta) -> SessionId {
        let now = Instant::now();
        let mut state = self.lock();
        let id = SessionId(state.next_id);
        state.next_id += 1;

        info!(
            "📱 注册新流: {} - {} ({}x{})",
            id, meta.device_name, meta.frame_width, meta.frame_height
        );
        state.sessions.insert(
            id,
            StreamSession {
                id,
                meta,
                registered_at: now,
                last_active: now,
                frames_received: 0,
            },
        );
        self.publish(SessionEvent::new(id, SessionStatus::Registered));

        if state.active.is_none() {
            self.activate(&mut state, id);
            self.control(ControlMessage::Resume);
            info!("▶️  活动流: {}", id);
            self.publish(SessionEvent::new(id, SessionStatus::Selected));
        }
        id
    }

    /// 提交已解码的帧, 仅活动会话的帧会被保存
    pub fn ingest_frame(&self, id: SessionId, image: RgbImage) -> IngestStatus {
        if image.width() == 0 || image.height() == 0 {
            return IngestStatus::InvalidFrame;
        }

        let now = Instant::now();
        let mut state = self.lock();
        let active = state.active;
        let Some(session) = state.sessions.get_mut(&id) else {
            return IngestStatus::UnknownSession;
        };
        session.last_active = now;
        if active != Some(id) {
            return IngestStatus::NotActive;
        }

        session.frames_received += 1;
        let (width, height) = image.dimensions();
        let resized = session.meta.frame_width != width || session.meta.frame_height != height;
        if resized {
            session.meta.frame_width = width;
            session.meta.frame_height = height;
        }

        // 重建消息须先于帧入槽, 处理循环取到该帧时消息已在通道中
        if resized {
            debug!("{} 帧尺寸变化: {}x{}", id, width, height);
            self.control(ControlMessage::Reinitialize {
                session_id: id,
                width,
                height,
            });
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.slot = Some(Frame {
            session_id: id,
            seq,
            image: Arc::new(image),
            received_at: now,
        });
        IngestStatus::Received
    }

    /// 提交编码帧 (JPEG/PNG等)
    pub fn ingest_encoded(&self, id: SessionId, bytes: &[u8]) -> IngestStatus {
        // 先确认活动状态, 避免为被忽略的帧解码
        {
            let mut state = self.lock();
            let active = state.active;
            match state.sessions.get_mut(&id) {
                None => return IngestStatus::UnknownSession,
                Some(session) if active != Some(id) => {
                    session.last_active = Instant::now();
                    return IngestStatus::NotActive;
                }
                Some(_) => {}
            }
        }

        match image::load_from_memory(bytes) {
            Ok(img) => self.ingest_frame(id, img.to_rgb8()),
            Err(e) => {
                warn!("⚠️  {} 帧解码失败: {}", id, e);
                IngestStatus::InvalidFrame
            }
        }
    }

    /// 显式切换活动会话
    pub fn select(&self, id: SessionId) -> Result<SessionEvent> {
        let mut state = self.lock();
        if !state.sessions.contains_key(&id) {
            return Err(SpatialError::UnknownSession(id.to_string()));
        }
        if state.active != Some(id) {
            let was_paused = state.active.is_none();
            self.activate(&mut state, id);
            if was_paused {
                self.control(ControlMessage::Resume);
            }
            info!("🔀 切换活动流: {}", id);
        }
        let event = SessionEvent::new(id, SessionStatus::Selected);
        self.publish(event.clone());
        Ok(event)
    }

    /// 断开会话; 若为活动会话则提升最早注册的剩余会话, 无剩余时暂停处理
    pub fn disconnect(&self, id: SessionId) -> Result<SessionEvent> {
        let mut state = self.lock();
        self.remove(&mut state, id, SessionStatus::Disconnected)
    }

    fn remove(
        &self,
        state: &mut RegistryState,
        id: SessionId,
        status: SessionStatus,
    ) -> Result<SessionEvent> {
        if state.sessions.remove(&id).is_none() {
            return Err(SpatialError::UnknownSession(id.to_string()));
        }
        info!("🔌 流断开: {} ({:?})", id, status);
        let event = SessionEvent::new(id, status);
        self.publish(event.clone());

        if state.active == Some(id) {
            state.slot = None;
            match state.sessions.keys().next().copied() {
                Some(next) => {
                    self.activate(state, next);
                    info!("▶️  提升活动流: {}", next);
                    self.publish(SessionEvent::new(next, SessionStatus::Selected));
                }
                None => {
                    state.active = None;
                    self.control(ControlMessage::Pause);
                    info!("⏸️  无剩余流, 暂停处理");
                }
            }
        }
        Ok(event)
    }

    /// 断开超过 `timeout` 未活动的会话, 返回被移除的ID
    pub fn prune_stale(&self, timeout: Duration, now: Instant) -> Vec<SessionId> {
        let mut state = self.lock();
        let stale: Vec<SessionId> = state
            .sessions
            .values()
            .filter(|s| now.saturating_duration_since(s.last_active) > timeout)
            .map(|s| s.id)
            .collect();
        for id in &stale {
            warn!("⏱️  {} 超时未活动", id);
            let _ = self.remove(&mut state, *id, SessionStatus::TimedOut);
        }
        stale
    }

    /// 取出最新帧 (每帧最多被取出一次)
    pub fn take_latest_frame(&self) -> Option<Frame> {
        let mut state = self.lock();
        let frame = state.slot.take()?;
        if state.active != Some(frame.session_id) {
            return None;
        }
        Some(frame)
    }

    pub fn active(&self) -> Option<SessionId> {
        self.lock().active
    }

    pub fn active_session(&self) -> Option<StreamSession> {
        let state = self.lock();
        state.active.and_then(|id| state.sessions.get(&id).cloned())
    }

    /// 所有会话 (按注册顺序)
    pub fn sessions(&self) -> Vec<StreamSession> {
        self.lock().sessions.values().cloned().collect()
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn meta(name: &str) -> SessionMeta {
        SessionMeta::new(name, 64, 48)
    }

    fn frame(w: u32, h: u32) -> RgbImage {
        RgbImage::from_pixel(w, h, image::Rgb([10, 20, 30]))
    }

    fn drain(rx: &Receiver<ControlMessage>) -> Vec<ControlMessage> {
        rx.try_iter().collect()
    }

    #[test]
    fn first_registration_becomes_active() {
        let registry = SessionRegistry::new();
        let control = registry.control_receiver();
        let a = registry.register(meta("phone"));
        let b = registry.register(meta("tablet"));
        assert_eq!(registry.active(), Some(a));
        assert_ne!(a, b);
        assert_eq!(
            drain(&control),
            vec![
                ControlMessage::Reinitialize {
                    session_id: a,
                    width: 64,
                    height: 48
                },
                ControlMessage::Resume
            ]
        );
    }

    #[test]
    fn only_active_session_frames_are_kept() {
        let registry = SessionRegistry::new();
        let a = registry.register(meta("a"));
        let b = registry.register(meta("b"));
        assert_eq!(registry.ingest_frame(b, frame(64, 48)), IngestStatus::NotActive);
        assert!(registry.take_latest_frame().is_none());
        assert_eq!(registry.ingest_frame(a, frame(64, 48)), IngestStatus::Received);
        let f = registry.take_latest_frame().unwrap();
        assert_eq!(f.session_id, a);
        assert_eq!(
            registry.ingest_frame(SessionId(99), frame(64, 48)),
            IngestStatus::UnknownSession
        );
    }

    #[test]
    fn newest_frame_overwrites_and_is_taken_once() {
        let registry = SessionRegistry::new();
        let a = registry.register(meta("a"));
        registry.ingest_frame(a, frame(64, 48));
        registry.ingest_frame(a, frame(64, 48));
        let f = registry.take_latest_frame().unwrap();
        assert_eq!(f.seq, 1);
        assert!(registry.take_latest_frame().is_none());
    }

    #[test]
    fn disconnecting_active_promotes_earliest_remaining() {
        let registry = SessionRegistry::new();
        let a = registry.register(meta("a"));
        let b = registry.register(meta("b"));
        let c = registry.register(meta("c"));
        registry.select(c).unwrap();
        registry.disconnect(c).unwrap();
        assert_eq!(registry.active(), Some(a));

        registry.disconnect(a).unwrap();
        assert_eq!(registry.active(), Some(b));
        assert_eq!(registry.session_count(), 1);
    }

    #[test]
    fn three_sessions_disconnect_active_promotes_exactly_one() {
        let registry = SessionRegistry::new();
        let ids: Vec<_> = ["a", "b", "c"].iter().map(|n| registry.register(meta(n))).collect();
        registry.disconnect(ids[0]).unwrap();
        assert_eq!(registry.active(), Some(ids[1]));
        let sessions = registry.sessions();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions.iter().filter(|s| Some(s.id) == registry.active()).count(), 1);
    }

    #[test]
    fn last_disconnect_pauses_and_clears_slot() {
        let registry = SessionRegistry::new();
        let control = registry.control_receiver();
        let a = registry.register(meta("a"));
        registry.ingest_frame(a, frame(64, 48));
        drain(&control);
        registry.disconnect(a).unwrap();
        assert_eq!(registry.active(), None);
        assert!(registry.take_latest_frame().is_none());
        assert_eq!(drain(&control), vec![ControlMessage::Pause]);
        assert!(registry.disconnect(a).is_err());
    }

    #[test]
    fn select_unknown_session_fails() {
        let registry = SessionRegistry::new();
        registry.register(meta("a"));
        assert!(matches!(
            registry.select(SessionId(7)),
            Err(SpatialError::UnknownSession(_))
        ));
    }

    #[test]
    fn frame_size_change_requests_reinitialize() {
        let registry = SessionRegistry::new();
        let control = registry.control_receiver();
        let a = registry.register(meta("a"));
        drain(&control);
        registry.ingest_frame(a, frame(32, 16));
        assert_eq!(
            drain(&control),
            vec![ControlMessage::Reinitialize {
                session_id: a,
                width: 32,
                height: 16
            }]
        );
        assert_eq!(registry.active_session().unwrap().meta.frame_width, 32);
    }

    #[test]
    fn encoded_frames_are_decoded() {
        let registry = SessionRegistry::new();
        let a = registry.register(meta("a"));
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(frame(8, 6))
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        assert_eq!(registry.ingest_encoded(a, &bytes), IngestStatus::Received);
        assert_eq!(registry.take_latest_frame().unwrap().width(), 8);
        assert_eq!(
            registry.ingest_encoded(a, b"not an image"),
            IngestStatus::InvalidFrame
        );
    }

    #[test]
    fn stale_sessions_are_pruned() {
        let registry = SessionRegistry::new();
        let a = registry.register(meta("a"));
        let b = registry.register(meta("b"));
        let later = Instant::now() + Duration::from_secs(60);
        let pruned = registry.prune_stale(Duration::from_secs(30), later);
        assert_eq!(pruned, vec![a, b]);
        assert_eq!(registry.active(), None);
        let statuses: Vec<_> = registry.events().try_iter().map(|e| e.status).collect();
        assert!(statuses.contains(&SessionStatus::TimedOut));
    }

    #[test]
    fn event_serializes_with_snake_case_status() {
        let json =
            serde_json::to_string(&SessionEvent::new(SessionId(3), SessionStatus::Selected))
                .unwrap();
        assert_eq!(json, r#"{"session_id":3,"status":"selected"}"#);
    }
}
