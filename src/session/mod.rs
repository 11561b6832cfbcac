// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 会话系统 (Session System)
///
/// 多客户端连接, 单活动流
/// - SessionRegistry: 会话集合 + 活动指针 + 最新帧槽 (同一把锁)
/// - ControlMessage:  注册表 → 处理循环 的重建/暂停/恢复信号
pub mod registry;

pub use registry::{
    ControlMessage, Frame, IngestStatus, SessionEvent, SessionId, SessionMeta, SessionRegistry,
    SessionStatus, StreamSession,
};
