// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 对外检测结果
//!
//! 每条记录的 `position_3d` 恒为长度3的数组; 非法数值在离开进程前替换为零向量.

use serde::{Deserialize, Serialize};

use super::collaborators::ProjectedDetection;
use crate::detection::Position3D;
use crate::session::SessionId;

/// 单条检测记录
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub label: String,
    pub confidence: f32,
    /// [x1, y1, x2, y2]
    pub bbox: [f32; 4],
    /// [X, Y, Z] 米
    pub position_3d: [f64; 3],
}

impl DetectionRecord {
    /// 构建并校验数值
    ///
    /// 置信度截断到[0,1], 非有限值按0处理; bbox非有限分量置0;
    /// 位置非有限, Z<0 或超过 `max_depth` 时整体替换为零向量.
    pub fn sanitized(projected: &ProjectedDetection, max_depth: f64) -> Self {
        let det = &projected.detection;
        let confidence = if det.confidence.is_finite() {
            det.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let bbox = det
            .bbox
            .as_array()
            .map(|v| if v.is_finite() { v } else { 0.0 });
        let position = sanitize_position(&projected.position, max_depth);

        Self {
            label: det.class_name.clone(),
            confidence,
            bbox,
            position_3d: position.as_array(),
        }
    }
}

/// 位置数值校验, 不合法时返回零向量
pub fn sanitize_position(position: &Position3D, max_depth: f64) -> Position3D {
    let in_range = |v: f64| v.abs() <= max_depth;
    if position.is_valid() && in_range(position.x) && in_range(position.y) && in_range(position.z)
    {
        *position
    } else {
        Position3D::ZERO
    }
}

/// 每帧检测结果
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionPayload {
    pub detections: Vec<DetectionRecord>,
    /// Unix秒
    pub timestamp: f64,
    pub session_id: SessionId,
    pub frame_seq: u64,
}

impl DetectionPayload {
    pub fn new(
        projected: &[ProjectedDetection],
        max_depth: f64,
        session_id: SessionId,
        frame_seq: u64,
    ) -> Self {
        Self {
            detections: projected
                .iter()
                .map(|p| DetectionRecord::sanitized(p, max_depth))
                .collect(),
            timestamp: unix_timestamp(),
            session_id,
            frame_seq,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// 当前Unix时间 (秒, 毫秒精度)
pub fn unix_timestamp() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
