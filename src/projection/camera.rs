// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 针孔相机模型
//! Pinhole camera model: pixel + depth → camera-space 3D point

use std::fs;
use std::path::Path;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::detection::Position3D;
use crate::error::{Result, SpatialError};

/// 默认最大可信深度 (米), 超出部分视为模型噪声
pub const MAX_DEPTH: f64 = 1000.0;

/// 相机内参
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub image_width: f64,
    pub image_height: f64,
    /// 标定文件中可选的深度缩放
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth_scale: Option<f64>,
}

impl CameraIntrinsics {
    /// 主点位于图像中心, fx = fy = focal_length
    pub fn centered(width: u32, height: u32, focal_length: f64) -> Self {
        Self {
            fx: focal_length,
            fy: focal_length,
            cx: width as f64 / 2.0,
            cy: height as f64 / 2.0,
            image_width: width as f64,
            image_height: height as f64,
            depth_scale: None,
        }
    }

    /// 逆针孔投影
    ///
    /// `X = (x - cx) * Z / fx`, `Y = (y - cy) * Z / fy`
    pub fn pixel_to_world(
        &self,
        x: f64,
        y: f64,
        depth: f64,
        normalized: bool,
        depth_scale: f64,
        max_depth: f64,
    ) -> std::result::Result<Position3D, ProjectionError> {
        if !x.is_finite() || !y.is_finite() {
            return Err(ProjectionError::InvalidPixel { x, y });
        }
        if !depth.is_finite() || depth < 0.0 {
            return Err(ProjectionError::InvalidDepth(depth));
        }

        let mut z = if normalized {
            depth.clamp(0.0, 1.0) * depth_scale
        } else {
            depth
        };
        if z.is_finite() && z > max_depth {
            debug!("深度 {:.2} 超出上限 {:.0}, 截断", z, max_depth);
            z = max_depth;
        }
        if !z.is_finite() || z <= 0.0 {
            return Err(ProjectionError::NonPositiveDepth(z));
        }

        let point = Position3D::new((x - self.cx) * z / self.fx, (y - self.cy) * z / self.fy, z);
        if !point.is_finite() {
            return Err(ProjectionError::NonFinite(point));
        }
        Ok(point)
    }

    /// 正向投影, Z <= 0 时无像素
    pub fn world_to_pixel(&self, point: &Position3D) -> Option<(f64, f64)> {
        if !point.is_finite() || point.z <= 0.0 {
            return None;
        }
        Some((
            self.fx * point.x / point.z + self.cx,
            self.fy * point.y / point.z + self.cy,
        ))
    }
}

/// 投影失败原因
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum ProjectionError {
    #[error("pixel ({x}, {y}) is not finite")]
    InvalidPixel { x: f64, y: f64 },
    #[error("depth sample {0} is not a finite non-negative number")]
    InvalidDepth(f64),
    #[error("metric depth {0} is not positive")]
    NonPositiveDepth(f64),
    #[error("projected point {0:?} is not finite")]
    NonFinite(Position3D),
}

/// 投影器: 持有可重新标定的内参
///
/// 读者每次调用获取一份一致的内参快照, 标定/缩放可在处理线程运行中进行.
pub struct PinholeCamera {
    intrinsics: RwLock<CameraIntrinsics>,
    max_depth: f64,
}

impl PinholeCamera {
    pub fn new(intrinsics: CameraIntrinsics) -> Self {
        Self {
            intrinsics: RwLock::new(intrinsics),
            max_depth: MAX_DEPTH,
        }
    }

    /// 以图像尺寸构建默认内参
    pub fn with_image_size(width: u32, height: u32, focal_length: f64) -> Self {
        Self::new(CameraIntrinsics::centered(width, height, focal_length))
    }

    pub fn with_max_depth(mut self, max_depth: f64) -> Self {
        if max_depth.is_finite() && max_depth > 0.0 {
            self.max_depth = max_depth;
        }
        self
    }

    /// 当前内参快照
    pub fn snapshot(&self) -> CameraIntrinsics {
        *self.intrinsics.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn max_depth(&self) -> f64 {
        self.max_depth
    }

    /// 标定文件提供的深度缩放 (若有)
    pub fn depth_scale(&self) -> Option<f64> {
        self.snapshot().depth_scale
    }

    /// 像素 + 深度 → 相机坐标
    pub fn pixel_to_world(
        &self,
        x: f64,
        y: f64,
        depth: f64,
        normalized: bool,
        depth_scale: f64,
    ) -> std::result::Result<Position3D, ProjectionError> {
        self.snapshot()
            .pixel_to_world(x, y, depth, normalized, depth_scale, self.max_depth)
    }

    pub fn world_to_pixel(&self, point: &Position3D) -> Option<(f64, f64)> {
        self.snapshot().world_to_pixel(point)
    }

    /// 图像尺寸变化: 更新尺寸并将主点重置到中心, 焦距保持
    pub fn resize(&self, width: u32, height: u32) {
        let mut guard = self.intrinsics.write().unwrap_or_else(|e| e.into_inner());
        guard.image_width = width as f64;
        guard.image_height = height as f64;
        guard.cx = width as f64 / 2.0;
        guard.cy = height as f64 / 2.0;
        info!("📐 相机尺寸更新: {}x{}", width, height);
    }

    /// 从JSON文件加载标定
    ///
    /// 文件级错误(不存在/非JSON)返回Err且不修改状态; 单个字段非法时记录警告并保留旧值.
    /// 返回被接受的字段数.
    pub fn load_calibration<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&text)?;
        let record = value
            .as_object()
            .ok_or_else(|| SpatialError::calibration("calibration root is not an object"))?;
        let accepted = self.apply_calibration(record);
        info!(
            "✅ 相机标定已从 {} 加载 ({} 个字段)",
            path.display(),
            accepted
        );
        Ok(accepted)
    }

    /// 逐字段应用标定记录, 一次性提交
    pub fn apply_calibration(&self, record: &Map<String, Value>) -> usize {
        let mut guard = self.intrinsics.write().unwrap_or_else(|e| e.into_inner());
        let mut next = *guard;
        let mut accepted = 0;

        for (keys, slot) in [
            (&["image_width", "imageWidth"][..], &mut next.image_width),
            (&["image_height", "imageHeight"][..], &mut next.image_height),
            (&["fx"][..], &mut next.fx),
            (&["fy"][..], &mut next.fy),
        ] {
            match number_field(record, keys) {
                Some(v) if v > 0.0 => {
                    *slot = v;
                    accepted += 1;
                }
                Some(v) => warn!("⚠️  标定字段 {}={} 必须为正, 保留旧值", keys[0], v),
                None => {}
            }
        }

        let (width, height) = (next.image_width, next.image_height);
        for (key, slot, bound) in [("cx", &mut next.cx, width), ("cy", &mut next.cy, height)] {
            match number_field(record, &[key][..]) {
                Some(v) if (0.0..=bound).contains(&v) => {
                    *slot = v;
                    accepted += 1;
                }
                Some(v) => warn!("⚠️  标定字段 {}={} 超出图像范围 [0, {}]", key, v, bound),
                None => {}
            }
        }

        if let Some(v) = lookup(record, &["depth_scale"]) {
            match v.as_f64().filter(|n| n.is_finite() && *n > 0.0) {
                Some(scale) => {
                    next.depth_scale = Some(scale);
                    accepted += 1;
                    info!("📏 使用标定文件中的深度缩放: {}", scale);
                }
                None => warn!("⚠️  标定字段 depth_scale 非法: {}", v),
            }
        }

        *guard = next;
        info!(
            "🎯 相机内参: fx={:.1}, fy={:.1}, cx={:.1}, cy={:.1}",
            next.fx, next.fy, next.cx, next.cy
        );
        accepted
    }

    /// 保存标定到JSON文件
    pub fn save_calibration<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.snapshot())?;
        fs::write(path, json)?;
        info!("💾 相机标定已保存到 {}", path.display());
        Ok(())
    }

    /// 单点深度标定: 已知真实距离 → 深度缩放
    pub fn calibrate_depth_scale(&self, normalized_depth: f64, known_distance: f64) -> Result<f64> {
        if !(normalized_depth.is_finite() && normalized_depth > 0.0) {
            return Err(SpatialError::calibration(format!(
                "normalized depth must be positive, got {}",
                normalized_depth
            )));
        }
        if !(known_distance.is_finite() && known_distance > 0.0) {
            return Err(SpatialError::calibration(format!(
                "known distance must be positive, got {}",
                known_distance
            )));
        }
        let scale = known_distance / normalized_depth;
        self.intrinsics
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .depth_scale = Some(scale);
        info!("📏 深度缩放已标定: {:.3}", scale);
        Ok(scale)
    }
}

fn lookup<'a>(record: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| record.get(*k))
}

/// 读取有限数值字段, 缺失或非数值时记录警告
fn number_field(record: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    let name = keys.first().copied().unwrap_or_default();
    match lookup(record, keys) {
        Some(v) => match v.as_f64().filter(|n| n.is_finite()) {
            Some(n) => Some(n),
            None => {
                warn!("⚠️  标定字段 {} 非数值: {}", name, v);
                None
            }
        },
        None => {
            warn!("⚠️  标定缺少字段 {}", name);
            None
        }
    }
}
