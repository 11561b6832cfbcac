// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 运行参数配置 - 通过JSON文件调整参数

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// 超过此值的时长参数视为非法 (秒)
const MAX_DURATION_SECS: f64 = 7.0 * 24.0 * 3600.0;

/// 占用栅格单边最多单元数
const MAX_GRID_CELLS: f64 = 4096.0;

/// 空间检测参数配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpatialConfig {
    // === 投影参数 ===
    pub depth_scale: f64,          // 归一化深度 → 米
    pub normalized_depth: bool,    // 深度模型输出是否为[0,1]
    pub max_depth: f64,            // 最大可信深度(米)
    pub default_focal_length: f64, // 未标定时的焦距(像素)

    // === 跟踪参数 ===
    pub association_distance: f64, // 关联距离阈值(米, XZ平面)
    pub smoothing_alpha: f64,      // EMA权重 (新观测)
    pub persistence_secs: f64,     // 目标无匹配保留时间
    pub room_width: f64,           // 占用栅格宽度(米)
    pub room_depth: f64,           // 占用栅格深度(米)
    pub grid_size: f64,            // 栅格单元(米)

    // === 调度参数 ===
    pub idle_sleep_ms: u64,           // 无帧时休眠
    pub collaborator_timeout_ms: u64, // 检测/深度调用超时
    pub session_timeout_secs: f64,    // 客户端无帧超时

    // === 可视化参数 ===
    pub show_labels: bool,
    pub show_depth: bool,
    pub depth_thumbnail_fraction: f32,
    pub jpeg_quality: u8,
}

impl Default for SpatialConfig {
    fn default() -> Self {
        Self {
            depth_scale: 5.0,
            normalized_depth: true,
            max_depth: 1000.0,
            default_focal_length: 1000.0,

            association_distance: 1.0,
            smoothing_alpha: 0.7,
            persistence_secs: 5.0,
            room_width: 5.0,
            room_depth: 5.0,
            grid_size: 0.1,

            idle_sleep_ms: 10,
            collaborator_timeout_ms: 2000,
            session_timeout_secs: 30.0,

            show_labels: true,
            show_depth: true,
            depth_thumbnail_fraction: 0.25,
            jpeg_quality: 80,
        }
    }
}

impl SpatialConfig {
    /// 从JSON文件加载配置
    ///
    /// 文件不存在时写出默认配置; 解析失败时使用默认值
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(json) => match serde_json::from_str::<SpatialConfig>(&json) {
                Ok(config) => {
                    info!("✅ 配置已从 {} 加载", path.display());
                    config.validated()
                }
                Err(e) => {
                    warn!("⚠️  配置文件解析失败: {}, 使用默认值", e);
                    Self::default()
                }
            },
            Err(_) => {
                info!("📝 配置文件不存在,创建默认配置...");
                let config = Self::default();
                config.save(path);
                config
            }
        }
    }

    /// 保存配置到JSON文件
    pub fn save<P: AsRef<Path>>(&self, path: P) {
        let path = path.as_ref();
        match serde_json::to_string_pretty(self) {
            Ok(json) => {
                if let Err(e) = fs::write(path, json) {
                    warn!("❌ 保存配置失败: {}", e);
                } else {
                    info!("💾 配置已保存到 {}", path.display());
                }
            }
            Err(e) => warn!("❌ 序列化配置失败: {}", e),
        }
    }

    /// 将越界参数恢复为默认值
    pub fn validated(mut self) -> Self {
        let defaults = Self::default();

        fn positive(value: f64) -> bool {
            value.is_finite() && value > 0.0
        }

        for (name, value, fallback) in [
            (
                "persistence_secs",
                &mut self.persistence_secs,
                defaults.persistence_secs,
            ),
            (
                "session_timeout_secs",
                &mut self.session_timeout_secs,
                defaults.session_timeout_secs,
            ),
        ] {
            if positive(*value) && *value > MAX_DURATION_SECS {
                warn!(
                    "⚠️  {}={} 超过上限 {}s, 使用默认值 {}",
                    name, value, MAX_DURATION_SECS, fallback
                );
                *value = fallback;
            }
        }

        if !(self.smoothing_alpha > 0.0 && self.smoothing_alpha <= 1.0) {
            warn!("⚠️  smoothing_alpha={} 超出(0,1], 使用默认值", self.smoothing_alpha);
            self.smoothing_alpha = defaults.smoothing_alpha;
        }
        for (name, value, fallback) in [
            ("depth_scale", &mut self.depth_scale, defaults.depth_scale),
            ("max_depth", &mut self.max_depth, defaults.max_depth),
            (
                "default_focal_length",
                &mut self.default_focal_length,
                defaults.default_focal_length,
            ),
            (
                "association_distance",
                &mut self.association_distance,
                defaults.association_distance,
            ),
            (
                "persistence_secs",
                &mut self.persistence_secs,
                defaults.persistence_secs,
            ),
            ("room_width", &mut self.room_width, defaults.room_width),
            ("room_depth", &mut self.room_depth, defaults.room_depth),
            ("grid_size", &mut self.grid_size, defaults.grid_size),
            (
                "session_timeout_secs",
                &mut self.session_timeout_secs,
                defaults.session_timeout_secs,
            ),
        ] {
            if !positive(*value) {
                warn!("⚠️  {}={} 非法, 使用默认值 {}", name, value, fallback);
                *value = fallback;
            }
        }
        if self.room_width / self.grid_size > MAX_GRID_CELLS
            || self.room_depth / self.grid_size > MAX_GRID_CELLS
        {
            warn!(
                "⚠️  栅格 {}m x {}m @ {}m 过大, 使用默认值",
                self.room_width, self.room_depth, self.grid_size
            );
            self.room_width = defaults.room_width;
            self.room_depth = defaults.room_depth;
            self.grid_size = defaults.grid_size;
        }
        if self.collaborator_timeout_ms == 0 {
            self.collaborator_timeout_ms = defaults.collaborator_timeout_ms;
        }
        if self.idle_sleep_ms == 0 {
            warn!("⚠️  idle_sleep_ms=0 会导致空转, 使用 1ms");
            self.idle_sleep_ms = 1;
        }
        if !(self.depth_thumbnail_fraction > 0.0 && self.depth_thumbnail_fraction <= 1.0) {
            self.depth_thumbnail_fraction = defaults.depth_thumbnail_fraction;
        }
        self.jpeg_quality = self.jpeg_quality.clamp(1, 100);
        self
    }

    pub fn persistence(&self) -> Duration {
        secs_or(self.persistence_secs, Self::default().persistence_secs)
    }

    /// 至少1ms
    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms.max(1))
    }

    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_millis(self.collaborator_timeout_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        secs_or(self.session_timeout_secs, Self::default().session_timeout_secs)
    }

    /// 打印当前配置
    pub fn print_summary(&self) {
        info!("🎛️  当前空间检测配置:");
        info!(
            "  深度缩放: {:.2} (归一化: {}) | 最大深度: {:.0}m",
            self.depth_scale, self.normalized_depth, self.max_depth
        );
        info!(
            "  关联距离: {:.2}m | EMA α: {:.2} | 保留时间: {:.1}s",
            self.association_distance, self.smoothing_alpha, self.persistence_secs
        );
        info!(
            "  栅格: {:.1}m x {:.1}m @ {:.2}m",
            self.room_width, self.room_depth, self.grid_size
        );
        info!(
            "  协作调用超时: {}ms | 空闲休眠: {}ms",
            self.collaborator_timeout_ms, self.idle_sleep_ms
        );
    }
}

/// 秒数 → Duration, 非法或溢出时使用默认秒数
fn secs_or(secs: f64, fallback: f64) -> Duration {
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|d| !d.is_zero())
        .unwrap_or_else(|| Duration::from_secs_f64(fallback))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = SpatialConfig::default();
        assert_eq!(config.smoothing_alpha, 0.7);
        assert_eq!(config.association_distance, 1.0);
        assert_eq!(config.depth_scale, 5.0);
        assert_eq!(config.max_depth, 1000.0);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: SpatialConfig =
            serde_json::from_str(r#"{ "persistence_secs": 2.5, "show_depth": false }"#).unwrap();
        assert_eq!(config.persistence_secs, 2.5);
        assert!(!config.show_depth);
        assert_eq!(config.smoothing_alpha, 0.7);
    }

    #[test]
    fn validated_restores_out_of_range_values() {
        let config = SpatialConfig {
            smoothing_alpha: 1.5,
            grid_size: -1.0,
            max_depth: f64::NAN,
            collaborator_timeout_ms: 0,
            idle_sleep_ms: 0,
            jpeg_quality: 0,
            ..SpatialConfig::default()
        }
        .validated();
        let defaults = SpatialConfig::default();
        assert_eq!(config.idle_sleep_ms, 1);
        assert_eq!(config.smoothing_alpha, defaults.smoothing_alpha);
        assert_eq!(config.grid_size, defaults.grid_size);
        assert_eq!(config.max_depth, defaults.max_depth);
        assert_eq!(config.collaborator_timeout_ms, defaults.collaborator_timeout_ms);
        assert_eq!(config.jpeg_quality, 1);
    }

    #[test]
    fn huge_durations_fall_back_to_defaults() {
        let config: SpatialConfig = serde_json::from_str(
            r#"{ "persistence_secs": 1e30, "session_timeout_secs": 1e300 }"#,
        )
        .unwrap();
        let validated = config.clone().validated();
        assert_eq!(validated.persistence_secs, 5.0);
        assert_eq!(validated.session_timeout_secs, 30.0);

        // 未校验的配置也不会在转换时panic
        assert_eq!(config.persistence(), Duration::from_secs(5));
        assert_eq!(config.session_timeout(), Duration::from_secs(30));
        let spinning = SpatialConfig {
            idle_sleep_ms: 0,
            ..SpatialConfig::default()
        };
        assert_eq!(spinning.idle_sleep(), Duration::from_millis(1));
    }

    #[test]
    fn oversized_grid_falls_back_to_defaults() {
        let config = SpatialConfig {
            room_width: 1e12,
            grid_size: 0.01,
            ..SpatialConfig::default()
        }
        .validated();
        assert_eq!(config.room_width, 5.0);
        assert_eq!(config.grid_size, 0.1);
    }

    #[test]
    fn load_creates_default_file_when_missing() {
        let path = std::env::temp_dir().join(format!(
            "spatial_config_{}_{}.json",
            std::process::id(),
            line!()
        ));
        let _ = fs::remove_file(&path);
        let config = SpatialConfig::load(&path);
        assert_eq!(config, SpatialConfig::default());
        assert!(path.exists());
        let reloaded = SpatialConfig::load(&path);
        assert_eq!(reloaded, config);
        let _ = fs::remove_file(&path);
    }
}
