// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 空间地图: 三维目标关联与平滑
//! Spatial map: associates per-frame 3D detections with tracked objects

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

use super::occupancy::OccupancyGrid;
use crate::config::SpatialConfig;
use crate::detection::{Detection, Position3D};

// ========== 公共数据结构 ==========

/// 轨迹最多保留的历史位置
pub const MAX_TRAJECTORY: usize = 10;

/// 跟踪对象
#[derive(Clone, Debug)]
pub struct TrackedObject {
    /// 唯一跟踪ID (单调递增, 永不复用)
    pub id: u64,

    pub class_name: String,

    /// EMA平滑后的位置
    pub position: Position3D,

    /// 最近一次匹配的检测置信度 (不平滑)
    pub confidence: f32,

    pub last_seen: Instant,

    /// 显示颜色
    pub color: (u8, u8, u8),

    /// 历史位置 (平滑后)
    pub trajectory: Vec<Position3D>,

    /// 成功关联次数
    pub hits: u32,
}

impl TrackedObject {
    fn spawn(id: u64, detection: &Detection, position: Position3D, now: Instant) -> Self {
        Self {
            id,
            class_name: detection.class_name.clone(),
            position,
            confidence: detection.confidence,
            last_seen: now,
            color: random_color(),
            trajectory: vec![position],
            hits: 1,
        }
    }

    fn observe(&mut self, detection: &Detection, measured: &Position3D, alpha: f64, now: Instant) {
        self.position = self.position.ema(measured, alpha);
        self.confidence = detection.confidence;
        self.last_seen = now;
        self.hits += 1;

        self.trajectory.push(self.position);
        if self.trajectory.len() > MAX_TRAJECTORY {
            self.trajectory.remove(0);
        }
    }

    /// 到相机的距离 (米)
    pub fn distance(&self) -> f64 {
        self.position.norm()
    }
}

/// 关联/平滑参数
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrackerParams {
    /// XZ平面最大关联距离 (米)
    pub association_distance: f64,
    /// EMA权重, (0,1]
    pub alpha: f64,
    /// 无匹配保留时长
    pub persistence: Duration,
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self {
            association_distance: 1.0,
            alpha: 0.7,
            persistence: Duration::from_secs(5),
        }
    }
}

/// 一次更新提交后的只读快照
#[derive(Clone, Debug)]
pub struct MapSnapshot {
    /// 按ID升序
    pub objects: Vec<TrackedObject>,
    pub grid: OccupancyGrid,
    /// 已提交的更新次数
    pub generation: u64,
}

impl MapSnapshot {
    pub fn get(&self, id: u64) -> Option<&TrackedObject> {
        self.objects.iter().find(|o| o.id == id)
    }
}

/// 单次更新统计
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    pub evicted: usize,
    pub matched: usize,
    pub spawned: usize,
    pub skipped: usize,
}

// ========== 空间地图 ==========

/// 空间地图跟踪器
///
/// 每帧流程: 淘汰过期目标 → 同类贪心最近邻关联 → EMA更新 → 未匹配检测新建 → 重建栅格.
/// 关联按目标ID升序单遍贪心, 不做全局最优分配.
pub struct SpatialMap {
    objects: BTreeMap<u64, TrackedObject>,
    next_id: u64,
    params: TrackerParams,
    grid: OccupancyGrid,
    snapshot: Arc<MapSnapshot>,
}

impl SpatialMap {
    pub fn new(params: TrackerParams, grid: OccupancyGrid) -> Self {
        let snapshot = Arc::new(MapSnapshot {
            objects: Vec::new(),
            grid: grid.clone(),
            generation: 0,
        });
        Self {
            objects: BTreeMap::new(),
            next_id: 0,
            params,
            grid,
            snapshot,
        }
    }

    pub fn from_config(config: &SpatialConfig) -> Self {
        let config = config.clone().validated();
        Self::new(
            TrackerParams {
                association_distance: config.association_distance,
                alpha: config.smoothing_alpha,
                persistence: config.persistence(),
            },
            OccupancyGrid::new(config.room_width, config.room_depth, config.grid_size),
        )
    }

    pub fn params(&self) -> &TrackerParams {
        &self.params
    }

    /// 以当前时间更新
    pub fn update(&mut self, detections: &[Detection], positions: &[Position3D]) -> UpdateSummary {
        self.update_at(detections, positions, Instant::now())
    }

    /// 以指定时间更新
    pub fn update_at(
        &mut self,
        detections: &[Detection],
        positions: &[Position3D],
        now: Instant,
    ) -> UpdateSummary {
        let mut summary = UpdateSummary::default();

        // 1. 淘汰过期目标
        let persistence = self.params.persistence;
        let before = self.objects.len();
        self.objects
            .retain(|_, obj| now.saturating_duration_since(obj.last_seen) <= persistence);
        summary.evicted = before - self.objects.len();

        // 输入校验: 长度不一致或非有限坐标的条目单独跳过
        if detections.len() != positions.len() {
            warn!(
                "⚠️  检测数({})与位置数({})不一致, 多余条目跳过",
                detections.len(),
                positions.len()
            );
            summary.skipped += detections.len().abs_diff(positions.len());
        }
        let candidates: Vec<(usize, &Detection, &Position3D)> = detections
            .iter()
            .zip(positions.iter())
            .enumerate()
            .filter_map(|(i, (det, pos))| {
                if !pos.is_finite() || !det.bbox.is_valid() || !det.confidence.is_finite() {
                    warn!("⚠️  跳过非法检测 #{}: {:?} @ {:?}", i, det.bbox, pos);
                    summary.skipped += 1;
                    None
                } else {
                    Some((i, det, pos))
                }
            })
            .collect();

        // 2-3. 关联 + EMA
        let mut assigned: HashSet<usize> = HashSet::new();
        for obj in self.objects.values_mut() {
            let mut best: Option<(usize, f64)> = None;
            for &(i, det, pos) in &candidates {
                if assigned.contains(&i) || det.class_name != obj.class_name || pos.z <= 0.0 {
                    continue;
                }
                let distance = obj.position.planar_distance(pos);
                let better = best.map_or(true, |(_, d)| distance < d);
                if better && distance < self.params.association_distance {
                    best = Some((i, distance));
                }
            }

            if let Some((i, distance)) = best {
                let det = &detections[i];
                obj.observe(det, &positions[i], self.params.alpha, now);
                assigned.insert(i);
                summary.matched += 1;
                debug!(
                    "🔗 目标#{} ({}) 关联检测#{} 距离={:.2}m",
                    obj.id, obj.class_name, i, distance
                );
            }
        }

        // 4. 新建目标
        for &(i, det, pos) in &candidates {
            if assigned.contains(&i) || pos.z <= 0.0 {
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            self.objects.insert(id, TrackedObject::spawn(id, det, *pos, now));
            summary.spawned += 1;
            debug!("🆕 新目标#{} ({}) @ {:?}", id, det.class_name, pos);
        }

        // 5. 重建栅格并提交快照
        self.commit();
        summary
    }

    fn commit(&mut self) {
        self.grid.clear();
        for obj in self.objects.values() {
            self.grid
                .mark(obj.position.x, obj.position.z, obj.confidence);
        }
        self.snapshot = Arc::new(MapSnapshot {
            objects: self.objects.values().cloned().collect(),
            grid: self.grid.clone(),
            generation: self.snapshot.generation + 1,
        });
    }

    /// 最近一次提交的快照
    pub fn snapshot(&self) -> Arc<MapSnapshot> {
        Arc::clone(&self.snapshot)
    }

    pub fn objects(&self) -> impl Iterator<Item = &TrackedObject> {
        self.objects.values()
    }

    pub fn get(&self, id: u64) -> Option<&TrackedObject> {
        self.objects.get(&id)
    }

    pub fn grid(&self) -> &OccupancyGrid {
        &self.grid
    }

    /// 当前跟踪数量
    pub fn track_count(&self) -> usize {
        self.objects.len()
    }

    /// 清除所有跟踪 (ID计数不回退)
    pub fn reset(&mut self) {
        self.objects.clear();
        self.commit();
    }

    /// 获取跟踪统计信息
    pub fn get_stats(&self) -> String {
        format!("跟踪: {} 个目标 | 总ID: {}", self.objects.len(), self.next_id)
    }
}

// ========== 工具函数 ==========

/// 随机色相生成显示颜色
pub fn random_color() -> (u8, u8, u8) {
    let hue = rand::thread_rng().gen_range(0.0..360.0);
    hsv_to_rgb(hue, 0.8, 0.9)
}

/// 根据字符串生成稳定颜色 (同类同色)
pub fn label_color(label: &str) -> (u8, u8, u8) {
    let hash: u32 = label.chars().map(|c| c as u32).sum();
    let hue = (hash as f32 * 137.508) % 360.0; // 黄金角度采样
    hsv_to_rgb(hue, 0.8, 0.9)
}

/// HSV转RGB
pub fn hsv_to_rgb(h: f32, s: f32, v: f32) -> (u8, u8, u8) {
    let c = v * s;
    let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
    let m = v - c;

    let (r, g, b) = if h < 60.0 {
        (c, x, 0.0)
    } else if h < 120.0 {
        (x, c, 0.0)
    } else if h < 180.0 {
        (0.0, c, x)
    } else if h < 240.0 {
        (0.0, x, c)
    } else if h < 300.0 {
        (x, 0.0, c)
    } else {
        (c, 0.0, x)
    };

    (
        ((r + m) * 255.0) as u8,
        ((g + m) * 255.0) as u8,
        ((b + m) * 255.0) as u8,
    )
}
