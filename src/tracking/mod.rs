// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 跟踪系统 (Tracking System)
///
/// 提供三维空间目标跟踪
/// - SpatialMap:    同类贪心最近邻 + EMA平滑 + 超时淘汰
/// - OccupancyGrid: 由已提交快照重建的俯视栅格
pub mod occupancy;
pub mod spatial_map;

pub use occupancy::OccupancyGrid;
pub use spatial_map::{
    hsv_to_rgb, label_color, MapSnapshot, SpatialMap, TrackedObject, TrackerParams,
    UpdateSummary,
};
