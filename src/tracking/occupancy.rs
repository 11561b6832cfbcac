// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 俯视占用栅格
//! Top-down occupancy grid over the camera's XZ plane

use ndarray::Array2;

/// 占用栅格 (行=深度方向, 列=左右方向)
///
/// 相机位于第一行中心, X轴居中, Z轴从0开始向前.
/// 单元值为该处目标置信度 × 255.
#[derive(Clone, Debug, PartialEq)]
pub struct OccupancyGrid {
    room_width: f64,
    room_depth: f64,
    grid_size: f64,
    cells: Array2<u8>,
}

impl OccupancyGrid {
    pub fn new(room_width: f64, room_depth: f64, grid_size: f64) -> Self {
        let cols = (room_width / grid_size).round().max(1.0) as usize;
        let rows = (room_depth / grid_size).round().max(1.0) as usize;
        Self {
            room_width,
            room_depth,
            grid_size,
            cells: Array2::zeros((rows, cols)),
        }
    }

    /// 栅格列数
    pub fn grid_width(&self) -> usize {
        self.cells.ncols()
    }

    /// 栅格行数
    pub fn grid_height(&self) -> usize {
        self.cells.nrows()
    }

    pub fn grid_size(&self) -> f64 {
        self.grid_size
    }

    pub fn room_width(&self) -> f64 {
        self.room_width
    }

    pub fn room_depth(&self) -> f64 {
        self.room_depth
    }

    /// 世界坐标 → 栅格坐标 (截断到边界)
    pub fn world_to_grid(&self, x: f64, z: f64) -> (usize, usize) {
        let gx = ((x + self.room_width / 2.0) / self.grid_size).floor();
        let gy = (z / self.grid_size).floor();
        let clamp = |v: f64, len: usize| -> usize {
            if v.is_nan() || v < 0.0 {
                0
            } else {
                (v as usize).min(len - 1)
            }
        };
        (clamp(gx, self.grid_width()), clamp(gy, self.grid_height()))
    }

    /// 栅格坐标 → 世界坐标 (单元左下角)
    pub fn grid_to_world(&self, gx: usize, gy: usize) -> (f64, f64) {
        (
            gx as f64 * self.grid_size - self.room_width / 2.0,
            gy as f64 * self.grid_size,
        )
    }

    pub fn clear(&mut self) {
        self.cells.fill(0);
    }

    /// 标记目标所在单元
    pub fn mark(&mut self, x: f64, z: f64, confidence: f32) {
        let (gx, gy) = self.world_to_grid(x, z);
        let level = (confidence.clamp(0.0, 1.0) * 255.0) as u8;
        self.cells[(gy, gx)] = level;
    }

    pub fn cell(&self, gx: usize, gy: usize) -> Option<u8> {
        self.cells.get((gy, gx)).copied()
    }

    pub fn cells(&self) -> &Array2<u8> {
        &self.cells
    }

    pub fn occupied_count(&self) -> usize {
        self.cells.iter().filter(|&&v| v > 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_dimensions_follow_room() {
        let grid = OccupancyGrid::new(5.0, 4.0, 0.1);
        assert_eq!(grid.grid_width(), 50);
        assert_eq!(grid.grid_height(), 40);
    }

    #[test]
    fn world_to_grid_centers_x_and_clamps() {
        let grid = OccupancyGrid::new(5.0, 5.0, 0.1);
        assert_eq!(grid.world_to_grid(0.0, 0.0), (25, 0));
        assert_eq!(grid.world_to_grid(-2.5, 1.05), (0, 10));
        assert_eq!(grid.world_to_grid(100.0, 100.0), (49, 49));
        assert_eq!(grid.world_to_grid(-100.0, -3.0), (0, 0));
    }

    #[test]
    fn grid_to_world_inverts_cell_origin() {
        let grid = OccupancyGrid::new(5.0, 5.0, 0.5);
        let (x, z) = grid.grid_to_world(3, 4);
        assert!((x - (-1.0)).abs() < 1e-12);
        assert!((z - 2.0).abs() < 1e-12);
        assert_eq!(grid.world_to_grid(x + 0.01, z + 0.01), (3, 4));
    }

    #[test]
    fn mark_stores_confidence_level() {
        let mut grid = OccupancyGrid::new(5.0, 5.0, 0.1);
        grid.mark(0.0, 2.0, 1.0);
        assert_eq!(grid.cell(25, 20), Some(255));
        assert_eq!(grid.occupied_count(), 1);
        grid.clear();
        assert_eq!(grid.occupied_count(), 0);
    }
}
