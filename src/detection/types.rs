// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 空间检测系统数据结构定义
/// Data structures for the spatial detection system
use ndarray::Array2;
use serde::{Deserialize, Serialize};

// ========== 数据结构 ==========

/// 检测框 (Detection bounding box, 左上/右下角点)
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// 中心点
    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    /// 坐标有限且 x2>=x1, y2>=y1
    pub fn is_valid(&self) -> bool {
        self.as_array().iter().all(|v| v.is_finite()) && self.x2 >= self.x1 && self.y2 >= self.y1
    }

    pub fn as_array(&self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }
}

/// 单个检测结果 (检测模型 → 处理循环)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BBox,
    pub class_name: String,
    pub confidence: f32,
}

impl Detection {
    pub fn new<S: Into<String>>(bbox: BBox, class_name: S, confidence: f32) -> Self {
        Self {
            bbox,
            class_name: class_name.into(),
            confidence,
        }
    }
}

/// 相机坐标系下的三维位置 (米)
///
/// X向右, Y向下, Z为前向深度. 无效投影统一用零向量表示.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Position3D {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position3D {
    pub const ZERO: Position3D = Position3D {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    /// 有限且 Z >= 0
    pub fn is_valid(&self) -> bool {
        self.is_finite() && self.z >= 0.0
    }

    /// XZ平面距离 (忽略高度)
    pub fn planar_distance(&self, other: &Position3D) -> f64 {
        ((self.x - other.x).powi(2) + (self.z - other.z).powi(2)).sqrt()
    }

    /// 到相机的欧氏距离
    pub fn norm(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// 指数滑动平均: alpha * measured + (1 - alpha) * self
    pub fn ema(&self, measured: &Position3D, alpha: f64) -> Position3D {
        Position3D {
            x: alpha * measured.x + (1.0 - alpha) * self.x,
            y: alpha * measured.y + (1.0 - alpha) * self.y,
            z: alpha * measured.z + (1.0 - alpha) * self.z,
        }
    }

    pub fn as_array(&self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }
}

/// 稠密深度图 (行=y, 列=x), 值已归一化到[0,1]
#[derive(Clone, Debug, PartialEq)]
pub struct DepthMap {
    data: Array2<f32>,
}

impl DepthMap {
    /// 由模型原始输出构建, 执行min-max归一化
    ///
    /// 非有限值视为0; 常数图归一化为全0
    pub fn from_raw(raw: Array2<f32>) -> Self {
        let (min, max) = raw
            .iter()
            .filter(|v| v.is_finite())
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        let range = max - min;
        let data = if range.is_finite() && range > 0.0 {
            raw.mapv(|v| if v.is_finite() { (v - min) / range } else { 0.0 })
        } else {
            Array2::zeros(raw.raw_dim())
        };
        Self { data }
    }

    /// 直接使用已归一化数据
    pub fn from_normalized(data: Array2<f32>) -> Self {
        Self { data }
    }

    pub fn width(&self) -> usize {
        self.data.ncols()
    }

    pub fn height(&self) -> usize {
        self.data.nrows()
    }

    pub fn data(&self) -> &Array2<f32> {
        &self.data
    }

    /// 点查询, 越界返回None
    pub fn get(&self, x: i64, y: i64) -> Option<f32> {
        if x < 0 || y < 0 {
            return None;
        }
        self.data.get((y as usize, x as usize)).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn bbox_center_and_validity() {
        let bbox = BBox::new(100.0, 100.0, 200.0, 200.0);
        assert_eq!(bbox.center(), (150.0, 150.0));
        assert!(bbox.is_valid());
        assert!(!BBox::new(10.0, 0.0, 5.0, 4.0).is_valid());
        assert!(!BBox::new(f32::NAN, 0.0, 5.0, 4.0).is_valid());
    }

    #[test]
    fn ema_weights_new_measurement() {
        let old = Position3D::new(0.0, 0.0, 2.0);
        let measured = Position3D::new(1.0, 1.0, 3.0);
        let smoothed = old.ema(&measured, 0.7);
        assert!((smoothed.x - 0.7).abs() < 1e-12);
        assert!((smoothed.y - 0.7).abs() < 1e-12);
        assert!((smoothed.z - 2.7).abs() < 1e-12);
    }

    #[test]
    fn planar_distance_ignores_height() {
        let a = Position3D::new(0.0, -5.0, 1.0);
        let b = Position3D::new(0.3, 5.0, 1.4);
        assert!((a.planar_distance(&b) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn depth_map_normalizes_and_bounds_checks() {
        let map = DepthMap::from_raw(array![[2.0, 4.0], [6.0, f32::NAN]]);
        assert_eq!(map.width(), 2);
        assert_eq!(map.height(), 2);
        assert_eq!(map.get(0, 0), Some(0.0));
        assert_eq!(map.get(1, 0), Some(0.5));
        assert_eq!(map.get(0, 1), Some(1.0));
        assert_eq!(map.get(1, 1), Some(0.0));
        assert_eq!(map.get(2, 0), None);
        assert_eq!(map.get(-1, 0), None);
    }

    #[test]
    fn constant_depth_map_is_zero() {
        let map = DepthMap::from_raw(Array2::from_elem((3, 3), 7.0));
        assert!(map.data().iter().all(|&v| v == 0.0));
    }
}
