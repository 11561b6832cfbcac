// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 无模型协作者: 用于演示与测试
//!
//! - BrightRegionDetector: 把高亮像素的外接框当作一个目标
//! - StaticDetector:       固定返回给定检测
//! - GradientDepth:        自上而下由远及近的线性深度
//! - UniformDepth:         常数深度
//! - test_pattern:         带移动方块的测试帧

use anyhow::{ensure, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;
use ndarray::Array2;

use super::collaborators::{DepthEstimator, ObjectDetector};
use crate::detection::{BBox, Detection, DepthMap};

/// 高亮区域检测
pub struct BrightRegionDetector {
    pub label: String,
    /// 三通道均超过该值视为前景
    pub threshold: u8,
}

impl BrightRegionDetector {
    pub fn new<S: Into<String>>(label: S) -> Self {
        Self {
            label: label.into(),
            threshold: 200,
        }
    }
}

impl ObjectDetector for BrightRegionDetector {
    fn detect(&self, frame: &RgbImage) -> Result<Vec<Detection>> {
        ensure!(frame.width() > 0 && frame.height() > 0, "empty frame");

        let mut bounds: Option<(u32, u32, u32, u32)> = None;
        let mut count = 0u64;
        for (x, y, p) in frame.enumerate_pixels() {
            if p.0.iter().all(|&c| c > self.threshold) {
                count += 1;
                bounds = Some(match bounds {
                    None => (x, y, x, y),
                    Some((x1, y1, x2, y2)) => (x1.min(x), y1.min(y), x2.max(x), y2.max(y)),
                });
            }
        }

        Ok(bounds
            .map(|(x1, y1, x2, y2)| {
                let area = ((x2 - x1 + 1) as u64 * (y2 - y1 + 1) as u64) as f32;
                let bbox = BBox::new(x1 as f32, y1 as f32, (x2 + 1) as f32, (y2 + 1) as f32);
                Detection::new(bbox, self.label.clone(), count as f32 / area)
            })
            .into_iter()
            .collect())
    }

    fn name(&self) -> &str {
        "bright-region"
    }
}

/// 固定检测结果
pub struct StaticDetector {
    pub detections: Vec<Detection>,
}

impl ObjectDetector for StaticDetector {
    fn detect(&self, _frame: &RgbImage) -> Result<Vec<Detection>> {
        Ok(self.detections.clone())
    }

    fn name(&self) -> &str {
        "static"
    }
}

/// 线性深度: 第一行为 `far`, 最后一行为 `near`
pub struct GradientDepth {
    pub near: f32,
    pub far: f32,
}

impl Default for GradientDepth {
    fn default() -> Self {
        Self { near: 0.2, far: 0.9 }
    }
}

impl DepthEstimator for GradientDepth {
    fn estimate(&self, frame: &RgbImage) -> Result<DepthMap> {
        let (w, h) = frame.dimensions();
        ensure!(w > 0 && h > 0, "empty frame");
        let last = (h.max(2) - 1) as f32;
        let data = Array2::from_shape_fn((h as usize, w as usize), |(row, _)| {
            self.far + (self.near - self.far) * row as f32 / last
        });
        Ok(DepthMap::from_normalized(data))
    }

    fn name(&self) -> &str {
        "gradient-depth"
    }
}

/// 常数深度
pub struct UniformDepth(pub f32);

impl DepthEstimator for UniformDepth {
    fn estimate(&self, frame: &RgbImage) -> Result<DepthMap> {
        let (w, h) = frame.dimensions();
        Ok(DepthMap::from_normalized(Array2::from_elem(
            (h as usize, w as usize),
            self.0,
        )))
    }

    fn name(&self) -> &str {
        "uniform-depth"
    }
}

/// 测试帧: 深灰背景上一个沿水平方向往返移动的白色方块
pub fn test_pattern(width: u32, height: u32, tick: u64) -> RgbImage {
    let mut img = RgbImage::from_pixel(width, height, Rgb([40, 40, 48]));
    let side = (width.min(height) / 5).max(1);
    let travel = width.saturating_sub(side).max(1) as u64;
    let phase = tick * 4 % (travel * 2);
    let x = if phase < travel { phase } else { travel * 2 - phase };
    let y = height.saturating_sub(side) / 2;
    draw_filled_rect_mut(
        &mut img,
        Rect::at(x as i32, y as i32).of_size(side, side),
        Rgb([250, 250, 250]),
    );
    img
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bright_region_is_detected() {
        let img = test_pattern(100, 50, 0);
        let dets = BrightRegionDetector::new("person").detect(&img).unwrap();
        assert_eq!(dets.len(), 1);
        let bbox = dets[0].bbox;
        assert_eq!(bbox.x1, 0.0);
        assert_eq!(bbox.width(), 10.0);
        assert_eq!(bbox.height(), 10.0);
        assert!((dets[0].confidence - 1.0).abs() < 1e-6);
    }

    #[test]
    fn dark_frame_has_no_detections() {
        let img = RgbImage::new(16, 16);
        assert!(BrightRegionDetector::new("x").detect(&img).unwrap().is_empty());
    }

    #[test]
    fn pattern_moves_with_tick() {
        let a = BrightRegionDetector::new("p").detect(&test_pattern(100, 50, 0)).unwrap();
        let b = BrightRegionDetector::new("p").detect(&test_pattern(100, 50, 5)).unwrap();
        assert_eq!(b[0].bbox.x1 - a[0].bbox.x1, 20.0);
    }

    #[test]
    fn gradient_depth_runs_far_to_near() {
        let depth = GradientDepth::default().estimate(&RgbImage::new(4, 11)).unwrap();
        assert!((depth.get(0, 0).unwrap() - 0.9).abs() < 1e-6);
        assert!((depth.get(3, 10).unwrap() - 0.2).abs() < 1e-6);
    }
}
