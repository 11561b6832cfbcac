// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 标注帧渲染
//!
//! 检测框按类别着色, 可选标签文字 (需提供字体), 右上角深度缩略图, 左下角俯视地图,
//! 最终编码为JPEG.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use ab_glyph::{FontVec, PxScale};
use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use imageproc::drawing::{
    draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_rect_mut, draw_line_segment_mut,
    draw_text_mut,
};
use imageproc::rect::Rect;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::SpatialConfig;
use crate::detection::{BBox, DepthMap};
use crate::pipeline::{FrameRenderer, ProjectedDetection};
use crate::tracking::{hsv_to_rgb, label_color, MapSnapshot};

const BOX_THICKNESS: i32 = 2;
const LABEL_SCALE: f32 = 16.0;
/// 俯视图每个栅格单元的像素数
const MAP_CELL_PX: u32 = 2;

/// 运行时可切换的显示选项
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayOptions {
    pub show_labels: bool,
    pub show_depth: bool,
    pub map_mode: bool,
}

/// 显示选项的部分更新, 缺失字段保持不变
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayUpdate {
    pub show_labels: Option<bool>,
    pub show_depth: Option<bool>,
    pub map_mode: Option<bool>,
}

/// 标注帧渲染器
pub struct OverlayRenderer {
    font: Option<FontVec>,
    show_labels: AtomicBool,
    show_depth: AtomicBool,
    show_map: AtomicBool,
    depth_fraction: f32,
    jpeg_quality: u8,
}

impl OverlayRenderer {
    pub fn new(config: &SpatialConfig) -> Self {
        Self {
            font: None,
            show_labels: AtomicBool::new(config.show_labels),
            show_depth: AtomicBool::new(config.show_depth),
            show_map: AtomicBool::new(true),
            depth_fraction: config.depth_thumbnail_fraction,
            jpeg_quality: config.jpeg_quality,
        }
    }

    /// 加载TTF/OTF字体用于标签文字
    pub fn with_font_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).with_context(|| format!("读取字体失败: {}", path.display()))?;
        let font = FontVec::try_from_vec(bytes)
            .with_context(|| format!("字体解析失败: {}", path.display()))?;
        info!("✅ 字体加载成功: {}", path.display());
        self.font = Some(font);
        Ok(self)
    }

    pub fn with_map(self, show_map: bool) -> Self {
        self.show_map.store(show_map, Ordering::Relaxed);
        self
    }

    pub fn options(&self) -> DisplayOptions {
        DisplayOptions {
            show_labels: self.show_labels.load(Ordering::Relaxed),
            show_depth: self.show_depth.load(Ordering::Relaxed),
            map_mode: self.show_map.load(Ordering::Relaxed),
        }
    }

    /// 处理循环运行中也可调用, 下一帧生效
    pub fn update_options(&self, update: DisplayUpdate) -> DisplayOptions {
        if let Some(v) = update.show_labels {
            self.show_labels.store(v, Ordering::Relaxed);
        }
        if let Some(v) = update.show_depth {
            self.show_depth.store(v, Ordering::Relaxed);
        }
        if let Some(v) = update.map_mode {
            self.show_map.store(v, Ordering::Relaxed);
        }
        let options = self.options();
        info!("🎨 显示选项更新: {:?}", options);
        options
    }

    /// 在帧副本上绘制全部叠加层
    pub fn annotate(
        &self,
        frame: &RgbImage,
        detections: &[ProjectedDetection],
        depth: &DepthMap,
        snapshot: &MapSnapshot,
    ) -> RgbImage {
        let options = self.options();
        let mut canvas = frame.clone();

        for projected in detections {
            self.draw_detection(&mut canvas, projected, options.show_labels);
        }

        if options.show_depth {
            self.draw_depth_inset(&mut canvas, depth);
        }

        if options.map_mode {
            let map = self.top_down(snapshot);
            if map.width() < canvas.width() && map.height() < canvas.height() {
                let y = (canvas.height() - map.height()) as i64;
                imageops::overlay(&mut canvas, &map, 0, y);
            }
        }

        canvas
    }

    fn draw_detection(&self, canvas: &mut RgbImage, projected: &ProjectedDetection, labels: bool) {
        let det = &projected.detection;
        let Some((x, y, w, h)) = clip_to_canvas(&det.bbox, canvas.width(), canvas.height()) else {
            return;
        };
        let (r, g, b) = label_color(&det.class_name);
        let color = Rgb([r, g, b]);

        for offset in 0..BOX_THICKNESS {
            let grow = (offset * 2) as u32;
            let rect = Rect::at(x - offset, y - offset)
                .of_size(w.saturating_add(grow), h.saturating_add(grow));
            draw_hollow_rect_mut(canvas, rect, color);
        }

        if !labels {
            return;
        }
        let Some(font) = &self.font else {
            return;
        };
        let p = &projected.position;
        let label = if p.z > 0.0 {
            format!(
                "{} {:.2} ({:.1},{:.1},{:.1})m",
                det.class_name, det.confidence, p.x, p.y, p.z
            )
        } else {
            format!("{} {:.2}", det.class_name, det.confidence)
        };
        let label_y = (y - LABEL_SCALE as i32 - 2).max(0);
        let label_w = (label.chars().count() as f32 * LABEL_SCALE * 0.55) as u32 + 4;
        draw_filled_rect_mut(
            canvas,
            Rect::at(x, label_y).of_size(label_w.max(1), LABEL_SCALE as u32 + 2),
            color,
        );
        draw_text_mut(
            canvas,
            Rgb([255, 255, 255]),
            x + 2,
            label_y + 1,
            PxScale::from(LABEL_SCALE),
            font,
            &label,
        );
    }

    fn draw_depth_inset(&self, canvas: &mut RgbImage, depth: &DepthMap) {
        if depth.width() == 0 || depth.height() == 0 {
            return;
        }
        let colored = colorize_depth(depth);
        let inset_w = ((canvas.width() as f32 * self.depth_fraction) as u32).max(1);
        let inset_h =
            ((inset_w as f32 * depth.height() as f32 / depth.width() as f32) as u32).max(1);
        if inset_w >= canvas.width() || inset_h >= canvas.height() {
            return;
        }
        let thumb = imageops::resize(&colored, inset_w, inset_h, FilterType::Triangle);
        let x = (canvas.width() - inset_w) as i64;
        imageops::overlay(canvas, &thumb, x, 0);
    }

    /// 俯视图; 有字体且开启标签时标注类别, 置信度和距离
    pub fn top_down(&self, snapshot: &MapSnapshot) -> RgbImage {
        let mut map = render_top_down(snapshot, MAP_CELL_PX);
        let (Some(font), true) = (&self.font, self.options().show_labels) else {
            return map;
        };
        let scale = PxScale::from(LABEL_SCALE * 0.75);
        for obj in &snapshot.objects {
            let (gx, gy) = snapshot.grid.world_to_grid(obj.position.x, obj.position.z);
            let text = format!(
                "{} ({:.2}) {:.1}m",
                obj.class_name,
                obj.confidence,
                obj.distance()
            );
            let (r, g, b) = obj.color;
            draw_text_mut(
                &mut map,
                Rgb([r, g, b]),
                (gx as u32 * MAP_CELL_PX) as i32 + 6,
                (gy as u32 * MAP_CELL_PX) as i32 - 4,
                scale,
                font,
                &text,
            );
        }
        map
    }

    /// 编码为JPEG
    pub fn encode_jpeg(&self, image: &RgbImage) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        JpegEncoder::new_with_quality(&mut bytes, self.jpeg_quality)
            .encode_image(image)
            .context("JPEG编码失败")?;
        Ok(bytes)
    }
}

impl FrameRenderer for OverlayRenderer {
    fn render(
        &self,
        frame: &RgbImage,
        detections: &[ProjectedDetection],
        depth: &DepthMap,
        snapshot: &MapSnapshot,
    ) -> Result<Vec<u8>> {
        let annotated = self.annotate(frame, detections, depth, snapshot);
        self.encode_jpeg(&annotated)
    }
}

/// 检测框裁剪到画布内, 返回 (x, y, w, h); 裁剪后不足1像素时为None
fn clip_to_canvas(bbox: &BBox, width: u32, height: u32) -> Option<(i32, i32, u32, u32)> {
    if !bbox.is_valid() {
        return None;
    }
    let (max_x, max_y) = (width as f32, height as f32);
    let x1 = bbox.x1.round().clamp(0.0, max_x);
    let y1 = bbox.y1.round().clamp(0.0, max_y);
    let x2 = bbox.x2.round().clamp(0.0, max_x);
    let y2 = bbox.y2.round().clamp(0.0, max_y);
    if x2 - x1 < 1.0 || y2 - y1 < 1.0 {
        return None;
    }
    Some((x1 as i32, y1 as i32, (x2 - x1) as u32, (y2 - y1) as u32))
}

/// 深度伪彩色: 近处红, 远处蓝
pub fn colorize_depth(depth: &DepthMap) -> RgbImage {
    let data = depth.data();
    RgbImage::from_fn(depth.width() as u32, depth.height() as u32, |x, y| {
        let d = data[(y as usize, x as usize)].clamp(0.0, 1.0);
        let (r, g, b) = hsv_to_rgb(240.0 * d, 0.9, 0.9);
        Rgb([r, g, b])
    })
}

/// 俯视图: 相机位于顶边中心, 向下为前方
///
/// 占用单元按置信度着灰, 每米一条网格线, 每个跟踪目标画成其显示颜色的圆点.
pub fn render_top_down(snapshot: &MapSnapshot, cell_px: u32) -> RgbImage {
    let grid = &snapshot.grid;
    let cell_px = cell_px.max(1);
    let width = grid.grid_width() as u32 * cell_px;
    let height = grid.grid_height() as u32 * cell_px;
    let mut img = RgbImage::from_pixel(width, height, Rgb([20, 20, 24]));

    for ((gy, gx), &level) in grid.cells().indexed_iter() {
        if level == 0 {
            continue;
        }
        let shade = 60 + (level as u32 * 195 / 255) as u8;
        draw_filled_rect_mut(
            &mut img,
            Rect::at((gx as u32 * cell_px) as i32, (gy as u32 * cell_px) as i32)
                .of_size(cell_px, cell_px),
            Rgb([shade, shade, shade]),
        );
    }

    // 每米一条网格线
    let line = Rgb([45, 45, 55]);
    let step = ((1.0 / grid.grid_size()).round() as u32).max(1) * cell_px;
    for x in (0..width).step_by(step as usize) {
        draw_line_segment_mut(&mut img, (x as f32, 0.0), (x as f32, height as f32), line);
    }
    for y in (0..height).step_by(step as usize) {
        draw_line_segment_mut(&mut img, (0.0, y as f32), (width as f32, y as f32), line);
    }

    // 视场边界
    let apex = (width as f32 / 2.0, 0.0);
    let edge = Rgb([70, 70, 90]);
    draw_line_segment_mut(&mut img, apex, (0.0, height as f32), edge);
    draw_line_segment_mut(&mut img, apex, (width as f32, height as f32), edge);

    let radius = (cell_px as i32 * 2).max(2);
    for obj in &snapshot.objects {
        let (gx, gy) = grid.world_to_grid(obj.position.x, obj.position.z);
        let center = (
            (gx as u32 * cell_px + cell_px / 2) as i32,
            (gy as u32 * cell_px + cell_px / 2) as i32,
        );
        let (r, g, b) = obj.color;
        draw_filled_circle_mut(&mut img, center, radius, Rgb([r, g, b]));
    }

    draw_filled_circle_mut(&mut img, (width as i32 / 2, 0), radius, Rgb([255, 255, 255]));
    img
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{BBox, Detection, Position3D};
    use crate::tracking::{OccupancyGrid, SpatialMap, TrackerParams};
    use ndarray::Array2;

    fn snapshot_with_person() -> std::sync::Arc<MapSnapshot> {
        let mut map = SpatialMap::new(TrackerParams::default(), OccupancyGrid::new(5.0, 5.0, 0.1));
        map.update(
            &[Detection::new(BBox::new(0.0, 0.0, 1.0, 1.0), "person", 1.0)],
            &[Position3D::new(0.0, 0.0, 2.0)],
        );
        map.snapshot()
    }

    #[test]
    fn top_down_marks_tracked_object() {
        let snapshot = snapshot_with_person();
        let img = render_top_down(&snapshot, 2);
        assert_eq!(img.dimensions(), (100, 100));
        let (r, g, b) = snapshot.objects[0].color;
        // 目标位于 (25, 20) 单元中心
        assert_eq!(*img.get_pixel(51, 41), Rgb([r, g, b]));
    }

    #[test]
    fn overlay_draws_box_and_encodes_jpeg() {
        let renderer = OverlayRenderer::new(&SpatialConfig::default()).with_map(false);
        let frame = RgbImage::new(320, 240);
        let depth = DepthMap::from_normalized(Array2::from_elem((240, 320), 0.5));
        let detections = vec![ProjectedDetection {
            detection: Detection::new(BBox::new(20.0, 100.0, 60.0, 140.0), "person", 0.9),
            position: Position3D::new(0.0, 0.0, 2.0),
        }];
        let snapshot = snapshot_with_person();

        let annotated = renderer.annotate(&frame, &detections, &depth, &snapshot);
        let (r, g, b) = label_color("person");
        assert_eq!(*annotated.get_pixel(20, 120), Rgb([r, g, b]));
        // 深度缩略图位于右上角
        assert_ne!(*annotated.get_pixel(319, 0), Rgb([0, 0, 0]));

        let jpeg = renderer
            .render(&frame, &detections, &depth, &snapshot)
            .unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.width(), 320);
    }

    #[test]
    fn display_options_update_partially() {
        let renderer = OverlayRenderer::new(&SpatialConfig::default());
        let options = renderer.update_options(DisplayUpdate {
            show_depth: Some(false),
            ..Default::default()
        });
        assert_eq!(
            options,
            DisplayOptions {
                show_labels: true,
                show_depth: false,
                map_mode: true
            }
        );

        let frame = RgbImage::new(320, 240);
        let depth = DepthMap::from_normalized(Array2::from_elem((240, 320), 0.5));
        let annotated = renderer.with_map(false).annotate(&frame, &[], &depth, &snapshot_with_person());
        assert_eq!(*annotated.get_pixel(319, 0), Rgb([0, 0, 0]));
    }

    #[test]
    fn oversized_box_is_clipped_to_canvas() {
        let renderer = OverlayRenderer::new(&SpatialConfig::default()).with_map(false);
        let frame = RgbImage::new(320, 240);
        let depth = DepthMap::from_normalized(Array2::from_elem((240, 320), 0.5));
        let detections = vec![
            ProjectedDetection {
                detection: Detection::new(BBox::new(0.0, 0.0, 5e9, 10.0), "person", 0.9),
                position: Position3D::ZERO,
            },
            ProjectedDetection {
                detection: Detection::new(BBox::new(-50.0, 500.0, -10.0, 900.0), "cup", 0.4),
                position: Position3D::ZERO,
            },
        ];

        let annotated = renderer.annotate(&frame, &detections, &depth, &snapshot_with_person());
        let (r, g, b) = label_color("person");
        assert_eq!(*annotated.get_pixel(0, 5), Rgb([r, g, b]));
        assert!(renderer
            .render(&frame, &detections, &depth, &snapshot_with_person())
            .is_ok());
    }

    #[test]
    fn clip_rejects_boxes_outside_canvas() {
        assert_eq!(clip_to_canvas(&BBox::new(-50.0, 10.0, -10.0, 20.0), 100, 100), None);
        assert_eq!(clip_to_canvas(&BBox::new(10.0, 10.0, 10.2, 20.0), 100, 100), None);
        assert_eq!(
            clip_to_canvas(&BBox::new(-5.0, 90.0, 50.0, 1e12), 100, 100),
            Some((0, 90, 50, 10))
        );
    }

    #[test]
    fn missing_font_file_is_an_error() {
        let result = OverlayRenderer::new(&SpatialConfig::default())
            .with_font_file("/nonexistent/font.ttf");
        assert!(result.is_err());
    }
}
