// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 单帧处理: 深度查询 → 投影 → 跟踪 → 渲染 → 结果
//!
//! 相机和跟踪器缺失或尺寸不符时按当前帧尺寸惰性重建, 不让这一帧失败.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::collaborators::{DepthEstimator, FrameRenderer, ProjectedDetection};
use super::payload::DetectionPayload;
use crate::config::SpatialConfig;
use crate::detection::{Detection, DepthMap, Position3D};
use crate::projection::PinholeCamera;
use crate::session::Frame;
use crate::tracking::{MapSnapshot, SpatialMap, UpdateSummary};

/// 一帧的处理输出
#[derive(Clone, Debug)]
pub struct ProcessedFrame {
    pub payload: DetectionPayload,
    /// 编码后的标注帧; 没有渲染器或渲染失败时为None
    pub annotated: Option<Arc<Vec<u8>>>,
    pub snapshot: Arc<MapSnapshot>,
    pub summary: UpdateSummary,
}

/// 帧处理器 (由处理循环独占)
pub struct FrameProcessor {
    config: SpatialConfig,
    depth: Arc<dyn DepthEstimator>,
    renderer: Option<Arc<dyn FrameRenderer>>,
    camera: Option<Arc<PinholeCamera>>,
    tracker: Option<SpatialMap>,
}

impl FrameProcessor {
    pub fn new(
        config: SpatialConfig,
        depth: Arc<dyn DepthEstimator>,
        renderer: Option<Arc<dyn FrameRenderer>>,
        camera: Option<Arc<PinholeCamera>>,
    ) -> Self {
        Self {
            config,
            depth,
            renderer,
            camera,
            tracker: None,
        }
    }

    pub fn camera(&self) -> Option<&Arc<PinholeCamera>> {
        self.camera.as_ref()
    }

    pub fn tracker(&self) -> Option<&SpatialMap> {
        self.tracker.as_ref()
    }

    /// 活动会话变化: 尺寸不同时相机重置主点, 跟踪器清空 (ID不复用)
    pub fn reinitialize(&mut self, width: u32, height: u32) {
        match &self.camera {
            Some(camera) => {
                let intrinsics = camera.snapshot();
                if intrinsics.image_width as u32 != width || intrinsics.image_height as u32 != height
                {
                    camera.resize(width, height);
                }
            }
            None => self.camera = Some(Arc::new(self.build_camera(width, height))),
        }
        match &mut self.tracker {
            Some(tracker) => tracker.reset(),
            None => self.tracker = Some(SpatialMap::from_config(&self.config)),
        }
        info!("🔧 处理器已按 {}x{} 重建", width, height);
    }

    fn build_camera(&self, width: u32, height: u32) -> PinholeCamera {
        PinholeCamera::with_image_size(width, height, self.config.default_focal_length)
            .with_max_depth(self.config.max_depth)
    }

    /// 确保相机与跟踪器可用且与帧尺寸一致
    fn ensure_ready(&mut self, width: u32, height: u32) -> Arc<PinholeCamera> {
        if self.tracker.is_none() {
            warn!("⚠️  跟踪器未初始化, 重建");
            self.tracker = Some(SpatialMap::from_config(&self.config));
        }

        match &self.camera {
            Some(camera) => {
                let intrinsics = camera.snapshot();
                if intrinsics.image_width as u32 != width || intrinsics.image_height as u32 != height
                {
                    debug!("帧尺寸与相机不一致, 按 {}x{} 调整", width, height);
                    camera.resize(width, height);
                }
                Arc::clone(camera)
            }
            None => {
                warn!("⚠️  相机未初始化, 按 {}x{} 重建", width, height);
                let camera = Arc::new(self.build_camera(width, height));
                self.camera = Some(Arc::clone(&camera));
                camera
            }
        }
    }

    /// 检测框中心 → 深度查询 → 投影; 任一步失败得到零向量
    pub fn project(
        &self,
        camera: &PinholeCamera,
        detections: &[Detection],
        depth: &DepthMap,
    ) -> Vec<ProjectedDetection> {
        let depth_scale = camera.depth_scale().unwrap_or(self.config.depth_scale);
        detections
            .iter()
            .map(|det| {
                let position = self
                    .project_one(camera, det, depth, depth_scale)
                    .unwrap_or(Position3D::ZERO);
                ProjectedDetection {
                    detection: det.clone(),
                    position,
                }
            })
            .collect()
    }

    fn project_one(
        &self,
        camera: &PinholeCamera,
        det: &Detection,
        depth: &DepthMap,
        depth_scale: f64,
    ) -> Option<Position3D> {
        if !det.bbox.is_valid() {
            debug!("跳过非法检测框: {:?}", det.bbox);
            return None;
        }
        let (cx, cy) = det.bbox.center();
        let Some(sample) = self.depth.query_point(depth, cx as i64, cy as i64) else {
            debug!("{} 中心 ({:.0}, {:.0}) 超出深度图", det.class_name, cx, cy);
            return None;
        };
        match camera.pixel_to_world(
            cx as f64,
            cy as f64,
            sample as f64,
            self.config.normalized_depth,
            depth_scale,
        ) {
            Ok(position) => Some(position),
            Err(e) => {
                debug!("{} 投影失败: {}", det.class_name, e);
                None
            }
        }
    }

    /// 处理一帧检测与深度结果
    pub fn process(
        &mut self,
        frame: &Frame,
        detections: Vec<Detection>,
        depth: &DepthMap,
    ) -> ProcessedFrame {
        let camera = self.ensure_ready(frame.width(), frame.height());
        let projected = self.project(&camera, &detections, depth);

        let positions: Vec<Position3D> = projected.iter().map(|p| p.position).collect();
        let config = &self.config;
        let tracker = self
            .tracker
            .get_or_insert_with(|| SpatialMap::from_config(config));
        let summary = tracker.update(&detections, &positions);
        let snapshot = tracker.snapshot();

        let annotated = self.renderer.as_ref().and_then(|renderer| {
            match renderer.render(&frame.image, &projected, depth, &snapshot) {
                Ok(bytes) => Some(Arc::new(bytes)),
                Err(e) => {
                    warn!("⚠️  渲染失败: {:#}", e);
                    None
                }
            }
        });

        let payload = DetectionPayload::new(
            &projected,
            camera.max_depth(),
            frame.session_id,
            frame.seq,
        );

        ProcessedFrame {
            payload,
            annotated,
            snapshot,
            summary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BBox;
    use crate::projection::CameraIntrinsics;
    use crate::session::SessionId;
    use image::RgbImage;
    use ndarray::Array2;
    use std::time::Instant;

    struct MapDepth;

    impl DepthEstimator for MapDepth {
        fn estimate(&self, _frame: &RgbImage) -> anyhow::Result<DepthMap> {
            anyhow::bail!("unused")
        }
    }

    fn frame(w: u32, h: u32) -> Frame {
        Frame {
            session_id: SessionId(0),
            seq: 0,
            image: Arc::new(RgbImage::new(w, h)),
            received_at: Instant::now(),
        }
    }

    fn processor(camera: Option<Arc<PinholeCamera>>) -> FrameProcessor {
        FrameProcessor::new(SpatialConfig::default(), Arc::new(MapDepth), None, camera)
    }

    fn calibrated_camera() -> Arc<PinholeCamera> {
        Arc::new(PinholeCamera::new(CameraIntrinsics {
            fx: 1000.0,
            fy: 1000.0,
            cx: 320.0,
            cy: 320.0,
            image_width: 640.0,
            image_height: 640.0,
            depth_scale: None,
        }))
    }

    #[test]
    fn detection_center_is_projected() {
        let mut p = processor(Some(calibrated_camera()));
        let depth = DepthMap::from_normalized(Array2::from_elem((640, 640), 0.4));
        let dets = vec![Detection::new(BBox::new(100.0, 100.0, 200.0, 200.0), "person", 0.9)];
        let out = p.process(&frame(640, 640), dets, &depth);

        let pos = out.payload.detections[0].position_3d;
        assert!((pos[2] - 2.0).abs() < 1e-6);
        assert!((pos[0] - -0.34).abs() < 1e-6);
        assert!((pos[1] - -0.34).abs() < 1e-6);
        assert_eq!(out.summary.spawned, 1);
        assert_eq!(out.snapshot.objects.len(), 1);
    }

    #[test]
    fn out_of_bounds_center_falls_back_to_zero() {
        let mut p = processor(Some(calibrated_camera()));
        let depth = DepthMap::from_normalized(Array2::from_elem((64, 64), 0.4));
        let dets = vec![
            Detection::new(BBox::new(100.0, 100.0, 200.0, 200.0), "person", 0.9),
            Detection::new(BBox::new(10.0, 10.0, 20.0, 20.0), "cup", 0.5),
        ];
        let out = p.process(&frame(640, 640), dets, &depth);
        assert_eq!(out.payload.detections[0].position_3d, [0.0, 0.0, 0.0]);
        assert!(out.payload.detections[1].position_3d[2] > 0.0);
        // 零向量不参与跟踪
        assert_eq!(out.summary.spawned, 1);
    }

    #[test]
    fn missing_camera_and_tracker_are_rebuilt_from_frame() {
        let mut p = processor(None);
        let depth = DepthMap::from_normalized(Array2::from_elem((48, 64), 0.5));
        let out = p.process(&frame(64, 48), vec![], &depth);
        assert!(out.payload.detections.is_empty());
        let intrinsics = p.camera().unwrap().snapshot();
        assert_eq!(intrinsics.cx, 32.0);
        assert_eq!(intrinsics.cy, 24.0);
        assert!(p.tracker().is_some());
    }

    #[test]
    fn calibrated_depth_scale_overrides_config() {
        let camera = calibrated_camera();
        camera.calibrate_depth_scale(0.5, 4.0).unwrap();
        let mut p = processor(Some(camera));
        let depth = DepthMap::from_normalized(Array2::from_elem((640, 640), 0.5));
        let dets = vec![Detection::new(BBox::new(310.0, 310.0, 330.0, 330.0), "chair", 0.7)];
        let out = p.process(&frame(640, 640), dets, &depth);
        assert!((out.payload.detections[0].position_3d[2] - 4.0).abs() < 1e-6);
    }

    #[test]
    fn reinitialize_with_same_size_keeps_calibration() {
        let camera = Arc::new(PinholeCamera::new(CameraIntrinsics {
            cx: 300.0,
            ..calibrated_camera().snapshot()
        }));
        let mut p = processor(Some(Arc::clone(&camera)));
        p.reinitialize(640, 640);
        assert_eq!(camera.snapshot().cx, 300.0);
        p.reinitialize(320, 240);
        assert_eq!(camera.snapshot().cx, 160.0);
    }

    #[test]
    fn reinitialize_resets_tracks_but_keeps_ids_unique() {
        let mut p = processor(Some(calibrated_camera()));
        let depth = DepthMap::from_normalized(Array2::from_elem((640, 640), 0.4));
        let det = || vec![Detection::new(BBox::new(100.0, 100.0, 200.0, 200.0), "person", 0.9)];
        p.process(&frame(640, 640), det(), &depth);
        p.reinitialize(640, 640);
        assert_eq!(p.tracker().unwrap().track_count(), 0);
        let out = p.process(&frame(640, 640), det(), &depth);
        assert_eq!(out.snapshot.objects[0].id, 1);
    }
}
