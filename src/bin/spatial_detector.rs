// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 空间检测演示程序
//!
//! 模拟多个摄像头客户端推送JPEG帧, 经处理循环输出三维检测结果与标注帧.
//! 直接运行: cargo run --bin spatial-detector --release
use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use image::codecs::jpeg::JpegEncoder;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use spatial_detector::pipeline::synthetic::{test_pattern, BrightRegionDetector, GradientDepth};
use spatial_detector::{gen_time_string, OverlayRenderer, SessionMeta, SpatialConfig, SpatialService};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// 空间检测演示程序
#[derive(Parser, Debug)]
#[command(author, version, about = "单目三维空间检测与跟踪", long_about = None)]
struct Args {
    /// 参数配置文件 (不存在时写出默认值)
    #[arg(short, long, default_value = "spatial_config.json")]
    config: PathBuf,

    /// 相机标定文件
    #[arg(long)]
    calibration: Option<PathBuf>,

    /// 模拟客户端数量
    #[arg(long, default_value_t = 2)]
    clients: usize,

    /// 帧宽度
    #[arg(long, default_value_t = 640)]
    width: u32,

    /// 帧高度
    #[arg(long, default_value_t = 480)]
    height: u32,

    /// 每个客户端推送的帧数
    #[arg(long, default_value_t = 150)]
    frames: u64,

    /// 推送帧率
    #[arg(long, default_value_t = 15.0)]
    fps: f64,

    /// 标注帧与检测结果输出目录
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// 标签字体 (TTF/OTF)
    #[arg(long)]
    font: Option<PathBuf>,
}

fn encode_jpeg(img: &image::RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, quality).encode_image(img)?;
    Ok(bytes)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spatial_detector=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = SpatialConfig::load(&args.config);
    config.print_summary();

    let mut renderer = OverlayRenderer::new(&config);
    if let Some(font) = &args.font {
        renderer = renderer.with_font_file(font)?;
    }

    let service = Arc::new(
        SpatialService::new(
            config.clone(),
            Arc::new(BrightRegionDetector::new("person")),
            Arc::new(GradientDepth::default()),
        )
        .with_renderer(renderer),
    );

    if let Some(path) = &args.calibration {
        match service.load_calibration(path) {
            Ok(n) => info!("📐 标定字段: {}", n),
            Err(e) => warn!("⚠️  标定文件加载失败, 使用默认内参: {}", e),
        }
    }

    let mut payload_log = match &args.output_dir {
        Some(dir) => {
            fs::create_dir_all(dir).with_context(|| format!("创建输出目录失败: {}", dir.display()))?;
            let file = File::create(dir.join("detections.jsonl"))?;
            Some(BufWriter::new(file))
        }
        None => None,
    };

    // ========== 模拟客户端 ==========
    let mut clients = Vec::new();
    for i in 0..args.clients.max(1) {
        let meta = SessionMeta::new(format!("simulated-{}", i), args.width, args.height);
        let id = service.register(meta)?;
        let service = Arc::clone(&service);
        let (width, height, frames) = (args.width, args.height, args.frames);
        let interval = Duration::from_secs_f64(1.0 / args.fps.max(0.1));
        let quality = config.jpeg_quality;

        clients.push(thread::spawn(move || -> Result<()> {
            for tick in 0..frames {
                let frame = test_pattern(width, height, tick + i as u64 * 37);
                let bytes = encode_jpeg(&frame, quality)?;
                service.ingest_encoded(id, &bytes);
                thread::sleep(interval);
            }
            service.disconnect(id)?;
            Ok(())
        }));
    }

    let outputs = service.outputs().context("处理循环未启动")?;
    let events = service.events();
    let start = Instant::now();

    info!("🎬 {} 个客户端开始推流", args.clients.max(1));
    loop {
        for event in events.try_iter() {
            info!("📡 会话事件: {}", serde_json::to_string(&event)?);
        }

        match outputs.recv_timeout(Duration::from_millis(200)) {
            Ok(processed) => {
                let payload = &processed.payload;
                if let Some(log) = payload_log.as_mut() {
                    writeln!(log, "{}", payload.to_json()?)?;
                }
                if let (Some(dir), Some(jpeg)) = (&args.output_dir, &processed.annotated) {
                    let name = format!("{}_{:06}.jpg", gen_time_string(""), payload.frame_seq);
                    fs::write(dir.join(name), jpeg.as_slice())?;
                }
                for record in &payload.detections {
                    info!(
                        "🎯 {} #{} {} {:.2} @ [{:.2}, {:.2}, {:.2}]",
                        payload.session_id,
                        payload.frame_seq,
                        record.label,
                        record.confidence,
                        record.position_3d[0],
                        record.position_3d[1],
                        record.position_3d[2]
                    );
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if clients.iter().all(|c| c.is_finished()) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    for client in clients {
        match client.join() {
            Ok(Err(e)) => warn!("⚠️  客户端异常: {:#}", e),
            Err(_) => warn!("⚠️  客户端线程panic"),
            Ok(Ok(())) => {}
        }
    }
    if let Some(mut log) = payload_log {
        log.flush()?;
    }

    let status = service.status();
    service.shutdown();
    info!(
        "✅ 完成 | 耗时 {:.1}s | 已处理 {} 帧 | 状态: {}",
        start.elapsed().as_secs_f64(),
        status.frames_processed,
        serde_json::to_string(&status)?
    );
    Ok(())
}
