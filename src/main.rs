//! Doorwatch - 门禁区域监控
//!
//! 入口：初始化日志、加载配置、启动 Monitor，从标准输入逐行读取 JSON（检测帧或控制命令），
//! 收到 Ctrl+C / SIGTERM 或输入结束时停止所有报警并关闭事件日志。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use doorwatch::alarm::PhasePlan;
use doorwatch::config::{load_config, AppConfig};
use doorwatch::core::{
    run_with_graceful_shutdown, AlarmCleanup, JournalCleanup, Monitor, MonitorBuilder,
    ShutdownCoordinator, ShutdownManager,
};
use doorwatch::detection::Detection;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};

/// 一帧检测结果
#[derive(Debug, Deserialize)]
struct FrameMessage {
    source_id: String,
    #[serde(default)]
    detections: Vec<Detection>,
    /// 采集端自带的运动判定
    motion: Option<bool>,
    /// 原始帧图片路径（用于运动估计与通知快照）
    frame_path: Option<PathBuf>,
}

/// 运维命令
#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum ControlMessage {
    Acknowledge { zone_id: String },
    StopAll,
    ResetZone { zone_id: String },
    ResetAll,
    SetGrace { zone_id: String, seconds: f64 },
    SetPhasePlan { zone_id: String, plan: Option<PhasePlan> },
    Status,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InputLine {
    Control(ControlMessage),
    Frame(FrameMessage),
}

fn handle_frame(monitor: &Monitor, frame: FrameMessage) {
    if let Some(path) = &frame.frame_path {
        match image::open(path) {
            Ok(img) => {
                monitor.observe_frame(&frame.source_id, &img);
            }
            Err(e) => tracing::warn!("Cannot read frame {}: {}", path.display(), e),
        }
    }
    if let Some(motion) = frame.motion {
        monitor.observe_motion(&frame.source_id, motion);
    }
    if !frame.detections.is_empty() || frame.motion.is_none() {
        monitor.process_frame(&frame.source_id, &frame.detections);
    }
}

async fn handle_control(monitor: &Monitor, control: ControlMessage) -> anyhow::Result<()> {
    match control {
        ControlMessage::Acknowledge { zone_id } => {
            if !monitor.acknowledge(&zone_id) {
                tracing::warn!("No timer for zone {}", zone_id);
            }
        }
        ControlMessage::StopAll => {
            let zones = monitor.stop_all_alarms();
            tracing::info!("Stopped alarms: {:?}", zones);
        }
        ControlMessage::ResetZone { zone_id } => monitor.reset_zone(&zone_id),
        ControlMessage::ResetAll => monitor.reset_all(),
        ControlMessage::SetGrace { zone_id, seconds } => {
            if !seconds.is_finite() || seconds <= 0.0 {
                anyhow::bail!("grace for {} must be a positive number", zone_id);
            }
            let grace = Duration::try_from_secs_f64(seconds)
                .with_context(|| format!("grace for {} out of range", zone_id))?;
            monitor.update_grace_period(&zone_id, grace)?;
        }
        ControlMessage::SetPhasePlan { zone_id, plan } => {
            monitor.set_phase_plan(&zone_id, plan)?;
        }
        ControlMessage::Status => {
            let status = serde_json::json!({
                "summary": monitor.summary().borrow().clone(),
                "timers": monitor.get_active_timers(),
                "zones": monitor.get_zone_states(),
                "alarms": monitor.active_alarms().await,
            });
            println!("{}", status);
        }
    }
    Ok(())
}

async fn read_input(monitor: Arc<Monitor>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!("stdin read failed: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<InputLine>(&line) {
            Ok(InputLine::Frame(frame)) => handle_frame(&monitor, frame),
            Ok(InputLine::Control(control)) => {
                if let Err(e) = handle_control(&monitor, control).await {
                    tracing::warn!("Command rejected: {:#}", e);
                }
            }
            Err(e) => tracing::warn!("Unparseable input line ({}): {}", e, line),
        }
    }
    tracing::info!("Input closed");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    doorwatch::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let mut cfg = match load_config(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!("Config load failed, using defaults: {}", e);
            AppConfig::default()
        }
    };
    if let Err(e) = cfg.validate() {
        tracing::warn!("Invalid configuration: {}", e);
        cfg.sanitize();
    }

    let shutdown = Arc::new(ShutdownManager::new());
    let builder = MonitorBuilder::new(cfg).with_shutdown_token(shutdown.token());
    let journal = builder
        .config()
        .journal
        .path
        .as_ref()
        .map(doorwatch::journal::EventJournal::open)
        .transpose()
        .context("Failed to open event journal")?
        .map(Arc::new);
    let builder = match &journal {
        Some(journal) => builder.with_journal(Arc::clone(journal)),
        None => builder,
    };
    let monitor = builder.build();

    let mut events = monitor.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::info!(
                    kind = event.kind(),
                    "{}",
                    serde_json::to_string(&event).unwrap_or_default()
                ),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Event log lagged, {} events skipped", n)
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
    coordinator.register(AlarmCleanup::new(Arc::clone(&monitor)));
    if let Some(journal) = journal {
        coordinator.register(JournalCleanup::new(journal));
    }

    run_with_graceful_shutdown(shutdown, read_input(Arc::clone(&monitor)), || async move {
        coordinator.run_cleanup().await;
    })
    .await;

    Ok(())
}
