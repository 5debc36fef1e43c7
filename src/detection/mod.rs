//! 检测输入与区域聚合
//!
//! 外部检测器每帧给出一批 Detection；ZoneAggregator 把它们归并为每区域一条状态，
//! 只在状态边沿上产出 ZoneTransition（开门 / 关门 / 超时）。

pub mod aggregator;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration_from_secs;
use crate::core::WatchError;

pub use aggregator::ZoneAggregator;

/// 检测框（像素坐标）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

/// 单条原始检测
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    /// 缺省时归入 "{source_id}_default"
    #[serde(default)]
    pub zone_id: Option<String>,
    #[serde(default)]
    pub bbox: Option<BoundingBox>,
}

impl Detection {
    pub fn new(label: impl Into<String>, confidence: f32, zone_id: Option<&str>) -> Self {
        Self {
            label: label.into(),
            confidence,
            zone_id: zone_id.map(str::to_string),
            bbox: None,
        }
    }
}

/// 归一化后的门状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoorLabel {
    Open,
    Closed,
    Unknown,
}

/// 检测标签到门状态的映射（大小写不敏感）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelMap {
    pub open: Vec<String>,
    pub closed: Vec<String>,
}

impl Default for LabelMap {
    fn default() -> Self {
        Self {
            open: vec!["gate_open".into(), "open".into(), "door_open".into()],
            closed: vec!["gate_closed".into(), "closed".into(), "door_closed".into()],
        }
    }
}

impl LabelMap {
    pub fn classify(&self, label: &str) -> DoorLabel {
        let matches = |names: &[String]| names.iter().any(|n| n.eq_ignore_ascii_case(label));
        if matches(&self.open) {
            DoorLabel::Open
        } else if matches(&self.closed) {
            DoorLabel::Closed
        } else {
            DoorLabel::Unknown
        }
    }
}

/// state_timeout_secs 上限：1 天
pub const MAX_STATE_TIMEOUT_SECS: f64 = 24.0 * 3600.0;

/// [detection] 段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorSettings {
    /// 低于该置信度的检测完全忽略
    pub min_confidence: f32,
    /// 区域无检测超过该时长视为超时（秒）
    pub state_timeout_secs: f64,
    /// 静默 gc_factor × state_timeout 后删除区域记录
    pub gc_factor: u32,
    pub labels: LabelMap,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            min_confidence: 0.75,
            state_timeout_secs: 2.0,
            gc_factor: 10,
            labels: LabelMap::default(),
        }
    }
}

impl AggregatorSettings {
    /// 非法值按默认 2 秒处理
    pub fn state_timeout(&self) -> Duration {
        duration_from_secs(self.state_timeout_secs, Duration::from_secs(2))
    }

    pub fn gc_after(&self) -> Duration {
        self.state_timeout()
            .checked_mul(self.gc_factor.max(1))
            .unwrap_or(Duration::MAX)
    }

    pub fn validate(&self) -> Result<(), WatchError> {
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(WatchError::Config(format!(
                "min_confidence {} outside 0..=1",
                self.min_confidence
            )));
        }
        let timeout = self.state_timeout_secs;
        if !timeout.is_finite() || timeout <= 0.0 || timeout > MAX_STATE_TIMEOUT_SECS {
            return Err(WatchError::Config(format!(
                "state_timeout_secs {} outside (0, {}]",
                timeout, MAX_STATE_TIMEOUT_SECS
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Open,
    Close,
    Timeout,
}

/// 区域状态边沿
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneTransition {
    pub kind: TransitionKind,
    pub zone_id: String,
    pub source_id: String,
    /// 触发该边沿的检测置信度；超时为 0
    pub confidence: f32,
    pub average_confidence: f64,
}

/// 一次 process 的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameOutcome {
    pub transitions: Vec<ZoneTransition>,
    /// 本帧确认仍为开门状态的区域（用于刷新计时器）
    pub confirmed_open: Vec<String>,
}

/// 区域状态的只读视图
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneStateView {
    pub zone_id: String,
    pub source_id: String,
    pub label: DoorLabel,
    pub alert_active: bool,
    pub detection_count: u64,
    pub average_confidence: f64,
    pub silent_for: Duration,
}
