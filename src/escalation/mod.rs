//! 升级引擎：每个开门区域一个 DoorTimer，宽限期到达后边沿触发报警
//!
//! 区域状态：NONE -> OPEN_PENDING -> ALARM_TRIGGERED -> NONE

pub mod engine;

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::WatchError;

pub use engine::{DoorTimer, EscalationEngine};

/// 宽限期缺失或非法时的默认值（秒）
pub const DEFAULT_GRACE_SECS: f64 = 30.0;

/// 宽限期与静音窗口的上限（秒）：7 天
pub const MAX_GRACE_SECS: f64 = 7.0 * 24.0 * 3600.0;

fn grace_secs_valid(secs: f64) -> bool {
    secs.is_finite() && secs > 0.0 && secs <= MAX_GRACE_SECS
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraceUnits {
    #[default]
    Seconds,
    Minutes,
}

/// [escalation.grace] 段：摄像头覆盖 > 区域覆盖 > 默认
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GracePolicy {
    pub default: f64,
    pub units: GraceUnits,
    pub cameras: HashMap<String, f64>,
    pub zones: HashMap<String, f64>,
}

impl Default for GracePolicy {
    fn default() -> Self {
        Self {
            default: DEFAULT_GRACE_SECS,
            units: GraceUnits::Seconds,
            cameras: HashMap::new(),
            zones: HashMap::new(),
        }
    }
}

impl GracePolicy {
    /// 按优先级解析；结果非正或非有限数时返回 None
    pub fn resolve(&self, zone_id: &str, camera_id: &str) -> Option<Duration> {
        let value = self
            .cameras
            .get(camera_id)
            .or_else(|| self.zones.get(zone_id))
            .copied()
            .unwrap_or(self.default);
        let secs = self.scaled(value);
        if !grace_secs_valid(secs) {
            return None;
        }
        Duration::try_from_secs_f64(secs).ok()
    }

    fn scaled(&self, value: f64) -> f64 {
        match self.units {
            GraceUnits::Seconds => value,
            GraceUnits::Minutes => value * 60.0,
        }
    }

    /// 默认值与所有覆盖值都必须在 (0, 7 天] 内
    pub fn validate(&self) -> Result<(), WatchError> {
        let overrides = self
            .cameras
            .iter()
            .map(|(id, v)| (format!("camera {}", id), *v))
            .chain(self.zones.iter().map(|(id, v)| (format!("zone {}", id), *v)));
        for (name, value) in std::iter::once(("default".to_string(), self.default)).chain(overrides) {
            if !grace_secs_valid(self.scaled(value)) {
                return Err(WatchError::Config(format!(
                    "grace for {} must be within (0, {}s], got {}",
                    name, MAX_GRACE_SECS, value
                )));
            }
        }
        Ok(())
    }

    /// 运行时设置区域宽限期（按当前单位换算）
    pub fn set_zone(&mut self, zone_id: &str, grace: Duration) {
        let value = match self.units {
            GraceUnits::Seconds => grace.as_secs_f64(),
            GraceUnits::Minutes => grace.as_secs_f64() / 60.0,
        };
        self.zones.insert(zone_id.to_string(), value);
    }
}

/// [escalation] 段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationSettings {
    pub grace: GracePolicy,
    /// 超过 orphan_multiplier × 宽限期未刷新的计时器被强制过期
    pub orphan_multiplier: u32,
    pub clear_policy: ClearPolicy,
    /// 确认报警后的静音秒数；0 表示门仍开着时下一个 tick 即重新触发
    pub ack_mute_secs: f64,
}

impl Default for EscalationSettings {
    fn default() -> Self {
        Self {
            grace: GracePolicy::default(),
            orphan_multiplier: 120,
            clear_policy: ClearPolicy::Zone,
            ack_mute_secs: 0.0,
        }
    }
}

impl EscalationSettings {
    pub fn ack_mute(&self) -> Duration {
        if self.ack_mute_secs.is_finite() && self.ack_mute_secs > 0.0 {
            Duration::try_from_secs_f64(self.ack_mute_secs.min(MAX_GRACE_SECS)).unwrap_or_default()
        } else {
            Duration::ZERO
        }
    }

    pub fn validate(&self) -> Result<(), WatchError> {
        self.grace.validate()?;
        if !self.ack_mute_secs.is_finite() || !(0.0..=MAX_GRACE_SECS).contains(&self.ack_mute_secs) {
            return Err(WatchError::Config(format!(
                "ack_mute_secs {} outside 0..={}",
                self.ack_mute_secs, MAX_GRACE_SECS
            )));
        }
        Ok(())
    }
}

/// 关门时清理的范围
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearPolicy {
    /// 只清理该区域
    #[default]
    Zone,
    /// 任一区域关门即清理全部计时器
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearReason {
    Closed,
    Timeout,
    Expired,
    Reset,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EscalationEvent {
    AlarmTriggered {
        zone_id: String,
        camera_id: String,
        elapsed: Duration,
        grace_period: Duration,
    },
    AlarmCleared {
        zone_id: String,
        camera_id: Option<String>,
        reason: ClearReason,
        was_alarming: bool,
    },
    TimerExpired {
        zone_id: String,
        camera_id: String,
        silent: Duration,
    },
}

impl EscalationEvent {
    pub fn zone_id(&self) -> &str {
        match self {
            Self::AlarmTriggered { zone_id, .. }
            | Self::AlarmCleared { zone_id, .. }
            | Self::TimerExpired { zone_id, .. } => zone_id,
        }
    }
}

/// 计时器只读视图
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimerSnapshot {
    pub zone_id: String,
    pub camera_id: String,
    pub elapsed: Duration,
    pub remaining: Duration,
    pub grace_period: Duration,
    pub alarm_triggered: bool,
    /// 0..=100
    pub progress_percent: f64,
}
