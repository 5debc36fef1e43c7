//! 节能调度：每个视频源一个 IDLE / ALERT / ACTIVE 状态机
//!
//! 只给出建议的运行参数（检测间隔、帧率、分辨率、编码质量），不做任何 I/O。

pub mod motion;
pub mod scheduler;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration_from_secs;
use crate::core::WatchError;

/// 超时与检测间隔上限（秒）：1 天
pub const MAX_ECO_SECS: f64 = 24.0 * 3600.0;

fn secs_valid(secs: f64) -> bool {
    secs.is_finite() && (0.0..=MAX_ECO_SECS).contains(&secs)
}

pub use motion::{MotionEstimator, MotionReading, MotionSettings};
pub use scheduler::EcoScheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EcoState {
    Idle,
    Alert,
    Active,
}

impl std::fmt::Display for EcoState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Alert => "alert",
            Self::Active => "active",
        };
        f.write_str(name)
    }
}

/// 某状态下建议的采集与检测参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EcoProfile {
    pub detection_interval_secs: f64,
    pub frame_rate: u32,
    pub detection_enabled: bool,
    pub resolution_scale: f32,
    pub encode_quality: u8,
}

impl EcoProfile {
    pub fn detection_interval(&self) -> Duration {
        duration_from_secs(self.detection_interval_secs, Duration::from_secs(1))
    }

    /// 帧间隔 = 1 / frame_rate
    pub fn frame_delay(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frame_rate.max(1) as f64)
    }

    /// 按 resolution_scale 缩放，结果向上取偶数（编码器要求）
    pub fn scale_dimensions(&self, width: u32, height: u32) -> (u32, u32) {
        if self.resolution_scale >= 1.0 {
            return (width, height);
        }
        let even = |v: u32| if v % 2 == 0 { v } else { v + 1 };
        let scale = |v: u32| even(((v as f32 * self.resolution_scale) as u32).max(1));
        (scale(width), scale(height))
    }

    fn validate(&self, state: EcoState) -> Result<(), WatchError> {
        if !secs_valid(self.detection_interval_secs) {
            return Err(WatchError::Config(format!(
                "{} profile detection_interval_secs {} outside 0..={}",
                state, self.detection_interval_secs, MAX_ECO_SECS
            )));
        }
        if self.frame_rate == 0 {
            return Err(WatchError::Config(format!("{} profile frame_rate must be > 0", state)));
        }
        if !(self.resolution_scale > 0.0 && self.resolution_scale <= 1.0) {
            return Err(WatchError::Config(format!(
                "{} profile resolution_scale {} outside (0, 1]",
                state, self.resolution_scale
            )));
        }
        if !(1..=100).contains(&self.encode_quality) {
            return Err(WatchError::Config(format!(
                "{} profile encode_quality {} outside 1..=100",
                state, self.encode_quality
            )));
        }
        Ok(())
    }
}

/// [eco] 段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EcoSettings {
    /// 关闭时固定使用 active 参数
    pub enabled: bool,
    pub idle_timeout_secs: f64,
    pub alert_timeout_secs: f64,
    pub motion: MotionSettings,
    pub idle: EcoProfile,
    pub alert: EcoProfile,
    pub active: EcoProfile,
}

impl Default for EcoSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_timeout_secs: 30.0,
            alert_timeout_secs: 10.0,
            motion: MotionSettings::default(),
            idle: EcoProfile {
                detection_interval_secs: 5.0,
                frame_rate: 5,
                detection_enabled: false,
                resolution_scale: 0.5,
                encode_quality: 50,
            },
            alert: EcoProfile {
                detection_interval_secs: 2.0,
                frame_rate: 15,
                detection_enabled: true,
                resolution_scale: 0.75,
                encode_quality: 60,
            },
            active: EcoProfile {
                detection_interval_secs: 0.5,
                frame_rate: 30,
                detection_enabled: true,
                resolution_scale: 1.0,
                encode_quality: 70,
            },
        }
    }
}

impl EcoSettings {
    pub fn profile(&self, state: EcoState) -> &EcoProfile {
        match state {
            EcoState::Idle => &self.idle,
            EcoState::Alert => &self.alert,
            EcoState::Active => &self.active,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        duration_from_secs(self.idle_timeout_secs, Duration::from_secs(30))
    }

    pub fn alert_timeout(&self) -> Duration {
        duration_from_secs(self.alert_timeout_secs, Duration::from_secs(10))
    }

    pub fn validate(&self) -> Result<(), WatchError> {
        for state in [EcoState::Idle, EcoState::Alert, EcoState::Active] {
            self.profile(state).validate(state)?;
        }
        for (name, secs) in [
            ("idle_timeout_secs", self.idle_timeout_secs),
            ("alert_timeout_secs", self.alert_timeout_secs),
        ] {
            if !secs_valid(secs) {
                return Err(WatchError::Config(format!(
                    "{} {} outside 0..={}",
                    name, secs, MAX_ECO_SECS
                )));
            }
        }
        if !(self.motion.motion_threshold > 0.0 && self.motion.motion_threshold < 1.0) {
            return Err(WatchError::Config(format!(
                "motion_threshold {} outside (0, 1)",
                self.motion.motion_threshold
            )));
        }
        Ok(())
    }
}

/// 调度器只读状态
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EcoStatus {
    pub source_id: String,
    pub state: EcoState,
    pub profile: EcoProfile,
    pub since_motion: Duration,
    pub since_detection: Option<Duration>,
    pub in_state_for: Duration,
    pub last_motion_ratio: f64,
    pub motion_threshold: f64,
}
