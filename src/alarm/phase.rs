//! 报警分级：AlarmPhase 与 PhasePlan
//!
//! 两种选择方式：按宽限期百分比（默认）或按绝对时长（区域级覆盖）。
//! 阶段选择是关于已用时间的纯函数；阈值在加载时校验为严格递增，因此随时间单调。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration_from_secs;
use crate::core::WatchError;

/// 单阶段重复间隔上限（秒）
pub const MAX_INTERVAL_SECS: f64 = 3600.0;
/// 百分比阈值上限
pub const MAX_PERCENT: f64 = 10_000.0;
/// 绝对时长阈值上限（秒）：7 天
pub const MAX_PHASE_SECS: f64 = 7.0 * 24.0 * 3600.0;

/// 宽限期为 0 时按 30 秒计算百分比
const FALLBACK_GRACE: Duration = Duration::from_secs(30);

/// 紧急程度（通知渠道据此调整措辞）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    Normal,
    High,
    Critical,
}

/// 单个报警阶段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmPhase {
    pub name: String,
    /// 重复间隔（秒），0 表示连续播放
    #[serde(default)]
    pub interval_secs: f64,
    #[serde(default = "default_volume")]
    pub volume: f32,
    #[serde(default = "default_urgency")]
    pub urgency: Urgency,
    /// sounds 目录下的素材文件名
    #[serde(default)]
    pub sound: Option<String>,
    /// 进入阶段时的播报/通知模板，支持 {zone} {camera} {elapsed} {phase} {count}
    #[serde(default)]
    pub message: Option<String>,
}

fn default_volume() -> f32 {
    0.5
}

fn default_urgency() -> Urgency {
    Urgency::Normal
}

impl AlarmPhase {
    /// 非法间隔按 MAX_INTERVAL_SECS 处理
    pub fn repeat_interval(&self) -> Duration {
        duration_from_secs(
            self.interval_secs.min(MAX_INTERVAL_SECS),
            Duration::from_secs(MAX_INTERVAL_SECS as u64),
        )
    }

    pub fn is_continuous(&self) -> bool {
        self.interval_secs.is_finite() && self.interval_secs <= 0.0
    }

    /// 未配置模板时按阶段名生成默认播报
    pub fn render_message(&self, zone: &str, camera: &str, elapsed: Duration, count: u32) -> String {
        let template = self.message.clone().unwrap_or_else(|| match self.urgency {
            Urgency::Low => "Door {zone} is open ({elapsed})".to_string(),
            Urgency::Normal => "Attention: door {zone} still open ({elapsed})".to_string(),
            Urgency::High => "URGENT: door {zone} requires action ({elapsed})".to_string(),
            Urgency::Critical => {
                "ALARM: door {zone} requires immediate attention ({elapsed})".to_string()
            }
        });
        let secs = elapsed.as_secs();
        template
            .replace("{zone}", zone)
            .replace("{camera}", camera)
            .replace("{elapsed}", &format!("{}m {}s", secs / 60, secs % 60))
            .replace("{phase}", &self.name)
            .replace("{count}", &count.to_string())
    }
}

/// 百分比模式下的阶段：until_percent 之前有效，最后一项可省略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PercentPhase {
    #[serde(default)]
    pub until_percent: Option<f64>,
    #[serde(flatten)]
    pub phase: AlarmPhase,
}

/// 绝对时长模式下的阶段：持续 duration_secs，最后一项无上限
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedPhase {
    #[serde(default)]
    pub duration_secs: Option<f64>,
    #[serde(flatten)]
    pub phase: AlarmPhase,
}

/// 阶段表：带标签的联合类型，在加载时校验
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PhasePlan {
    Percentage { phases: Vec<PercentPhase> },
    Absolute { phases: Vec<TimedPhase> },
}

impl Default for PhasePlan {
    fn default() -> Self {
        Self::Percentage {
            phases: vec![
                PercentPhase {
                    until_percent: Some(50.0),
                    phase: AlarmPhase {
                        name: "friendly".to_string(),
                        interval_secs: 10.0,
                        volume: 0.5,
                        urgency: Urgency::Low,
                        sound: Some("ding_dong.mp3".to_string()),
                        message: None,
                    },
                },
                PercentPhase {
                    until_percent: Some(90.0),
                    phase: AlarmPhase {
                        name: "moderate".to_string(),
                        interval_secs: 5.0,
                        volume: 0.7,
                        urgency: Urgency::High,
                        sound: Some("beep_alert.mp3".to_string()),
                        message: None,
                    },
                },
                PercentPhase {
                    until_percent: None,
                    phase: AlarmPhase {
                        name: "critical".to_string(),
                        interval_secs: 0.0,
                        volume: 1.0,
                        urgency: Urgency::Critical,
                        sound: Some("alarm_siren.mp3".to_string()),
                        message: None,
                    },
                },
            ],
        }
    }
}

impl PhasePlan {
    pub fn len(&self) -> usize {
        match self {
            Self::Percentage { phases } => phases.len(),
            Self::Absolute { phases } => phases.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn phase(&self, index: usize) -> &AlarmPhase {
        match self {
            Self::Percentage { phases } => &phases[index.min(phases.len() - 1)].phase,
            Self::Absolute { phases } => &phases[index.min(phases.len() - 1)].phase,
        }
    }

    /// 校验：非空；阈值为有限正数且有上限，百分比严格递增；除最后一项外都必须给出阈值
    pub fn validate(&self) -> Result<(), WatchError> {
        if self.is_empty() {
            return Err(WatchError::InvalidPhasePlan("plan has no phases".to_string()));
        }
        let bounds: Vec<Option<f64>> = match self {
            Self::Percentage { phases } => phases.iter().map(|p| p.until_percent).collect(),
            Self::Absolute { phases } => phases.iter().map(|p| p.duration_secs).collect(),
        };
        let limit = match self {
            Self::Percentage { .. } => MAX_PERCENT,
            Self::Absolute { .. } => MAX_PHASE_SECS,
        };
        let last = bounds.len() - 1;
        let mut previous = 0.0_f64;
        for (i, bound) in bounds.iter().enumerate() {
            match (bound, i == last) {
                (Some(value), _) => {
                    if !value.is_finite() || *value <= 0.0 || *value > limit {
                        return Err(WatchError::InvalidPhasePlan(format!(
                            "phase {} threshold {} outside (0, {}]",
                            i + 1,
                            value,
                            limit
                        )));
                    }
                    // 百分比是累计阈值，时长是区间长度
                    if matches!(self, Self::Percentage { .. }) && *value <= previous {
                        return Err(WatchError::InvalidPhasePlan(format!(
                            "phase {} threshold {} is not above {}",
                            i + 1,
                            value,
                            previous
                        )));
                    }
                    previous = *value;
                }
                (None, true) => {}
                (None, false) => {
                    return Err(WatchError::InvalidPhasePlan(format!(
                        "phase {} is not last but has no threshold",
                        i + 1
                    )));
                }
            }
        }
        for i in 0..self.len() {
            let phase = self.phase(i);
            if !phase.interval_secs.is_finite()
                || !(0.0..=MAX_INTERVAL_SECS).contains(&phase.interval_secs)
            {
                return Err(WatchError::InvalidPhasePlan(format!(
                    "phase {} interval {} outside 0..={}",
                    phase.name, phase.interval_secs, MAX_INTERVAL_SECS
                )));
            }
            if !(0.0..=1.0).contains(&phase.volume) {
                return Err(WatchError::InvalidPhasePlan(format!(
                    "phase {} volume {} outside 0..=1",
                    phase.name, phase.volume
                )));
            }
        }
        Ok(())
    }

    /// 当前阶段下标（0 起）；纯函数
    pub fn phase_index(&self, elapsed: Duration, grace_period: Duration) -> usize {
        match self {
            Self::Percentage { phases } => {
                let grace = if grace_period.is_zero() {
                    FALLBACK_GRACE
                } else {
                    grace_period
                };
                let percent = elapsed.as_secs_f64() / grace.as_secs_f64() * 100.0;
                phases
                    .iter()
                    .position(|p| p.until_percent.is_some_and(|until| percent < until))
                    .unwrap_or(phases.len().saturating_sub(1))
            }
            Self::Absolute { phases } => {
                let elapsed = elapsed.as_secs_f64();
                let mut boundary = 0.0;
                for (i, p) in phases.iter().enumerate() {
                    match p.duration_secs {
                        Some(duration) => {
                            boundary += duration;
                            if elapsed < boundary {
                                return i;
                            }
                        }
                        None => return i,
                    }
                }
                phases.len().saturating_sub(1)
            }
        }
    }
}

/// 默认阶段表 + 区域覆盖
#[derive(Debug, Clone, Default)]
pub struct PhaseBook {
    default_plan: PhasePlan,
    zone_plans: std::collections::HashMap<String, PhasePlan>,
}

impl PhaseBook {
    pub fn new(
        default_plan: PhasePlan,
        zone_plans: std::collections::HashMap<String, PhasePlan>,
    ) -> Self {
        Self {
            default_plan,
            zone_plans,
        }
    }

    pub fn plan_for(&self, zone_id: &str) -> &PhasePlan {
        self.zone_plans.get(zone_id).unwrap_or(&self.default_plan)
    }

    /// 运行时替换某区域的阶段表；非法表不生效
    pub fn set_zone_plan(&mut self, zone_id: impl Into<String>, plan: PhasePlan) -> Result<(), WatchError> {
        plan.validate()?;
        self.zone_plans.insert(zone_id.into(), plan);
        Ok(())
    }

    pub fn clear_zone_plan(&mut self, zone_id: &str) {
        self.zone_plans.remove(zone_id);
    }
}
