//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `DOORWATCH__*` 覆盖（双下划线表示嵌套，如 `DOORWATCH__ESCALATION__GRACE__DEFAULT=45`）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::alarm::{AlarmSettings, NotifySchedule, PhaseBook, PhasePlan, TelegramSection, VolumeSchedule};
use crate::core::{RecoveryEngine, WatchError};
use crate::detection::AggregatorSettings;
use crate::eco::EcoSettings;
use crate::escalation::{EscalationSettings, GracePolicy};

/// 秒数转 Duration；负数视为 0，非有限或溢出时返回 fallback
pub fn duration_from_secs(secs: f64, fallback: Duration) -> Duration {
    if secs.is_nan() {
        return fallback;
    }
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(fallback)
}

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub detection: AggregatorSettings,
    pub escalation: EscalationSettings,
    pub alarm: AlarmSection,
    pub notify: NotifySection,
    pub eco: EcoSettings,
    pub journal: JournalSection,
}

/// [app] 段：tick 周期与事件广播容量
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    pub tick_interval_ms: u64,
    /// MonitorEvent 广播通道容量
    pub event_buffer: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            tick_interval_ms: 500,
            event_buffer: 256,
        }
    }
}

impl AppSection {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

/// [alarm] 段：阶段表、音量时段、素材目录与播放器
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlarmSection {
    pub enabled: bool,
    pub sounds_dir: PathBuf,
    pub default_plan: PhasePlan,
    /// 区域 -> 覆盖阶段表
    pub zone_plans: HashMap<String, PhasePlan>,
    pub volume: VolumeSchedule,
    pub stop_timeout_ms: u64,
    pub continuous_yield_ms: u64,
    pub announcements: bool,
    pub player: PlayerSection,
}

impl Default for AlarmSection {
    fn default() -> Self {
        Self {
            enabled: true,
            sounds_dir: PathBuf::from("sounds"),
            default_plan: PhasePlan::default(),
            zone_plans: HashMap::new(),
            volume: VolumeSchedule::default(),
            stop_timeout_ms: 1000,
            continuous_yield_ms: 500,
            announcements: true,
            player: PlayerSection::default(),
        }
    }
}

/// 音频输出后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerBackend {
    /// 只写日志
    Log,
    /// 调用外部播放器命令
    Command,
}

/// [alarm.player] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlayerSection {
    pub backend: PlayerBackend,
    /// 播放素材的命令，文件路径追加在末尾；支持 {volume} / {volume_pct}
    pub asset_command: Vec<String>,
    /// 播放合成音的命令，从标准输入读 S16_LE 单声道 PCM
    pub tone_command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for PlayerSection {
    fn default() -> Self {
        Self {
            backend: PlayerBackend::Log,
            asset_command: vec![
                "mpv".into(),
                "--no-video".into(),
                "--really-quiet".into(),
                "--volume={volume_pct}".into(),
            ],
            tone_command: vec![
                "aplay".into(),
                "-q".into(),
                "-f".into(),
                "S16_LE".into(),
                "-r".into(),
                "22050".into(),
                "-c".into(),
                "1".into(),
            ],
            timeout_secs: 15,
        }
    }
}

/// [notify] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifySection {
    pub enabled: bool,
    pub telegram: TelegramSection,
    pub schedule: NotifySchedule,
}

impl Default for NotifySection {
    fn default() -> Self {
        Self {
            enabled: true,
            telegram: TelegramSection::default(),
            schedule: NotifySchedule::default(),
        }
    }
}

/// [journal] 段：未设置 path 时不记录
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct JournalSection {
    pub path: Option<PathBuf>,
}

impl AppConfig {
    /// 校验阶段表、节能参数与检测参数，返回第一个错误
    pub fn validate(&self) -> Result<(), WatchError> {
        self.alarm.default_plan.validate()?;
        for (zone_id, plan) in &self.alarm.zone_plans {
            plan.validate()
                .map_err(|e| WatchError::InvalidPhasePlan(format!("zone {}: {}", zone_id, e)))?;
        }
        self.eco.validate()?;
        self.detection.validate()?;
        self.escalation.validate()?;
        Ok(())
    }

    /// 把非法片段替换为默认值，保证管线可以启动
    pub fn sanitize(&mut self) {
        let recovery = RecoveryEngine::new();
        if let Err(e) = self.alarm.default_plan.validate() {
            recovery.handle(&e);
            self.alarm.default_plan = PhasePlan::default();
        }
        self.alarm.zone_plans.retain(|zone_id, plan| match plan.validate() {
            Ok(()) => true,
            Err(e) => {
                recovery.handle(&WatchError::InvalidPhasePlan(format!("zone {}: {}", zone_id, e)));
                false
            }
        });
        if let Err(e) = self.eco.validate() {
            recovery.handle(&e);
            self.eco = EcoSettings::default();
        }
        if let Err(e) = self.detection.validate() {
            recovery.handle(&e);
            self.detection = AggregatorSettings::default();
        }
        if let Err(e) = self.escalation.grace.validate() {
            recovery.handle(&e);
            self.escalation.grace = GracePolicy::default();
        }
        if let Err(e) = self.escalation.validate() {
            recovery.handle(&e);
            self.escalation.ack_mute_secs = 0.0;
        }
    }

    pub fn phase_book(&self) -> PhaseBook {
        PhaseBook::new(self.alarm.default_plan.clone(), self.alarm.zone_plans.clone())
    }

    pub fn alarm_settings(&self) -> AlarmSettings {
        AlarmSettings {
            enabled: self.alarm.enabled,
            sounds_dir: self.alarm.sounds_dir.clone(),
            volume: self.alarm.volume.clone(),
            stop_timeout: Duration::from_millis(self.alarm.stop_timeout_ms.max(1)),
            continuous_yield: Duration::from_millis(self.alarm.continuous_yield_ms.max(10)),
            announcements: self.alarm.announcements,
            notify_enabled: self.notify.enabled,
            schedule: self.notify.schedule.clone(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 DOORWATCH__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 DOORWATCH__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!("Config file {} not found, ignoring", path.display());
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("DOORWATCH")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
