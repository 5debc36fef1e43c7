//! 报警与通知：阶段表、音频输出、外部通知、每区域一个受监管的报警循环

pub mod manager;
pub mod notify;
pub mod phase;
pub mod sink;
pub mod snapshot;
pub mod volume;

pub use manager::{
    spawn_dispatcher, AlarmCommand, AlarmManager, AlarmRequest, AlarmSettings, AlarmStatus,
};
pub use notify::{
    Notification, Notifier, NoopNotifier, NotifySchedule, TelegramNotifier, TelegramSection,
};
pub use phase::{AlarmPhase, PercentPhase, PhaseBook, PhasePlan, TimedPhase, Urgency};
pub use sink::{AudioClip, AudioSink, CommandAudioSink, LogAudioSink, Tone};
pub use snapshot::{encode_jpeg, SnapshotStore};
pub use volume::VolumeSchedule;
