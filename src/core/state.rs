//! 状态投影：MonitorEvent 事件流与 MonitorSummary 概览
//!
//! 完整状态由 Monitor 在锁内维护；对外只广播事件与轻量概览。

use std::collections::BTreeMap;

use serde::Serialize;

use crate::detection::{TransitionKind, ZoneTransition};
use crate::eco::EcoState;
use crate::escalation::EscalationEvent;

/// Monitor 对外广播的事件
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEvent {
    /// 区域边沿（开门 / 关门 / 超时）
    Zone(ZoneTransition),
    /// 报警触发 / 清除 / 计时器过期
    Escalation(EscalationEvent),
    Acknowledged { zone_id: String },
    AlarmsStopped { zones: Vec<String> },
    EcoChanged {
        source_id: String,
        from: EcoState,
        to: EcoState,
    },
}

impl MonitorEvent {
    /// 事件类别（写入日志表的 kind 列）
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Zone(t) => match t.kind {
                TransitionKind::Open => "zone_open",
                TransitionKind::Close => "zone_close",
                TransitionKind::Timeout => "zone_timeout",
            },
            Self::Escalation(EscalationEvent::AlarmTriggered { .. }) => "alarm_triggered",
            Self::Escalation(EscalationEvent::AlarmCleared { .. }) => "alarm_cleared",
            Self::Escalation(EscalationEvent::TimerExpired { .. }) => "timer_expired",
            Self::Acknowledged { .. } => "acknowledged",
            Self::AlarmsStopped { .. } => "alarms_stopped",
            Self::EcoChanged { .. } => "eco_changed",
        }
    }

    pub fn zone_id(&self) -> Option<&str> {
        match self {
            Self::Zone(t) => Some(&t.zone_id),
            Self::Escalation(e) => Some(e.zone_id()),
            Self::Acknowledged { zone_id } => Some(zone_id),
            Self::AlarmsStopped { .. } | Self::EcoChanged { .. } => None,
        }
    }

    pub fn source_id(&self) -> Option<&str> {
        match self {
            Self::Zone(t) => Some(&t.source_id),
            Self::Escalation(EscalationEvent::AlarmTriggered { camera_id, .. })
            | Self::Escalation(EscalationEvent::TimerExpired { camera_id, .. }) => Some(camera_id),
            Self::Escalation(EscalationEvent::AlarmCleared { camera_id, .. }) => {
                camera_id.as_deref()
            }
            Self::EcoChanged { source_id, .. } => Some(source_id),
            Self::Acknowledged { .. } | Self::AlarmsStopped { .. } => None,
        }
    }
}

/// 每个 tick 发布一次的概览（watch 通道）
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MonitorSummary {
    pub tracked_zones: usize,
    pub open_zones: Vec<String>,
    pub active_timers: usize,
    pub alarming_zones: Vec<String>,
    pub eco: BTreeMap<String, EcoState>,
}
