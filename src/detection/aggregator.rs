//! 区域聚合器：每区域一条 ZoneState，边沿触发
//!
//! - 开门标签且未告警 -> Open；关门标签且告警中 -> Close
//! - 同一批次内每个区域至多一次边沿，后续矛盾检测只更新标签
//! - 告警中的区域超过 state_timeout 无检测 -> Timeout，标签重置为 Unknown
//! - 静默超过 gc_factor × state_timeout 的区域被删除

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::detection::{
    AggregatorSettings, Detection, DoorLabel, FrameOutcome, TransitionKind, ZoneStateView,
    ZoneTransition,
};

#[derive(Debug, Clone)]
pub struct ZoneState {
    pub zone_id: String,
    /// 最近一次上报该区域的视频源
    pub source_id: String,
    pub last_label: DoorLabel,
    pub alert_active: bool,
    pub detection_count: u64,
    pub confidence_accumulator: f64,
    pub last_seen_at: Instant,
}

impl ZoneState {
    fn new(zone_id: String, source_id: &str, now: Instant) -> Self {
        Self {
            zone_id,
            source_id: source_id.to_string(),
            last_label: DoorLabel::Unknown,
            alert_active: false,
            detection_count: 0,
            confidence_accumulator: 0.0,
            last_seen_at: now,
        }
    }

    pub fn average_confidence(&self) -> f64 {
        self.confidence_accumulator / self.detection_count.max(1) as f64
    }

    fn transition(&self, kind: TransitionKind, confidence: f32) -> ZoneTransition {
        ZoneTransition {
            kind,
            zone_id: self.zone_id.clone(),
            source_id: self.source_id.clone(),
            confidence,
            average_confidence: self.average_confidence(),
        }
    }
}

#[derive(Debug)]
pub struct ZoneAggregator {
    settings: AggregatorSettings,
    zones: HashMap<String, ZoneState>,
}

impl ZoneAggregator {
    pub fn new(settings: AggregatorSettings) -> Self {
        Self {
            settings,
            zones: HashMap::new(),
        }
    }

    pub fn settings(&self) -> &AggregatorSettings {
        &self.settings
    }

    /// 处理一帧检测，返回边沿与本帧确认开门的区域
    pub fn process(&mut self, source_id: &str, detections: &[Detection], now: Instant) -> FrameOutcome {
        let mut outcome = FrameOutcome::default();
        let mut transitioned: HashSet<String> = HashSet::new();
        let mut seen: Vec<String> = Vec::new();

        for det in detections {
            // NaN 与任何阈值比较都为 false，需单独排除
            if !det.confidence.is_finite() || det.confidence < self.settings.min_confidence {
                continue;
            }
            let zone_id = det
                .zone_id
                .clone()
                .filter(|z| !z.is_empty())
                .unwrap_or_else(|| format!("{}_default", source_id));
            let label = self.settings.labels.classify(&det.label);

            let state = self
                .zones
                .entry(zone_id.clone())
                .or_insert_with(|| ZoneState::new(zone_id.clone(), source_id, now));
            state.source_id = source_id.to_string();
            state.last_label = label;
            state.last_seen_at = now;
            state.detection_count += 1;
            state.confidence_accumulator += det.confidence as f64;
            if !seen.contains(&zone_id) {
                seen.push(zone_id.clone());
            }

            if transitioned.contains(&zone_id) {
                continue;
            }
            let kind = match label {
                DoorLabel::Open if !state.alert_active => {
                    state.alert_active = true;
                    TransitionKind::Open
                }
                DoorLabel::Closed if state.alert_active => {
                    state.alert_active = false;
                    TransitionKind::Close
                }
                _ => continue,
            };
            tracing::info!(
                "Zone {} ({}): {:?} (confidence {:.2})",
                zone_id,
                source_id,
                kind,
                det.confidence
            );
            outcome.transitions.push(state.transition(kind, det.confidence));
            transitioned.insert(zone_id);
        }

        outcome.confirmed_open = seen
            .into_iter()
            .filter(|z| {
                self.zones
                    .get(z)
                    .is_some_and(|s| s.alert_active && s.last_label == DoorLabel::Open)
            })
            .collect();

        self.expire(Some(source_id), now, &mut outcome.transitions);
        outcome
    }

    /// 对所有视频源执行超时与回收（由 tick 驱动）
    pub fn sweep(&mut self, now: Instant) -> Vec<ZoneTransition> {
        let mut transitions = Vec::new();
        self.expire(None, now, &mut transitions);
        transitions
    }

    fn expire(&mut self, source_id: Option<&str>, now: Instant, out: &mut Vec<ZoneTransition>) {
        let timeout = self.settings.state_timeout();
        let gc_after = self.settings.gc_after();
        let in_scope = |state: &ZoneState| source_id.map_or(true, |s| state.source_id == s);

        for state in self.zones.values_mut().filter(|s| in_scope(s)) {
            let silent = now.saturating_duration_since(state.last_seen_at);
            if state.alert_active && silent > timeout {
                state.alert_active = false;
                state.last_label = DoorLabel::Unknown;
                tracing::info!(
                    "Zone {} timed out after {:.1}s without detections",
                    state.zone_id,
                    silent.as_secs_f64()
                );
                out.push(state.transition(TransitionKind::Timeout, 0.0));
            }
        }

        self.zones.retain(|zone_id, state| {
            let keep = !in_scope(state)
                || now.saturating_duration_since(state.last_seen_at) <= gc_after;
            if !keep {
                tracing::debug!("Zone {} purged after {:?} of silence", zone_id, gc_after);
            }
            keep
        });
    }

    pub fn is_alert_active(&self, zone_id: &str) -> bool {
        self.zones.get(zone_id).is_some_and(|s| s.alert_active)
    }

    pub fn zone(&self, zone_id: &str) -> Option<&ZoneState> {
        self.zones.get(zone_id)
    }

    pub fn zone_states(&self, now: Instant) -> Vec<ZoneStateView> {
        let mut views: Vec<ZoneStateView> = self
            .zones
            .values()
            .map(|s| ZoneStateView {
                zone_id: s.zone_id.clone(),
                source_id: s.source_id.clone(),
                label: s.last_label,
                alert_active: s.alert_active,
                detection_count: s.detection_count,
                average_confidence: s.average_confidence(),
                silent_for: now.saturating_duration_since(s.last_seen_at),
            })
            .collect();
        views.sort_by(|a, b| a.zone_id.cmp(&b.zone_id));
        views
    }

    /// 清除告警位但保留记录（孤儿计时器过期时使用），返回之前是否告警中
    pub fn force_clear(&mut self, zone_id: &str) -> bool {
        match self.zones.get_mut(zone_id) {
            Some(state) => {
                let was_active = state.alert_active;
                state.alert_active = false;
                state.last_label = DoorLabel::Unknown;
                was_active
            }
            None => false,
        }
    }

    pub fn reset_zone(&mut self, zone_id: &str) -> bool {
        let removed = self.zones.remove(zone_id).is_some();
        if removed {
            tracing::info!("Zone {} reset", zone_id);
        }
        removed
    }

    pub fn reset_all(&mut self) {
        tracing::info!("All {} zone states reset", self.zones.len());
        self.zones.clear();
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    /// 静默超过该时长的记录已被回收
    pub fn gc_after(&self) -> Duration {
        self.settings.gc_after()
    }
}
