//! 计时器表与宽限期判定
//!
//! 纯状态机：所有操作都显式接收 now，由调用方（Monitor）在同一把锁内驱动。

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::core::{RecoveryEngine, WatchError};
use crate::escalation::{
    ClearReason, EscalationEvent, EscalationSettings, GracePolicy, TimerSnapshot,
    DEFAULT_GRACE_SECS,
};

#[derive(Debug, Clone)]
pub struct DoorTimer {
    pub zone_id: String,
    pub camera_id: String,
    pub opened_at: Instant,
    pub last_confirmed_at: Instant,
    pub grace_period: Duration,
    pub alarm_triggered: bool,
    /// 确认报警后的静音截止时刻（ack_mute_secs 为 0 时不设置）
    pub muted_until: Option<Instant>,
}

impl DoorTimer {
    fn is_muted(&self, now: Instant) -> bool {
        self.muted_until.is_some_and(|until| now < until)
    }

    fn snapshot(&self, now: Instant) -> TimerSnapshot {
        let elapsed = now.saturating_duration_since(self.opened_at);
        let grace = self.grace_period.as_secs_f64().max(f64::EPSILON);
        TimerSnapshot {
            zone_id: self.zone_id.clone(),
            camera_id: self.camera_id.clone(),
            elapsed,
            remaining: self.grace_period.saturating_sub(elapsed),
            grace_period: self.grace_period,
            alarm_triggered: self.alarm_triggered,
            progress_percent: (elapsed.as_secs_f64() / grace * 100.0).min(100.0),
        }
    }
}

#[derive(Debug)]
pub struct EscalationEngine {
    policy: GracePolicy,
    orphan_multiplier: u32,
    ack_mute: Duration,
    timers: HashMap<String, DoorTimer>,
    recovery: RecoveryEngine,
}

impl EscalationEngine {
    pub fn new(settings: &EscalationSettings) -> Self {
        Self {
            policy: settings.grace.clone(),
            orphan_multiplier: settings.orphan_multiplier.max(1),
            ack_mute: settings.ack_mute(),
            timers: HashMap::new(),
            recovery: RecoveryEngine::new(),
        }
    }

    fn grace_for(&self, zone_id: &str, camera_id: &str) -> Duration {
        match self.policy.resolve(zone_id, camera_id) {
            Some(grace) => grace,
            None => {
                self.recovery
                    .handle(&WatchError::MissingGrace(zone_id.to_string()));
                Duration::from_secs_f64(DEFAULT_GRACE_SECS)
            }
        }
    }

    /// 区域开门：创建计时器；已存在时保留最早的并刷新，返回是否新建
    pub fn on_open(&mut self, zone_id: &str, camera_id: &str, now: Instant) -> bool {
        if let Some(timer) = self.timers.get_mut(zone_id) {
            self.recovery
                .handle(&WatchError::DuplicateTimer(zone_id.to_string()));
            timer.last_confirmed_at = now;
            return false;
        }
        let grace_period = self.grace_for(zone_id, camera_id);
        tracing::info!(
            "Timer started for zone {} (camera {}, grace {:.1}s)",
            zone_id,
            camera_id,
            grace_period.as_secs_f64()
        );
        self.timers.insert(
            zone_id.to_string(),
            DoorTimer {
                zone_id: zone_id.to_string(),
                camera_id: camera_id.to_string(),
                opened_at: now,
                last_confirmed_at: now,
                grace_period,
                alarm_triggered: false,
                muted_until: None,
            },
        );
        true
    }

    /// 刷新 last_confirmed_at，不影响宽限期起点
    pub fn confirm(&mut self, zone_id: &str, now: Instant) -> bool {
        match self.timers.get_mut(zone_id) {
            Some(timer) => {
                timer.last_confirmed_at = now;
                true
            }
            None => false,
        }
    }

    pub fn tick(&mut self, now: Instant) -> Vec<EscalationEvent> {
        let mut events = Vec::new();
        let mut orphaned = Vec::new();

        for timer in self.timers.values_mut() {
            let silent = now.saturating_duration_since(timer.last_confirmed_at);
            let orphan_after = timer
                .grace_period
                .checked_mul(self.orphan_multiplier)
                .unwrap_or(Duration::MAX);
            if silent > orphan_after {
                orphaned.push((timer.zone_id.clone(), silent));
                continue;
            }
            let elapsed = now.saturating_duration_since(timer.opened_at);
            if !timer.alarm_triggered && elapsed >= timer.grace_period && !timer.is_muted(now) {
                timer.alarm_triggered = true;
                tracing::warn!(
                    "Grace period elapsed for zone {} after {:.1}s, triggering alarm",
                    timer.zone_id,
                    elapsed.as_secs_f64()
                );
                events.push(EscalationEvent::AlarmTriggered {
                    zone_id: timer.zone_id.clone(),
                    camera_id: timer.camera_id.clone(),
                    elapsed,
                    grace_period: timer.grace_period,
                });
            }
        }

        for (zone_id, silent) in orphaned {
            self.recovery.handle(&WatchError::OrphanedTimer {
                zone_id: zone_id.clone(),
                silent,
            });
            if let Some(timer) = self.timers.remove(&zone_id) {
                events.push(EscalationEvent::TimerExpired {
                    zone_id,
                    camera_id: timer.camera_id,
                    silent,
                });
            }
        }
        events
    }

    /// 销毁计时器；无论计时器是否存在都返回 AlarmCleared
    pub fn on_clear(&mut self, zone_id: &str, reason: ClearReason) -> EscalationEvent {
        let removed = self.timers.remove(zone_id);
        if let Some(timer) = &removed {
            tracing::info!(
                "Timer cleared for zone {} ({:?}, alarm was {})",
                zone_id,
                reason,
                if timer.alarm_triggered { "on" } else { "off" }
            );
        }
        EscalationEvent::AlarmCleared {
            zone_id: zone_id.to_string(),
            camera_id: removed.as_ref().map(|t| t.camera_id.clone()),
            reason,
            was_alarming: removed.is_some_and(|t| t.alarm_triggered),
        }
    }

    /// 清理全部计时器（ClearPolicy::All）
    pub fn clear_all(&mut self, reason: ClearReason) -> Vec<EscalationEvent> {
        let mut zones: Vec<String> = self.timers.keys().cloned().collect();
        zones.sort();
        zones
            .into_iter()
            .map(|zone_id| self.on_clear(&zone_id, reason))
            .collect()
    }

    /// 确认报警：保留计时器，宽限期继续从开门时刻计算；
    /// 门仍开着时下一个 tick 会再次触发（配置了 ack_mute_secs 时先静音）
    pub fn acknowledge(&mut self, zone_id: &str, now: Instant) -> bool {
        let muted_until = self.mute_deadline(now);
        match self.timers.get_mut(zone_id) {
            Some(timer) => {
                timer.alarm_triggered = false;
                timer.muted_until = muted_until;
                tracing::info!("Alarm acknowledged for zone {}", zone_id);
                true
            }
            None => false,
        }
    }

    /// 确认全部计时器，返回此前处于报警状态的区域
    pub fn stop_all(&mut self, now: Instant) -> Vec<String> {
        let mut alarming: Vec<String> = self
            .timers
            .values()
            .filter(|t| t.alarm_triggered)
            .map(|t| t.zone_id.clone())
            .collect();
        alarming.sort();
        let muted_until = self.mute_deadline(now);
        for timer in self.timers.values_mut() {
            timer.alarm_triggered = false;
            timer.muted_until = muted_until;
        }
        tracing::info!("All alarms acknowledged ({} were active)", alarming.len());
        alarming
    }

    fn mute_deadline(&self, now: Instant) -> Option<Instant> {
        if self.ack_mute.is_zero() {
            return None;
        }
        now.checked_add(self.ack_mute)
    }

    /// 运行时修改区域宽限期；已有计时器立即采用新值
    pub fn update_grace(&mut self, zone_id: &str, grace: Duration) {
        self.policy.set_zone(zone_id, grace);
        if let Some(timer) = self.timers.get_mut(zone_id) {
            timer.grace_period = grace;
        }
        tracing::info!("Grace period for zone {} set to {:?}", zone_id, grace);
    }

    pub fn snapshots(&self, now: Instant) -> Vec<TimerSnapshot> {
        let mut snapshots: Vec<TimerSnapshot> =
            self.timers.values().map(|t| t.snapshot(now)).collect();
        snapshots.sort_by(|a, b| a.zone_id.cmp(&b.zone_id));
        snapshots
    }

    /// 该视频源是否还有未解决的区域
    pub fn active_for_source(&self, camera_id: &str) -> bool {
        self.timers.values().any(|t| t.camera_id == camera_id)
    }

    pub fn alarming_zones(&self) -> Vec<String> {
        let mut zones: Vec<String> = self
            .timers
            .values()
            .filter(|t| t.alarm_triggered)
            .map(|t| t.zone_id.clone())
            .collect();
        zones.sort();
        zones
    }

    pub fn timer(&self, zone_id: &str) -> Option<&DoorTimer> {
        self.timers.get(zone_id)
    }

    pub fn has_timer(&self, zone_id: &str) -> bool {
        self.timers.contains_key(zone_id)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_millis(500);

    fn engine_with_grace(zone_id: &str, secs: f64) -> EscalationEngine {
        let mut settings = EscalationSettings::default();
        settings.grace.zones.insert(zone_id.to_string(), secs);
        EscalationEngine::new(&settings)
    }

    /// 按 tick 间隔推进，直到出现 AlarmTriggered，返回触发时刻
    fn run_until_trigger(engine: &mut EscalationEngine, start: Instant, limit: Duration) -> Option<Instant> {
        let mut now = start;
        while now <= start + limit {
            let triggered = engine
                .tick(now)
                .iter()
                .any(|e| matches!(e, EscalationEvent::AlarmTriggered { .. }));
            if triggered {
                return Some(now);
            }
            now += TICK;
        }
        None
    }

    #[test]
    fn test_trigger_at_grace_within_one_tick() {
        let mut engine = engine_with_grace("door_1", 10.0);
        let t0 = Instant::now();
        assert!(engine.on_open("door_1", "cam1", t0));

        let fired = run_until_trigger(&mut engine, t0, Duration::from_secs(20)).unwrap();
        let elapsed = fired - t0;
        assert!(elapsed >= Duration::from_secs(10));
        assert!(elapsed <= Duration::from_secs(10) + TICK);
    }

    #[test]
    fn test_trigger_is_edge_not_level() {
        let mut engine = engine_with_grace("door_1", 1.0);
        let t0 = Instant::now();
        engine.on_open("door_1", "cam1", t0);
        assert_eq!(engine.tick(t0 + Duration::from_secs(2)).len(), 1);
        assert!(engine.tick(t0 + Duration::from_secs(3)).is_empty());
        assert_eq!(engine.alarming_zones(), vec!["door_1".to_string()]);
    }

    #[test]
    fn test_confirm_does_not_reset_grace() {
        let mut engine = engine_with_grace("door_1", 10.0);
        let t0 = Instant::now();
        engine.on_open("door_1", "cam1", t0);
        for s in 1..10 {
            assert!(engine.confirm("door_1", t0 + Duration::from_secs(s)));
        }
        let events = engine.tick(t0 + Duration::from_secs(10));
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_duplicate_open_keeps_earliest() {
        let mut engine = engine_with_grace("door_1", 10.0);
        let t0 = Instant::now();
        engine.on_open("door_1", "cam1", t0);
        assert!(!engine.on_open("door_1", "cam1", t0 + Duration::from_secs(5)));
        assert_eq!(engine.len(), 1);
        let timer = engine.timer("door_1").unwrap();
        assert_eq!(timer.opened_at, t0);
        assert_eq!(timer.last_confirmed_at, t0 + Duration::from_secs(5));
    }

    #[test]
    fn test_clear_always_emits() {
        let mut engine = engine_with_grace("door_1", 1.0);
        let t0 = Instant::now();
        engine.on_open("door_1", "cam1", t0);
        engine.tick(t0 + Duration::from_secs(2));

        let event = engine.on_clear("door_1", ClearReason::Closed);
        assert_eq!(
            event,
            EscalationEvent::AlarmCleared {
                zone_id: "door_1".to_string(),
                camera_id: Some("cam1".to_string()),
                reason: ClearReason::Closed,
                was_alarming: true,
            }
        );
        assert!(!engine.has_timer("door_1"));

        let event = engine.on_clear("door_1", ClearReason::Timeout);
        assert!(matches!(
            event,
            EscalationEvent::AlarmCleared { was_alarming: false, camera_id: None, .. }
        ));
    }

    #[test]
    fn test_orphan_timer_force_expired() {
        let mut settings = EscalationSettings::default();
        settings.grace.default = 1.0;
        settings.orphan_multiplier = 3;
        let mut engine = EscalationEngine::new(&settings);
        let t0 = Instant::now();
        engine.on_open("door_1", "cam1", t0);
        engine.tick(t0 + Duration::from_secs(1));

        let events = engine.tick(t0 + Duration::from_secs(4));
        assert!(matches!(
            events.as_slice(),
            [EscalationEvent::TimerExpired { zone_id, .. }] if zone_id == "door_1"
        ));
        assert!(engine.is_empty());
    }

    #[test]
    fn test_acknowledge_keeps_grace_running() {
        let mut engine = engine_with_grace("door_1", 10.0);
        let t0 = Instant::now();
        engine.on_open("door_1", "cam1", t0);
        engine.tick(t0 + Duration::from_secs(10));

        let ack = t0 + Duration::from_secs(12);
        assert!(engine.acknowledge("door_1", ack));
        assert!(engine.alarming_zones().is_empty());

        let snapshot = &engine.snapshots(ack)[0];
        assert_eq!(snapshot.elapsed, Duration::from_secs(12));
        assert_eq!(snapshot.remaining, Duration::ZERO);
        assert!((snapshot.progress_percent - 100.0).abs() < 1e-6);

        // 门仍开着：下一个 tick 再次触发
        let events = engine.tick(ack + TICK);
        assert!(matches!(
            events.as_slice(),
            [EscalationEvent::AlarmTriggered { elapsed, .. }] if *elapsed == Duration::from_millis(12_500)
        ));
        assert!(!engine.acknowledge("missing", ack));
    }

    #[test]
    fn test_acknowledge_mute_window_when_configured() {
        let mut settings = EscalationSettings::default();
        settings.grace.zones.insert("door_1".to_string(), 10.0);
        settings.ack_mute_secs = 5.0;
        let mut engine = EscalationEngine::new(&settings);
        let t0 = Instant::now();
        engine.on_open("door_1", "cam1", t0);
        engine.tick(t0 + Duration::from_secs(10));

        let ack = t0 + Duration::from_secs(12);
        engine.acknowledge("door_1", ack);
        assert!(engine.tick(ack + Duration::from_secs(4)).is_empty());
        assert_eq!(engine.tick(ack + Duration::from_secs(5)).len(), 1);
        assert_eq!(
            engine.snapshots(ack + Duration::from_secs(5))[0].elapsed,
            Duration::from_secs(17)
        );
    }

    #[test]
    fn test_huge_grace_does_not_overflow_orphan_check() {
        let mut engine = engine_with_grace("door_1", 1.0);
        let t0 = Instant::now();
        engine.on_open("door_1", "cam1", t0);
        engine.update_grace("door_1", Duration::MAX / 2);
        assert!(engine.tick(t0 + Duration::from_secs(3600)).is_empty());
        assert!(engine.has_timer("door_1"));
    }

    #[test]
    fn test_stop_all_returns_alarming_zones() {
        let mut settings = EscalationSettings::default();
        settings.grace.default = 1.0;
        settings.grace.zones.insert("door_3".to_string(), 100.0);
        let mut engine = EscalationEngine::new(&settings);
        let t0 = Instant::now();
        for zone in ["door_1", "door_2", "door_3"] {
            engine.on_open(zone, "cam1", t0);
        }
        engine.tick(t0 + Duration::from_secs(2));
        let stopped = engine.stop_all(t0 + Duration::from_secs(2));
        assert_eq!(stopped, vec!["door_1".to_string(), "door_2".to_string()]);
        assert!(engine.alarming_zones().is_empty());
        assert_eq!(engine.len(), 3);

        // 没有静音窗口：仍开着的区域在下一个 tick 重新触发
        assert_eq!(engine.tick(t0 + Duration::from_millis(2500)).len(), 2);
    }

    #[test]
    fn test_update_grace_applies_to_live_timer() {
        let mut engine = engine_with_grace("door_1", 60.0);
        let t0 = Instant::now();
        engine.on_open("door_1", "cam1", t0);
        engine.update_grace("door_1", Duration::from_secs(5));
        assert_eq!(engine.tick(t0 + Duration::from_secs(5)).len(), 1);

        engine.on_clear("door_1", ClearReason::Closed);
        engine.on_open("door_1", "cam1", t0);
        assert_eq!(engine.timer("door_1").unwrap().grace_period, Duration::from_secs(5));
    }

    #[test]
    fn test_snapshots_and_source_activity() {
        let mut engine = engine_with_grace("door_1", 10.0);
        let t0 = Instant::now();
        engine.on_open("door_1", "cam1", t0);

        let snapshot = &engine.snapshots(t0 + Duration::from_secs(4))[0];
        assert_eq!(snapshot.remaining, Duration::from_secs(6));
        assert!((snapshot.progress_percent - 40.0).abs() < 1e-6);
        assert!(engine.active_for_source("cam1"));
        assert!(!engine.active_for_source("cam2"));

        let clear_all = engine.clear_all(ClearReason::Reset);
        assert_eq!(clear_all.len(), 1);
        assert!(!engine.active_for_source("cam1"));
    }
}
