//! Monitor：管线的唯一同步边界
//!
//! 负责：在一把锁内持有区域表与计时器表，驱动共享 tick，把报警命令交给顺序调度任务，
//! 维护每个视频源的节能状态机，并通过 broadcast（事件）与 watch（概览）两个通道对外发布。
//!
//! 报警命令在持锁期间入队，调度任务看到的顺序与计时器表的变更顺序一致；
//! 事件在释放锁后再写日志与广播。

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use image::imageops::FilterType;
use image::DynamicImage;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::alarm::{
    encode_jpeg, spawn_dispatcher, AlarmCommand, AlarmManager, AlarmRequest, AlarmStatus,
    AudioSink, Notifier, PhasePlan, SnapshotStore,
};
use crate::config::AppConfig;
use crate::core::{MonitorEvent, MonitorSummary, RecoveryEngine, WatchError};
use crate::detection::{
    Detection, FrameOutcome, TransitionKind, ZoneAggregator, ZoneStateView, ZoneTransition,
};
use crate::eco::{EcoProfile, EcoScheduler, EcoSettings, EcoState, EcoStatus, MotionReading};
use crate::escalation::{
    ClearPolicy, ClearReason, EscalationEngine, EscalationEvent, TimerSnapshot, MAX_GRACE_SECS,
};
use crate::journal::{EventJournal, JournalEntry};

/// 监控时钟：走 tokio 时钟，暂停时钟的测试可以驱动整条管线
pub fn monotonic_now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// 锁内状态：聚合器与计时器表必须一起变更
struct Tables {
    aggregator: ZoneAggregator,
    engine: EscalationEngine,
}

/// 一次锁内操作产生的副作用：commands 在锁内发出，events 在锁外发布
#[derive(Default)]
struct Effects {
    commands: Vec<AlarmCommand>,
    events: Vec<MonitorEvent>,
}

impl Effects {
    fn events(events: Vec<MonitorEvent>) -> Self {
        Self {
            commands: Vec::new(),
            events,
        }
    }
}

pub struct Monitor {
    tables: Mutex<Tables>,
    eco: RwLock<HashMap<String, Arc<Mutex<EcoScheduler>>>>,
    eco_settings: EcoSettings,
    clear_policy: ClearPolicy,
    tick_interval: Duration,
    alarms: Arc<AlarmManager>,
    commands: mpsc::UnboundedSender<AlarmCommand>,
    events: broadcast::Sender<MonitorEvent>,
    summary: watch::Sender<MonitorSummary>,
    snapshots: Arc<SnapshotStore>,
    journal: Option<Arc<EventJournal>>,
    recovery: RecoveryEngine,
    token: CancellationToken,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Monitor {
    /// 构建并启动 tick 与报警调度任务；需在 tokio 运行时内调用
    pub fn start(
        cfg: &AppConfig,
        audio: Arc<dyn AudioSink>,
        notifier: Arc<dyn Notifier>,
        journal: Option<Arc<EventJournal>>,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let token = parent.child_token();
        let snapshots = Arc::new(SnapshotStore::new());
        let alarms = Arc::new(AlarmManager::new(
            audio,
            notifier,
            cfg.alarm_settings(),
            cfg.phase_book(),
            Arc::clone(&snapshots),
            token.child_token(),
        ));
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(cfg.app.event_buffer.max(16));
        let (summary, _) = watch::channel(MonitorSummary::default());

        let monitor = Arc::new(Self {
            tables: Mutex::new(Tables {
                aggregator: ZoneAggregator::new(cfg.detection.clone()),
                engine: EscalationEngine::new(&cfg.escalation),
            }),
            eco: RwLock::new(HashMap::new()),
            eco_settings: cfg.eco.clone(),
            clear_policy: cfg.escalation.clear_policy,
            tick_interval: cfg.app.tick_interval(),
            alarms: Arc::clone(&alarms),
            commands,
            events,
            summary,
            snapshots,
            journal,
            recovery: RecoveryEngine::new(),
            token: token.clone(),
            tasks: tokio::sync::Mutex::new(Vec::new()),
        });

        let dispatcher = spawn_dispatcher(alarms, commands_rx, token.clone());
        let ticker = tokio::spawn(Self::run_ticker(Arc::clone(&monitor)));
        if let Ok(mut tasks) = monitor.tasks.try_lock() {
            tasks.push(dispatcher);
            tasks.push(ticker);
        }
        tracing::info!(
            "Monitor started (tick {:?}, clear policy {:?})",
            monitor.tick_interval,
            monitor.clear_policy
        );
        monitor
    }

    async fn run_ticker(monitor: Arc<Self>) {
        let mut interval = tokio::time::interval(monitor.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = monitor.token.cancelled() => break,
                _ = interval.tick() => {
                    monitor.tick_at(monotonic_now());
                }
            }
        }
        tracing::debug!("Monitor ticker exited");
    }

    fn lock_tables(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 处理一帧检测结果
    pub fn process_frame(&self, source_id: &str, detections: &[Detection]) -> FrameOutcome {
        let now = monotonic_now();
        let mut effects = Effects::default();
        let (outcome, zone_active) = {
            let mut tables = self.lock_tables();
            let outcome = tables.aggregator.process(source_id, detections, now);
            for transition in &outcome.transitions {
                self.apply_transition(&mut tables, transition, now, &mut effects);
            }
            for zone_id in &outcome.confirmed_open {
                tables.engine.confirm(zone_id, now);
            }
            self.commit(&tables, &mut effects);
            let zone_active = tables.engine.active_for_source(source_id);
            (outcome, zone_active)
        };

        let scheduler = self.eco_for(source_id, now);
        let (from, to) = {
            let mut eco = scheduler.lock().unwrap_or_else(|e| e.into_inner());
            let from = eco.state();
            if !outcome.confirmed_open.is_empty() {
                eco.confirm_open(now);
            }
            (from, eco.update(now, zone_active))
        };
        if from != to {
            effects.events.push(MonitorEvent::EcoChanged {
                source_id: source_id.to_string(),
                from,
                to,
            });
        }

        self.flush(effects);
        outcome
    }

    /// 区域边沿 -> 计时器变更；调用方持有表锁
    fn apply_transition(
        &self,
        tables: &mut Tables,
        transition: &ZoneTransition,
        now: Instant,
        effects: &mut Effects,
    ) {
        effects.events.push(MonitorEvent::Zone(transition.clone()));
        match transition.kind {
            TransitionKind::Open => {
                tables
                    .engine
                    .on_open(&transition.zone_id, &transition.source_id, now);
            }
            TransitionKind::Close | TransitionKind::Timeout => {
                let reason = if transition.kind == TransitionKind::Close {
                    ClearReason::Closed
                } else {
                    ClearReason::Timeout
                };
                match self.clear_policy {
                    ClearPolicy::Zone => {
                        let event = tables.engine.on_clear(&transition.zone_id, reason);
                        effects.events.push(MonitorEvent::Escalation(event));
                        effects
                            .commands
                            .push(AlarmCommand::Stop(transition.zone_id.clone()));
                    }
                    ClearPolicy::All => {
                        let cleared = tables.engine.clear_all(reason);
                        for event in &cleared {
                            // 其它区域若仍开着，下一帧会重新产生开门边沿
                            tables.aggregator.force_clear(event.zone_id());
                        }
                        if cleared.is_empty() {
                            effects.events.push(MonitorEvent::Escalation(
                                tables.engine.on_clear(&transition.zone_id, reason),
                            ));
                        }
                        effects
                            .events
                            .extend(cleared.into_iter().map(MonitorEvent::Escalation));
                        effects.commands.push(AlarmCommand::StopAll);
                    }
                }
            }
        }
    }

    /// 共享 tick：区域超时、宽限期判定、孤儿计时器回收、节能降级
    pub fn tick_at(&self, now: Instant) {
        let mut effects = Effects::default();
        let summary;
        {
            let mut tables = self.lock_tables();
            for transition in tables.aggregator.sweep(now) {
                self.apply_transition(&mut tables, &transition, now, &mut effects);
            }
            for event in tables.engine.tick(now) {
                match &event {
                    EscalationEvent::AlarmTriggered {
                        zone_id,
                        camera_id,
                        grace_period,
                        ..
                    } => {
                        effects.commands.push(AlarmCommand::Start(AlarmRequest {
                            zone_id: zone_id.clone(),
                            zone_label: zone_id.clone(),
                            camera_id: camera_id.clone(),
                            grace_period: *grace_period,
                        }));
                    }
                    EscalationEvent::TimerExpired { zone_id, .. } => {
                        if tables.aggregator.force_clear(zone_id) {
                            self.recovery
                                .handle(&WatchError::StaleZone(zone_id.clone()));
                        }
                        effects.commands.push(AlarmCommand::Stop(zone_id.clone()));
                    }
                    EscalationEvent::AlarmCleared { .. } => {}
                }
                effects.events.push(MonitorEvent::Escalation(event));
            }
            summary = MonitorSummary {
                tracked_zones: tables.aggregator.len(),
                open_zones: tables
                    .aggregator
                    .zone_states(now)
                    .into_iter()
                    .filter(|z| z.alert_active)
                    .map(|z| z.zone_id)
                    .collect(),
                active_timers: tables.engine.len(),
                alarming_zones: tables.engine.alarming_zones(),
                eco: BTreeMap::new(),
            };
            self.commit(&tables, &mut effects);
        }

        let mut summary = summary;
        for (source_id, scheduler) in self.eco_schedulers() {
            let zone_active = self.lock_tables().engine.active_for_source(&source_id);
            let mut eco = scheduler.lock().unwrap_or_else(|e| e.into_inner());
            let from = eco.state();
            let to = eco.update(now, zone_active);
            if from != to {
                effects.events.push(MonitorEvent::EcoChanged {
                    source_id: source_id.clone(),
                    from,
                    to,
                });
            }
            summary.eco.insert(source_id, to);
        }
        self.summary.send_replace(summary);
        self.flush(effects);
    }

    /// 持锁调用：按产生顺序发出报警命令，并丢弃已无计时器的视频源快照
    fn commit(&self, tables: &Tables, effects: &mut Effects) {
        for command in effects.commands.drain(..) {
            if self.commands.send(command).is_err() {
                tracing::debug!("Alarm dispatcher closed, command dropped");
            }
        }
        self.snapshots
            .retain(|source_id| tables.engine.active_for_source(source_id));
    }

    /// 锁外调用：写事件日志并广播
    fn flush(&self, effects: Effects) {
        debug_assert!(effects.commands.is_empty(), "commands must be committed under the lock");
        for event in effects.events {
            if let Some(journal) = &self.journal {
                let mut entry = JournalEntry::new(
                    event.kind(),
                    serde_json::to_value(&event).unwrap_or(serde_json::Value::Null),
                );
                entry.zone_id = event.zone_id().map(str::to_string);
                entry.source_id = event.source_id().map(str::to_string);
                if let Err(e) = journal.record(entry) {
                    self.recovery.handle(&WatchError::Journal(e.to_string()));
                }
            }
            // 没有订阅者时 send 返回 Err，忽略
            let _ = self.events.send(event);
        }
    }

    fn eco_schedulers(&self) -> Vec<(String, Arc<Mutex<EcoScheduler>>)> {
        let eco = self.eco.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<_> = eco
            .iter()
            .map(|(id, s)| (id.clone(), Arc::clone(s)))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    fn eco_for(&self, source_id: &str, now: Instant) -> Arc<Mutex<EcoScheduler>> {
        if let Some(existing) = self
            .eco
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(source_id)
        {
            return Arc::clone(existing);
        }
        let mut eco = self.eco.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(eco.entry(source_id.to_string()).or_insert_with(|| {
            tracing::info!("Eco scheduler created for source {}", source_id);
            Arc::new(Mutex::new(EcoScheduler::new(
                source_id,
                self.eco_settings.clone(),
                now,
            )))
        }))
    }

    /// 帧级运动估计；该源有未解决区域时顺便保存快照供通知附图
    pub fn observe_frame(&self, source_id: &str, frame: &DynamicImage) -> MotionReading {
        let now = monotonic_now();
        let scheduler = self.eco_for(source_id, now);
        let (reading, from, to, profile) = {
            let mut eco = scheduler.lock().unwrap_or_else(|e| e.into_inner());
            let from = eco.state();
            let reading = eco.observe_frame(frame, now);
            (reading, from, eco.state(), eco.profile().clone())
        };

        if self.lock_tables().engine.active_for_source(source_id) {
            let (width, height) = profile.scale_dimensions(frame.width(), frame.height());
            let scaled;
            let frame = if (width, height) != (frame.width(), frame.height()) {
                scaled = frame.resize_exact(width, height, FilterType::Triangle);
                &scaled
            } else {
                frame
            };
            if let Some(jpeg) = encode_jpeg(frame, profile.encode_quality) {
                // 编码期间计时器可能已被清除
                let tables = self.lock_tables();
                if tables.engine.active_for_source(source_id) {
                    self.snapshots.store(source_id, jpeg);
                }
            }
        }

        if from != to {
            self.flush(Effects::events(vec![MonitorEvent::EcoChanged {
                source_id: source_id.to_string(),
                from,
                to,
            }]));
        }
        reading
    }

    /// 外部运动信号（已有运动检测的采集端使用）
    pub fn observe_motion(&self, source_id: &str, motion: bool) -> EcoState {
        let now = monotonic_now();
        let scheduler = self.eco_for(source_id, now);
        let (from, to) = {
            let mut eco = scheduler.lock().unwrap_or_else(|e| e.into_inner());
            let from = eco.state();
            eco.observe_motion(motion, now);
            (from, eco.state())
        };
        if from != to {
            self.flush(Effects::events(vec![MonitorEvent::EcoChanged {
                source_id: source_id.to_string(),
                from,
                to,
            }]));
        }
        to
    }

    pub fn get_active_timers(&self) -> Vec<TimerSnapshot> {
        self.lock_tables().engine.snapshots(monotonic_now())
    }

    pub fn get_zone_states(&self) -> Vec<ZoneStateView> {
        self.lock_tables().aggregator.zone_states(monotonic_now())
    }

    /// 确认报警：停止该区域的报警循环，计时器保留。
    /// 宽限期仍从开门起算，门还开着时下一个 tick 会再次触发（除非配置了 ack_mute_secs）
    pub fn acknowledge(&self, zone_id: &str) -> bool {
        let mut effects = Effects::default();
        {
            let mut tables = self.lock_tables();
            if !tables.engine.acknowledge(zone_id, monotonic_now()) {
                return false;
            }
            effects.commands.push(AlarmCommand::Stop(zone_id.to_string()));
            effects.events.push(MonitorEvent::Acknowledged {
                zone_id: zone_id.to_string(),
            });
            self.commit(&tables, &mut effects);
        }
        self.flush(effects);
        true
    }

    /// 停止所有报警，返回此前处于报警状态的区域
    pub fn stop_all_alarms(&self) -> Vec<String> {
        let mut effects = Effects::default();
        let zones = {
            let mut tables = self.lock_tables();
            let zones = tables.engine.stop_all(monotonic_now());
            effects.commands.push(AlarmCommand::StopAll);
            self.commit(&tables, &mut effects);
            zones
        };
        effects.events.push(MonitorEvent::AlarmsStopped {
            zones: zones.clone(),
        });
        self.flush(effects);
        zones
    }

    /// 清除区域记录与计时器（运维操作）
    pub fn reset_zone(&self, zone_id: &str) {
        let mut effects = Effects::default();
        {
            let mut tables = self.lock_tables();
            tables.aggregator.reset_zone(zone_id);
            let event = tables.engine.on_clear(zone_id, ClearReason::Reset);
            effects.events.push(MonitorEvent::Escalation(event));
            effects.commands.push(AlarmCommand::Stop(zone_id.to_string()));
            self.commit(&tables, &mut effects);
        }
        self.flush(effects);
    }

    pub fn reset_all(&self) {
        let mut effects = Effects::default();
        {
            let mut tables = self.lock_tables();
            tables.aggregator.reset_all();
            let events = tables.engine.clear_all(ClearReason::Reset);
            effects
                .events
                .extend(events.into_iter().map(MonitorEvent::Escalation));
            effects.commands.push(AlarmCommand::StopAll);
            self.commit(&tables, &mut effects);
        }
        self.flush(effects);
    }

    pub fn get_eco_status(&self, source_id: &str) -> Option<EcoStatus> {
        let scheduler = self
            .eco
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(source_id)
            .cloned()?;
        let eco = scheduler.lock().unwrap_or_else(|e| e.into_inner());
        Some(eco.status(monotonic_now()))
    }

    /// 采集端应遵循的参数；未知视频源返回初始状态的参数
    pub fn eco_profile(&self, source_id: &str) -> EcoProfile {
        let scheduler = self.eco_for(source_id, monotonic_now());
        let eco = scheduler.lock().unwrap_or_else(|e| e.into_inner());
        eco.profile().clone()
    }

    pub async fn active_alarms(&self) -> Vec<AlarmStatus> {
        self.alarms.active_alarms().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    pub fn summary(&self) -> watch::Receiver<MonitorSummary> {
        self.summary.subscribe()
    }

    pub fn update_grace_period(&self, zone_id: &str, grace: Duration) -> Result<(), WatchError> {
        if grace.is_zero() || grace.as_secs_f64() > MAX_GRACE_SECS {
            return Err(WatchError::Config(format!(
                "grace period for zone {} must be in (0, {}s]",
                zone_id, MAX_GRACE_SECS
            )));
        }
        self.lock_tables().engine.update_grace(zone_id, grace);
        Ok(())
    }

    /// 区域阶段表覆盖；None 恢复默认。下次报警启动时生效
    pub fn set_phase_plan(&self, zone_id: &str, plan: Option<PhasePlan>) -> Result<(), WatchError> {
        match plan {
            Some(plan) => self.alarms.set_zone_plan(zone_id, plan),
            None => {
                self.alarms.clear_zone_plan(zone_id);
                Ok(())
            }
        }
    }

    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// 停止 tick 与报警调度，等待全部报警循环退出
    pub async fn shutdown(&self) {
        self.token.cancel();
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("Monitor task ended abnormally: {}", e);
            }
        }
        self.alarms.stop_all().await;
        tracing::info!("Monitor stopped");
    }
}
