//! 报警管理：每个报警区域一个受监管的任务
//!
//! - start 幂等：区域已有运行中的循环时直接返回
//! - stop 先取消子 token，等待至多 stop_timeout，超时再 abort，最后让音频设备静音
//! - 循环本身只看 AlarmRequest 快照，不触碰 Monitor 的表

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::alarm::notify::{Notification, Notifier, NotifySchedule};
use crate::alarm::phase::{AlarmPhase, PhaseBook, PhasePlan};
use crate::alarm::sink::{AudioClip, AudioSink, Tone};
use crate::alarm::snapshot::SnapshotStore;
use crate::alarm::volume::VolumeSchedule;
use crate::core::{AudioError, RecoveryAction, RecoveryEngine, WatchError};

/// 发出一次声音后到下一次检查的间隔
const POST_EMIT_PAUSE: Duration = Duration::from_millis(100);

/// 启动一个报警循环所需的全部信息（值拷贝）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlarmRequest {
    pub zone_id: String,
    pub zone_label: String,
    pub camera_id: String,
    pub grace_period: Duration,
}

/// 报警循环进度（watch 通道发布）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlarmStatus {
    pub run_id: Uuid,
    pub zone_id: String,
    pub zone_label: String,
    pub camera_id: String,
    pub phase: String,
    /// 1 起
    pub phase_number: usize,
    pub total_phases: usize,
    pub elapsed: Duration,
    pub notifications_sent: u32,
}

/// 报警循环的运行参数
#[derive(Debug, Clone)]
pub struct AlarmSettings {
    pub enabled: bool,
    pub sounds_dir: PathBuf,
    pub volume: VolumeSchedule,
    pub stop_timeout: Duration,
    pub continuous_yield: Duration,
    /// 进入新阶段时写播报日志
    pub announcements: bool,
    pub notify_enabled: bool,
    pub schedule: NotifySchedule,
}

impl Default for AlarmSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            sounds_dir: PathBuf::from("sounds"),
            volume: VolumeSchedule::default(),
            stop_timeout: Duration::from_secs(1),
            continuous_yield: Duration::from_millis(500),
            announcements: true,
            notify_enabled: true,
            schedule: NotifySchedule::default(),
        }
    }
}

/// Monitor 发给报警调度任务的命令；按顺序处理
#[derive(Debug, Clone)]
pub enum AlarmCommand {
    Start(AlarmRequest),
    Stop(String),
    StopAll,
}

struct AlarmRuntime {
    run_id: Uuid,
    token: CancellationToken,
    handle: JoinHandle<()>,
    progress: watch::Receiver<AlarmStatus>,
}

/// 报警循环共享的依赖
struct LoopContext {
    audio: Arc<dyn AudioSink>,
    notifier: Arc<dyn Notifier>,
    settings: AlarmSettings,
    snapshots: Arc<SnapshotStore>,
    recovery: RecoveryEngine,
}

pub struct AlarmManager {
    ctx: Arc<LoopContext>,
    phases: RwLock<PhaseBook>,
    runtimes: Mutex<HashMap<String, AlarmRuntime>>,
    root: CancellationToken,
}

impl AlarmManager {
    pub fn new(
        audio: Arc<dyn AudioSink>,
        notifier: Arc<dyn Notifier>,
        settings: AlarmSettings,
        phases: PhaseBook,
        snapshots: Arc<SnapshotStore>,
        root: CancellationToken,
    ) -> Self {
        tracing::info!(
            "Alarm manager ready (audio: {}, notifier: {})",
            audio.name(),
            notifier.name()
        );
        Self {
            ctx: Arc::new(LoopContext {
                audio,
                notifier,
                settings,
                snapshots,
                recovery: RecoveryEngine::new(),
            }),
            phases: RwLock::new(phases),
            runtimes: Mutex::new(HashMap::new()),
            root,
        }
    }

    /// 启动区域报警；已在运行时返回 false
    pub async fn start(&self, request: AlarmRequest) -> bool {
        if !self.ctx.settings.enabled {
            tracing::debug!("Alarms disabled, ignoring start for {}", request.zone_id);
            return false;
        }
        let mut runtimes = self.runtimes.lock().await;
        if let Some(existing) = runtimes.get(&request.zone_id) {
            if !existing.handle.is_finished() {
                tracing::debug!("Alarm already running for zone {}", request.zone_id);
                return false;
            }
        }

        let plan = self.plan_for(&request.zone_id);
        let run_id = Uuid::new_v4();
        let token = self.root.child_token();
        let (progress_tx, progress_rx) = watch::channel(AlarmStatus {
            run_id,
            zone_id: request.zone_id.clone(),
            zone_label: request.zone_label.clone(),
            camera_id: request.camera_id.clone(),
            phase: plan.phase(0).name.clone(),
            phase_number: 1,
            total_phases: plan.len(),
            elapsed: Duration::ZERO,
            notifications_sent: 0,
        });

        tracing::info!(
            "Starting alarm for zone {} (camera {}, grace {:?}, run {})",
            request.zone_id,
            request.camera_id,
            request.grace_period,
            run_id
        );
        let handle = tokio::spawn(run_alarm_loop(
            Arc::clone(&self.ctx),
            request.clone(),
            plan,
            token.clone(),
            progress_tx,
        ));
        runtimes.insert(
            request.zone_id,
            AlarmRuntime {
                run_id,
                token,
                handle,
                progress: progress_rx,
            },
        );
        true
    }

    /// 停止区域报警；未运行时返回 false。其它区域仍在报警时不释放音频设备
    pub async fn stop(&self, zone_id: &str) -> bool {
        let runtime = self.runtimes.lock().await.remove(zone_id);
        let Some(runtime) = runtime else {
            return false;
        };
        self.shutdown_runtime(zone_id, runtime).await;
        let remaining = self.runtimes.lock().await.len();
        if remaining == 0 {
            self.ctx.audio.stop().await;
        } else {
            tracing::debug!("Audio device kept for {} other alarm(s)", remaining);
        }
        true
    }

    /// 停止全部报警，返回停止的数量
    pub async fn stop_all(&self) -> usize {
        let drained: Vec<(String, AlarmRuntime)> =
            self.runtimes.lock().await.drain().collect();
        if drained.is_empty() {
            return 0;
        }
        for (_, runtime) in &drained {
            runtime.token.cancel();
        }
        let count = drained.len();
        futures_util::future::join_all(
            drained
                .into_iter()
                .map(|(zone_id, runtime)| async move {
                    self.shutdown_runtime(&zone_id, runtime).await;
                }),
        )
        .await;
        self.ctx.audio.stop().await;
        tracing::info!("Stopped {} alarm loop(s)", count);
        count
    }

    async fn shutdown_runtime(&self, zone_id: &str, mut runtime: AlarmRuntime) {
        runtime.token.cancel();
        match tokio::time::timeout(self.ctx.settings.stop_timeout, &mut runtime.handle).await {
            Ok(Ok(())) => {
                tracing::info!("Alarm for zone {} stopped (run {})", zone_id, runtime.run_id);
            }
            Ok(Err(e)) => {
                tracing::warn!("Alarm task for zone {} ended abnormally: {}", zone_id, e);
            }
            Err(_) => {
                tracing::warn!(
                    "Alarm task for zone {} did not stop within {:?}, aborting",
                    zone_id,
                    self.ctx.settings.stop_timeout
                );
                runtime.handle.abort();
            }
        }
    }

    pub async fn is_running(&self, zone_id: &str) -> bool {
        self.runtimes
            .lock()
            .await
            .get(zone_id)
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// 当前所有报警循环的进度，按 zone_id 排序
    pub async fn active_alarms(&self) -> Vec<AlarmStatus> {
        let runtimes = self.runtimes.lock().await;
        let mut statuses: Vec<AlarmStatus> = runtimes
            .values()
            .filter(|r| !r.handle.is_finished())
            .map(|r| r.progress.borrow().clone())
            .collect();
        statuses.sort_by(|a, b| a.zone_id.cmp(&b.zone_id));
        statuses
    }

    /// 运行时替换区域阶段表；下次启动该区域报警时生效
    pub fn set_zone_plan(&self, zone_id: &str, plan: PhasePlan) -> Result<(), WatchError> {
        let mut book = self.phases.write().unwrap_or_else(|e| e.into_inner());
        book.set_zone_plan(zone_id, plan)
    }

    pub fn clear_zone_plan(&self, zone_id: &str) {
        let mut book = self.phases.write().unwrap_or_else(|e| e.into_inner());
        book.clear_zone_plan(zone_id);
    }

    pub fn plan_for(&self, zone_id: &str) -> PhasePlan {
        let book = self.phases.read().unwrap_or_else(|e| e.into_inner());
        book.plan_for(zone_id).clone()
    }
}

/// 顺序消费报警命令；root token 取消时停止全部报警并退出
pub fn spawn_dispatcher(
    manager: Arc<AlarmManager>,
    mut commands: mpsc::UnboundedReceiver<AlarmCommand>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    manager.stop_all().await;
                    break;
                }
                cmd = commands.recv() => {
                    match cmd {
                        Some(AlarmCommand::Start(request)) => {
                            manager.start(request).await;
                        }
                        Some(AlarmCommand::Stop(zone_id)) => {
                            manager.stop(&zone_id).await;
                        }
                        Some(AlarmCommand::StopAll) => {
                            manager.stop_all().await;
                        }
                        None => break,
                    }
                }
            }
        }
        tracing::debug!("Alarm dispatcher exited");
    })
}

async fn run_alarm_loop(
    ctx: Arc<LoopContext>,
    request: AlarmRequest,
    plan: PhasePlan,
    token: CancellationToken,
    progress: watch::Sender<AlarmStatus>,
) {
    let started = Instant::now();
    let run_id = progress.borrow().run_id;
    let total = plan.len();
    let mut current: Option<usize> = None;
    let mut last_sound: Option<Instant> = None;
    let mut sent: u32 = 0;
    let mut next_notify = started;
    let mut missing_assets: HashSet<PathBuf> = HashSet::new();

    loop {
        if token.is_cancelled() {
            break;
        }
        let now = Instant::now();
        let elapsed = now - started;
        let index = plan.phase_index(elapsed, request.grace_period);
        let phase = plan.phase(index);

        if current != Some(index) {
            tracing::info!(
                "Zone {} entered phase '{}' ({}/{})",
                request.zone_id,
                phase.name,
                index + 1,
                total
            );
            if ctx.settings.announcements {
                let text =
                    phase.render_message(&request.zone_label, &request.camera_id, elapsed, sent);
                tracing::info!("Announcement: {}", text);
            }
            // 升级到新阶段时立即通知一次
            if current.is_some() {
                next_notify = now;
            }
            current = Some(index);
        }

        if ctx.settings.notify_enabled && now >= next_notify {
            let image = if ctx.settings.schedule.attach_image(sent) {
                ctx.snapshots.latest(&request.camera_id)
            } else {
                None
            };
            dispatch_notification(
                &ctx,
                Notification {
                    zone_id: request.zone_id.clone(),
                    message: phase.render_message(
                        &request.zone_label,
                        &request.camera_id,
                        elapsed,
                        sent + 1,
                    ),
                    urgency: phase.urgency,
                    image,
                },
            );
            sent += 1;
            next_notify = now + ctx.settings.schedule.interval_after(&request.zone_id, sent);
        }

        progress.send_replace(AlarmStatus {
            run_id,
            zone_id: request.zone_id.clone(),
            zone_label: request.zone_label.clone(),
            camera_id: request.camera_id.clone(),
            phase: phase.name.clone(),
            phase_number: index + 1,
            total_phases: total,
            elapsed,
            notifications_sent: sent,
        });

        let wait = if phase.is_continuous() {
            emit(&ctx, phase, index, total, &token, &mut missing_assets).await;
            last_sound = Some(now);
            ctx.settings.continuous_yield
        } else {
            let interval = phase.repeat_interval();
            match last_sound {
                Some(at) if now - at < interval => {
                    (interval - (now - at)).min(ctx.settings.continuous_yield)
                }
                _ => {
                    emit(&ctx, phase, index, total, &token, &mut missing_assets).await;
                    last_sound = Some(now);
                    POST_EMIT_PAUSE
                }
            }
        };

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }

    tracing::info!(
        "Alarm loop for zone {} exited after {:?} ({} notifications)",
        request.zone_id,
        started.elapsed(),
        sent
    );
}

/// 通知单独起任务发送，失败只记录
fn dispatch_notification(ctx: &Arc<LoopContext>, notification: Notification) {
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        match ctx.notifier.send(&notification).await {
            Ok(()) => tracing::debug!("Notification sent for zone {}", notification.zone_id),
            Err(e) => {
                ctx.recovery.handle(&WatchError::Notify(e));
            }
        }
    });
}

async fn emit(
    ctx: &LoopContext,
    phase: &AlarmPhase,
    index: usize,
    total: usize,
    token: &CancellationToken,
    missing_assets: &mut HashSet<PathBuf>,
) {
    let volume = ctx.settings.volume.apply(phase.volume);
    let tone = AudioClip::Tone(Tone::for_severity(index, total));

    let clip = match &phase.sound {
        Some(name) => {
            let path = ctx.settings.sounds_dir.join(name);
            if path.exists() {
                AudioClip::Asset(path)
            } else {
                // 只在第一次缺失时走恢复日志，避免连续阶段刷屏
                if missing_assets.insert(path.clone()) {
                    ctx.recovery.handle(&WatchError::Audio(AudioError::AssetMissing(
                        path.display().to_string(),
                    )));
                }
                tone.clone()
            }
        }
        None => tone.clone(),
    };

    let result = tokio::select! {
        _ = token.cancelled() => return,
        r = ctx.audio.play(&clip, volume) => r,
    };
    let Err(e) = result else {
        return;
    };

    let action = ctx.recovery.handle(&WatchError::Audio(e));
    if action == RecoveryAction::FallbackTone && clip != tone {
        let fallback = tokio::select! {
            _ = token.cancelled() => return,
            r = ctx.audio.play(&tone, volume) => r,
        };
        if let Err(e) = fallback {
            tracing::warn!("Fallback tone failed for phase '{}': {}", phase.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::alarm::phase::{TimedPhase, Urgency};
    use crate::core::NotifyError;

    #[derive(Default)]
    struct RecordingSink {
        plays: std::sync::Mutex<Vec<(AudioClip, f32)>>,
        stops: AtomicUsize,
        fail_assets: bool,
    }

    impl RecordingSink {
        fn plays(&self) -> Vec<(AudioClip, f32)> {
            self.plays.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AudioSink for RecordingSink {
        async fn play(&self, clip: &AudioClip, volume: f32) -> Result<(), AudioError> {
            self.plays.lock().unwrap().push((clip.clone(), volume));
            if self.fail_assets && matches!(clip, AudioClip::Asset(_)) {
                return Err(AudioError::PlayerFailed("device busy".to_string()));
            }
            Ok(())
        }

        async fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    #[derive(Default)]
    struct CountingNotifier {
        attempts: AtomicUsize,
        with_image: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for CountingNotifier {
        async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if notification.image.is_some() {
                self.with_image.fetch_add(1, Ordering::SeqCst);
            }
            if self.fail {
                return Err(NotifyError::Rejected {
                    status: 502,
                    body: "bad gateway".to_string(),
                });
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    fn request(zone_id: &str, grace_secs: u64) -> AlarmRequest {
        AlarmRequest {
            zone_id: zone_id.to_string(),
            zone_label: zone_id.to_string(),
            camera_id: "cam1".to_string(),
            grace_period: Duration::from_secs(grace_secs),
        }
    }

    fn single_phase_plan(interval_secs: f64) -> PhasePlan {
        PhasePlan::Absolute {
            phases: vec![TimedPhase {
                duration_secs: None,
                phase: AlarmPhase {
                    name: "only".to_string(),
                    interval_secs,
                    volume: 1.0,
                    urgency: Urgency::High,
                    sound: None,
                    message: None,
                },
            }],
        }
    }

    fn manager_with(
        sink: Arc<RecordingSink>,
        notifier: Arc<CountingNotifier>,
        settings: AlarmSettings,
        book: PhaseBook,
    ) -> (AlarmManager, Arc<SnapshotStore>) {
        let snapshots = Arc::new(SnapshotStore::new());
        let manager = AlarmManager::new(
            sink,
            notifier,
            settings,
            book,
            Arc::clone(&snapshots),
            CancellationToken::new(),
        );
        (manager, snapshots)
    }

    fn settings(sounds_dir: PathBuf) -> AlarmSettings {
        AlarmSettings {
            sounds_dir,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let sink = Arc::new(RecordingSink::default());
        let notifier = Arc::new(CountingNotifier::default());
        let (manager, _) = manager_with(
            sink,
            notifier,
            settings(PathBuf::from("/nonexistent")),
            PhaseBook::default(),
        );

        assert!(manager.start(request("door_1", 10)).await);
        assert!(!manager.start(request("door_1", 10)).await);
        assert_eq!(manager.active_alarms().await.len(), 1);
        assert!(manager.is_running("door_1").await);
        manager.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_when_not_running_is_noop() {
        let sink = Arc::new(RecordingSink::default());
        let notifier = Arc::new(CountingNotifier::default());
        let (manager, _) = manager_with(
            Arc::clone(&sink),
            notifier,
            settings(PathBuf::from("/nonexistent")),
            PhaseBook::default(),
        );
        assert!(!manager.stop("door_1").await);
        assert_eq!(sink.stops.load(Ordering::SeqCst), 0);
        assert_eq!(manager.stop_all().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_prompt_and_silences_sink() {
        let sink = Arc::new(RecordingSink::default());
        let notifier = Arc::new(CountingNotifier::default());
        let (manager, _) = manager_with(
            Arc::clone(&sink),
            notifier,
            settings(PathBuf::from("/nonexistent")),
            PhaseBook::default(),
        );
        manager.start(request("door_1", 10)).await;
        tokio::time::sleep(Duration::from_secs(12)).await;

        let before = Instant::now();
        assert!(manager.stop("door_1").await);
        assert!(before.elapsed() < Duration::from_secs(1));
        assert!(!manager.is_running("door_1").await);
        assert!(manager.active_alarms().await.is_empty());
        assert_eq!(sink.stops.load(Ordering::SeqCst), 1);

        let plays = sink.plays().len();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sink.plays().len(), plays);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_keeps_device_while_other_zones_alarm() {
        let sink = Arc::new(RecordingSink::default());
        let notifier = Arc::new(CountingNotifier::default());
        let (manager, _) = manager_with(
            Arc::clone(&sink),
            notifier,
            settings(PathBuf::from("/nonexistent")),
            PhaseBook::default(),
        );
        manager.start(request("door_1", 10)).await;
        manager.start(request("door_2", 10)).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(manager.stop("door_1").await);
        assert_eq!(sink.stops.load(Ordering::SeqCst), 0);
        assert!(manager.is_running("door_2").await);

        assert!(manager.stop("door_2").await);
        assert_eq!(sink.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_assets_fall_back_to_tone() {
        let sink = Arc::new(RecordingSink::default());
        let notifier = Arc::new(CountingNotifier::default());
        let (manager, _) = manager_with(
            Arc::clone(&sink),
            notifier,
            settings(PathBuf::from("/nonexistent/sounds")),
            PhaseBook::default(),
        );
        manager.start(request("door_1", 10)).await;
        tokio::time::sleep(Duration::from_secs(11)).await;
        manager.stop("door_1").await;

        let plays = sink.plays();
        assert!(!plays.is_empty());
        assert!(plays.iter().all(|(clip, _)| matches!(clip, AudioClip::Tone(_))));
        // 进入危急阶段后使用 880Hz
        assert!(plays.iter().any(|(clip, _)| matches!(
            clip,
            AudioClip::Tone(t) if t.frequency_hz == 880.0
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_asset_play_failure_retries_with_tone() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ding_dong.mp3"), b"ID3").unwrap();
        let sink = Arc::new(RecordingSink {
            fail_assets: true,
            ..Default::default()
        });
        let notifier = Arc::new(CountingNotifier::default());
        let (manager, _) = manager_with(
            Arc::clone(&sink),
            notifier,
            settings(dir.path().to_path_buf()),
            PhaseBook::default(),
        );
        manager.start(request("door_1", 100)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.stop("door_1").await;

        let plays = sink.plays();
        assert!(matches!(plays[0].0, AudioClip::Asset(_)));
        assert!(matches!(plays[1].0, AudioClip::Tone(t) if t.frequency_hz == 440.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_phase_respects_repeat_interval() {
        let sink = Arc::new(RecordingSink::default());
        let notifier = Arc::new(CountingNotifier::default());
        let mut book = PhaseBook::default();
        book.set_zone_plan("door_1", single_phase_plan(10.0)).unwrap();
        let (manager, _) = manager_with(
            Arc::clone(&sink),
            notifier,
            settings(PathBuf::from("/nonexistent")),
            book,
        );
        manager.start(request("door_1", 10)).await;
        tokio::time::sleep(Duration::from_secs(25)).await;
        manager.stop("door_1").await;
        assert_eq!(sink.plays().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_phase_replays_after_yield() {
        let sink = Arc::new(RecordingSink::default());
        let notifier = Arc::new(CountingNotifier::default());
        let mut book = PhaseBook::default();
        book.set_zone_plan("door_1", single_phase_plan(0.0)).unwrap();
        let (manager, _) = manager_with(
            Arc::clone(&sink),
            notifier,
            settings(PathBuf::from("/nonexistent")),
            book,
        );
        manager.start(request("door_1", 10)).await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        manager.stop("door_1").await;
        let plays = sink.plays().len();
        assert!((5..=7).contains(&plays), "got {} plays", plays);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_notifier_does_not_halt_audio() {
        let sink = Arc::new(RecordingSink::default());
        let notifier = Arc::new(CountingNotifier {
            fail: true,
            ..Default::default()
        });
        let (manager, _) = manager_with(
            Arc::clone(&sink),
            Arc::clone(&notifier),
            settings(PathBuf::from("/nonexistent")),
            PhaseBook::default(),
        );
        manager.start(request("door_1", 10)).await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        // 0s 首条，5s 升级、9s 升级，随后按退避发送
        assert!(notifier.attempts.load(Ordering::SeqCst) >= 4);
        assert!(sink.plays().len() > 20);
        assert!(manager.is_running("door_1").await);
        manager.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_tracks_phases() {
        let sink = Arc::new(RecordingSink::default());
        let notifier = Arc::new(CountingNotifier::default());
        let (manager, _) = manager_with(
            sink,
            notifier,
            settings(PathBuf::from("/nonexistent")),
            PhaseBook::default(),
        );
        manager.start(request("door_1", 10)).await;

        tokio::time::sleep(Duration::from_secs(1)).await;
        let status = &manager.active_alarms().await[0];
        assert_eq!(status.phase, "friendly");
        assert_eq!(status.total_phases, 3);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(manager.active_alarms().await[0].phase, "moderate");

        tokio::time::sleep(Duration::from_secs(4)).await;
        let status = &manager.active_alarms().await[0];
        assert_eq!(status.phase, "critical");
        assert_eq!(status.phase_number, 3);
        manager.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_notification_carries_snapshot() {
        let sink = Arc::new(RecordingSink::default());
        let notifier = Arc::new(CountingNotifier::default());
        let (manager, snapshots) = manager_with(
            sink,
            Arc::clone(&notifier),
            settings(PathBuf::from("/nonexistent")),
            PhaseBook::default(),
        );
        snapshots.store("cam1", vec![0xFF, 0xD8, 0xFF]);
        manager.start(request("door_1", 100)).await;
        tokio::time::sleep(Duration::from_secs(6)).await;
        manager.stop_all().await;

        assert_eq!(notifier.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(notifier.with_image.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatcher_applies_commands_in_order() {
        let sink = Arc::new(RecordingSink::default());
        let notifier = Arc::new(CountingNotifier::default());
        let (manager, _) = manager_with(
            sink,
            notifier,
            settings(PathBuf::from("/nonexistent")),
            PhaseBook::default(),
        );
        let manager = Arc::new(manager);
        let shutdown = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = spawn_dispatcher(Arc::clone(&manager), rx, shutdown.clone());

        tx.send(AlarmCommand::Start(request("door_1", 10))).unwrap();
        tx.send(AlarmCommand::Stop("door_1".to_string())).unwrap();
        tx.send(AlarmCommand::Start(request("door_1", 10))).unwrap();
        tx.send(AlarmCommand::Start(request("door_2", 10))).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(manager.active_alarms().await.len(), 2);

        shutdown.cancel();
        dispatcher.await.unwrap();
        assert!(manager.active_alarms().await.is_empty());
    }
}
