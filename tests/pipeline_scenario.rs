//! 端到端场景：检测帧 -> 区域边沿 -> 宽限期 -> 报警循环 -> 关门清理

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use doorwatch::alarm::{AudioClip, AudioSink, Notification, Notifier};
use doorwatch::config::AppConfig;
use doorwatch::core::{AudioError, MonitorBuilder, MonitorEvent, NotifyError};
use doorwatch::detection::Detection;
use doorwatch::escalation::EscalationEvent;
use doorwatch::journal::EventJournal;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct CountingSink {
    plays: AtomicUsize,
}

#[async_trait]
impl AudioSink for CountingSink {
    async fn play(&self, _clip: &AudioClip, _volume: f32) -> Result<(), AudioError> {
        self.plays.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "counting"
    }
}

#[derive(Default)]
struct CountingNotifier {
    sent: AtomicUsize,
}

#[async_trait]
impl Notifier for CountingNotifier {
    async fn send(&self, _notification: &Notification) -> Result<(), NotifyError> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "counting"
    }
}

fn door(label: &str) -> Vec<Detection> {
    vec![Detection::new(label, 0.9, Some("door_1"))]
}

fn config_with_grace(secs: f64) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.escalation.grace.zones.insert("door_1".to_string(), secs);
    cfg
}

#[tokio::test(start_paused = true)]
async fn test_door_left_open_escalates_and_close_clears() {
    let sink = Arc::new(CountingSink::default());
    let notifier = Arc::new(CountingNotifier::default());
    let monitor = MonitorBuilder::new(config_with_grace(5.0))
        .with_audio(sink.clone())
        .with_notifier(notifier.clone())
        .build();
    let mut events = monitor.subscribe();

    let first = monitor.process_frame(
        "cam1",
        &[Detection::new("gate_open", 0.85, Some("door_1"))],
    );
    assert_eq!(first.transitions.len(), 1);
    for second in 1..=4u64 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let outcome = monitor.process_frame(
            "cam1",
            &[Detection::new("gate_open", 0.80, Some("door_1"))],
        );
        assert!(outcome.transitions.is_empty());
        let timer = &monitor.get_active_timers()[0];
        assert!(timer.elapsed >= Duration::from_secs(second));
        assert!(timer.elapsed < Duration::from_secs(second) + Duration::from_millis(100));
    }
    // t = 4s：仍在宽限期内
    assert!(monitor.active_alarms().await.is_empty());
    assert!(!monitor.get_active_timers()[0].alarm_triggered);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    monitor.process_frame("cam1", &door("gate_open"));
    let alarms = monitor.active_alarms().await;
    assert_eq!(alarms.len(), 1);
    assert_eq!(alarms[0].zone_id, "door_1");
    assert_eq!(alarms[0].phase_number, 1);
    assert!(sink.plays.load(Ordering::SeqCst) >= 1);
    assert!(notifier.sent.load(Ordering::SeqCst) >= 1);

    tokio::time::sleep(Duration::from_millis(500)).await;
    monitor.process_frame("cam1", &door("gate_closed"));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(monitor.active_alarms().await.is_empty());
    assert!(monitor.get_active_timers().is_empty());

    let plays = sink.plays.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(sink.plays.load(Ordering::SeqCst), plays);

    let mut cleared_while_alarming = false;
    while let Ok(event) = events.try_recv() {
        if let MonitorEvent::Escalation(EscalationEvent::AlarmCleared { was_alarming, .. }) = event {
            cleared_while_alarming = was_alarming;
        }
    }
    assert!(cleared_while_alarming);
    monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_continuous_open_frames_trigger_once() {
    let monitor = MonitorBuilder::new(config_with_grace(2.0))
        .with_audio(Arc::new(CountingSink::default()))
        .with_notifier(Arc::new(CountingNotifier::default()))
        .build();
    let mut events = monitor.subscribe();

    for _ in 0..20 {
        monitor.process_frame("cam1", &door("gate_open"));
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    assert_eq!(monitor.active_alarms().await.len(), 1);
    assert_eq!(monitor.get_active_timers().len(), 1);

    let mut opens = 0;
    let mut triggers = 0;
    while let Ok(event) = events.try_recv() {
        match event.kind() {
            "zone_open" => opens += 1,
            "alarm_triggered" => triggers += 1,
            _ => {}
        }
    }
    assert_eq!(opens, 1);
    assert_eq!(triggers, 1);
    monitor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_low_confidence_frames_never_alarm() {
    let monitor = MonitorBuilder::new(config_with_grace(1.0))
        .with_audio(Arc::new(CountingSink::default()))
        .build();
    for _ in 0..10 {
        monitor.process_frame("cam1", &[Detection::new("gate_open", 0.4, Some("door_1"))]);
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    assert!(monitor.get_zone_states().is_empty());
    assert!(monitor.active_alarms().await.is_empty());
    monitor.shutdown().await;
}

#[tokio::test]
async fn test_transitions_are_journaled() {
    let dir = tempfile::tempdir().unwrap();
    let journal = Arc::new(EventJournal::open(dir.path().join("events.db")).unwrap());
    let token = CancellationToken::new();
    let monitor = MonitorBuilder::new(AppConfig::default())
        .with_audio(Arc::new(CountingSink::default()))
        .with_journal(Arc::clone(&journal))
        .with_shutdown_token(token.clone())
        .build();

    monitor.process_frame("cam1", &door("gate_open"));
    monitor.process_frame("cam1", &door("gate_closed"));
    journal.flush().await.unwrap();

    let kinds: Vec<String> = journal
        .recent(20)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.kind)
        .collect();
    assert!(kinds.contains(&"zone_open".to_string()));
    assert!(kinds.contains(&"zone_close".to_string()));
    assert!(kinds.contains(&"alarm_cleared".to_string()));
    assert!(kinds.contains(&"eco_changed".to_string()));

    token.cancel();
    monitor.shutdown().await;
    journal.close().await.unwrap();
}
