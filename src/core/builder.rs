//! Monitor 构建器：统一的组件初始化逻辑
//!
//! 按配置选择音频输出、通知渠道与事件日志，测试与嵌入方可逐个替换。

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::alarm::{
    AudioSink, CommandAudioSink, LogAudioSink, NoopNotifier, Notifier, TelegramNotifier,
};
use crate::config::{AppConfig, PlayerBackend};
use crate::core::{Monitor, RecoveryEngine, WatchError};
use crate::journal::EventJournal;

pub struct MonitorBuilder {
    config: AppConfig,
    audio: Option<Arc<dyn AudioSink>>,
    notifier: Option<Arc<dyn Notifier>>,
    journal: Option<Arc<EventJournal>>,
    shutdown: Option<CancellationToken>,
}

impl MonitorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            audio: None,
            notifier: None,
            journal: None,
            shutdown: None,
        }
    }

    /// 替换音频输出
    pub fn with_audio(mut self, audio: Arc<dyn AudioSink>) -> Self {
        self.audio = Some(audio);
        self
    }

    /// 替换通知渠道
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// 使用已打开的事件日志（忽略 [journal].path）
    pub fn with_journal(mut self, journal: Arc<EventJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// 挂到外部关闭 token 下
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn build_audio(&self) -> Arc<dyn AudioSink> {
        let player = &self.config.alarm.player;
        match player.backend {
            PlayerBackend::Log => Arc::new(LogAudioSink),
            PlayerBackend::Command => Arc::new(CommandAudioSink::new(
                player.asset_command.clone(),
                player.tone_command.clone(),
                Duration::from_secs(player.timeout_secs.max(1)),
            )),
        }
    }

    fn build_notifier(&self) -> Arc<dyn Notifier> {
        if !self.config.notify.enabled {
            return Arc::new(NoopNotifier);
        }
        match TelegramNotifier::from_config(&self.config.notify.telegram) {
            Some(telegram) => {
                tracing::info!("Telegram notifications enabled");
                Arc::new(telegram)
            }
            None => {
                tracing::info!("No notification channel configured");
                Arc::new(NoopNotifier)
            }
        }
    }

    /// 打开 [journal].path；失败时不记录日志继续运行
    fn open_journal(&self) -> Option<Arc<EventJournal>> {
        let path = self.config.journal.path.as_ref()?;
        match EventJournal::open(path) {
            Ok(journal) => Some(Arc::new(journal)),
            Err(e) => {
                RecoveryEngine::new().handle(&WatchError::Journal(format!(
                    "{}: {}",
                    path.display(),
                    e
                )));
                None
            }
        }
    }

    /// 构建并启动 Monitor；需在 tokio 运行时内调用
    pub fn build(self) -> Arc<Monitor> {
        let audio = self.audio.clone().unwrap_or_else(|| self.build_audio());
        let notifier = self.notifier.clone().unwrap_or_else(|| self.build_notifier());
        let journal = self.journal.clone().or_else(|| self.open_journal());
        let shutdown = self.shutdown.clone().unwrap_or_default();
        tracing::info!(
            "Building monitor (audio {}, notifier {}, journal {})",
            audio.name(),
            notifier.name(),
            if journal.is_some() { "on" } else { "off" }
        );
        Monitor::start(&self.config, audio, notifier, journal, &shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::TelegramSection;

    #[test]
    fn test_backends_follow_config() {
        let mut cfg = AppConfig::default();
        let builder = MonitorBuilder::new(cfg.clone());
        assert_eq!(builder.build_audio().name(), "log");
        assert_eq!(builder.build_notifier().name(), "noop");

        cfg.alarm.player.backend = PlayerBackend::Command;
        cfg.notify.telegram = TelegramSection {
            bot_token: Some("123:abc".to_string()),
            chat_id: Some("42".to_string()),
            ..TelegramSection::default()
        };
        let builder = MonitorBuilder::new(cfg.clone());
        assert_eq!(builder.build_audio().name(), "command");
        assert_eq!(builder.build_notifier().name(), "telegram");

        cfg.notify.enabled = false;
        assert_eq!(MonitorBuilder::new(cfg).build_notifier().name(), "noop");
    }

    #[tokio::test]
    async fn test_build_with_journal_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AppConfig::default();
        cfg.journal.path = Some(dir.path().join("events.db"));
        let token = CancellationToken::new();
        let monitor = MonitorBuilder::new(cfg)
            .with_shutdown_token(token.clone())
            .build();
        assert!(monitor.is_running());
        token.cancel();
        monitor.shutdown().await;
        assert!(!monitor.is_running());
    }
}
