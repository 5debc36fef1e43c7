//! 外部通知：Notifier 抽象 + Telegram 实现 + 递增发送间隔
//!
//! 通知是尽力而为的：发送失败只记录日志，不影响报警循环。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::alarm::phase::Urgency;
use crate::core::NotifyError;

/// 一条待发送的通知
#[derive(Debug, Clone)]
pub struct Notification {
    pub zone_id: String,
    pub message: String,
    pub urgency: Urgency,
    /// JPEG 快照（可选）
    pub image: Option<Vec<u8>>,
}

/// 外部消息渠道
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;

    fn name(&self) -> &'static str;
}

/// 不发送任何消息（未配置渠道时使用）
#[derive(Debug, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        tracing::debug!(
            "Notification for {} dropped (no channel): {}",
            notification.zone_id,
            notification.message
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

/// [notify.telegram] 段
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramSection {
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for TelegramSection {
    fn default() -> Self {
        Self {
            bot_token: None,
            chat_id: None,
            base_url: "https://api.telegram.org".to_string(),
            timeout_secs: 10,
        }
    }
}

/// Telegram Bot API：文字走 sendMessage，带快照走 sendPhoto
pub struct TelegramNotifier {
    client: reqwest::Client,
    base_url: String,
    bot_token: String,
    chat_id: String,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: String,
    parse_mode: &'a str,
}

impl TelegramNotifier {
    /// token 或 chat_id 缺失时返回 None
    pub fn from_config(section: &TelegramSection) -> Option<Self> {
        let bot_token = section.bot_token.clone().filter(|t| !t.is_empty())?;
        let chat_id = section.chat_id.clone().filter(|c| !c.is_empty())?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(section.timeout_secs.max(1)))
            .build()
            .ok()?;
        Some(Self {
            client,
            base_url: section.base_url.trim_end_matches('/').to_string(),
            bot_token,
            chat_id,
        })
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.bot_token, method)
    }

    fn format_text(notification: &Notification) -> String {
        let badge = match notification.urgency {
            Urgency::Low => "🔔",
            Urgency::Normal => "⚠️",
            Urgency::High => "🚨",
            Urgency::Critical => "🚨🚨🚨",
        };
        format!(
            "{} <b>{}</b>\n{}",
            badge,
            escape_html(&notification.zone_id),
            escape_html(&notification.message)
        )
    }

    async fn check(resp: reqwest::Response) -> Result<(), NotifyError> {
        if resp.status().is_success() {
            return Ok(());
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(NotifyError::Rejected { status, body })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let text = Self::format_text(notification);
        match &notification.image {
            Some(jpeg) => {
                let photo = reqwest::multipart::Part::bytes(jpeg.clone())
                    .file_name("snapshot.jpg")
                    .mime_str("image/jpeg")?;
                let form = reqwest::multipart::Form::new()
                    .text("chat_id", self.chat_id.clone())
                    .text("caption", text)
                    .text("parse_mode", "HTML")
                    .part("photo", photo);
                let resp = self
                    .client
                    .post(self.endpoint("sendPhoto"))
                    .multipart(form)
                    .send()
                    .await?;
                Self::check(resp).await
            }
            None => {
                let req = SendMessageRequest {
                    chat_id: &self.chat_id,
                    text,
                    parse_mode: "HTML",
                };
                let resp = self
                    .client
                    .post(self.endpoint("sendMessage"))
                    .json(&req)
                    .send()
                    .await?;
                Self::check(resp).await
            }
        }
    }

    fn name(&self) -> &'static str {
        "telegram"
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// 通知节奏：第 n 次发送后的等待间隔递增，直到上限
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifySchedule {
    /// 依次使用的间隔（秒）
    pub backoff_secs: Vec<u64>,
    /// 用完 backoff_secs 后的固定间隔
    pub max_interval_secs: u64,
    /// 每隔多少条附带一次快照（首条总是附带）
    pub image_every: u32,
    pub include_images: bool,
    /// 区域前缀 -> 首个间隔（如 entrance_2 取 "entrance"）
    pub initial_interval_by_zone: HashMap<String, u64>,
}

impl Default for NotifySchedule {
    fn default() -> Self {
        Self {
            backoff_secs: vec![5, 10, 20, 30],
            max_interval_secs: 60,
            image_every: 5,
            include_images: true,
            initial_interval_by_zone: HashMap::new(),
        }
    }
}

impl NotifySchedule {
    /// 已发送 sent_count 条之后，到下一条的间隔
    pub fn interval_after(&self, zone_id: &str, sent_count: u32) -> Duration {
        let cap = self.max_interval_secs.max(1);
        let secs = if sent_count <= 1 {
            let prefix = zone_id.split('_').next().unwrap_or(zone_id);
            self.initial_interval_by_zone
                .get(zone_id)
                .or_else(|| self.initial_interval_by_zone.get(prefix))
                .copied()
                .or_else(|| self.backoff_secs.first().copied())
                .unwrap_or(cap)
        } else {
            self.backoff_secs
                .get(sent_count as usize - 1)
                .copied()
                .unwrap_or(cap)
        };
        Duration::from_secs(secs.min(cap).max(1))
    }

    /// 第 index 条（0 起）是否附带快照
    pub fn attach_image(&self, index: u32) -> bool {
        self.include_images && (index == 0 || (self.image_every > 0 && index % self.image_every == 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_escalates_to_cap() {
        let schedule = NotifySchedule::default();
        let secs: Vec<u64> = (1..=7)
            .map(|n| schedule.interval_after("door_1", n).as_secs())
            .collect();
        assert_eq!(secs, vec![5, 10, 20, 30, 60, 60, 60]);
    }

    #[test]
    fn test_schedule_zone_prefix_initial_interval() {
        let mut schedule = NotifySchedule::default();
        schedule
            .initial_interval_by_zone
            .insert("emergency".to_string(), 3);
        assert_eq!(schedule.interval_after("emergency_exit", 1).as_secs(), 3);
        assert_eq!(schedule.interval_after("emergency_exit", 2).as_secs(), 10);
        assert_eq!(schedule.interval_after("loading_1", 1).as_secs(), 5);
    }

    #[test]
    fn test_attach_image_first_and_every_fifth() {
        let schedule = NotifySchedule::default();
        let attached: Vec<u32> = (0..12).filter(|i| schedule.attach_image(*i)).collect();
        assert_eq!(attached, vec![0, 5, 10]);

        let no_images = NotifySchedule {
            include_images: false,
            ..Default::default()
        };
        assert!(!no_images.attach_image(0));
    }

    #[test]
    fn test_telegram_requires_token_and_chat() {
        assert!(TelegramNotifier::from_config(&TelegramSection::default()).is_none());
        let section = TelegramSection {
            bot_token: Some("123:abc".to_string()),
            chat_id: Some("-100".to_string()),
            ..Default::default()
        };
        let notifier = TelegramNotifier::from_config(&section).unwrap();
        assert_eq!(
            notifier.endpoint("sendMessage"),
            "https://api.telegram.org/bot123:abc/sendMessage"
        );
    }

    #[test]
    fn test_format_text_escapes_html() {
        let text = TelegramNotifier::format_text(&Notification {
            zone_id: "door<1>".to_string(),
            message: "a & b".to_string(),
            urgency: Urgency::Critical,
            image: None,
        });
        assert!(text.contains("door&lt;1&gt;"));
        assert!(text.contains("a &amp; b"));
    }
}
