//! 单个视频源的节能状态机
//!
//! - IDLE -> ALERT：检测到运动
//! - 任意状态 -> ACTIVE：确认开门
//! - ACTIVE -> ALERT：alert_timeout 内没有确认开门
//! - ALERT -> IDLE：idle_timeout 内没有运动，且该源没有未解决的区域
//! - ACTIVE 不会直接回到 IDLE

use std::time::{Duration, Instant};

use image::DynamicImage;

use crate::eco::{EcoProfile, EcoSettings, EcoState, EcoStatus, MotionEstimator, MotionReading};

#[derive(Debug)]
pub struct EcoScheduler {
    source_id: String,
    settings: EcoSettings,
    state: EcoState,
    state_since: Instant,
    last_motion_at: Instant,
    last_confirmed_at: Option<Instant>,
    last_reading: MotionReading,
    estimator: MotionEstimator,
}

impl EcoScheduler {
    pub fn new(source_id: impl Into<String>, settings: EcoSettings, now: Instant) -> Self {
        let state = if settings.enabled {
            EcoState::Idle
        } else {
            EcoState::Active
        };
        Self {
            source_id: source_id.into(),
            estimator: MotionEstimator::new(settings.motion.clone()),
            settings,
            state,
            state_since: now,
            last_motion_at: now,
            last_confirmed_at: None,
            last_reading: MotionReading::default(),
        }
    }

    pub fn state(&self) -> EcoState {
        self.state
    }

    pub fn profile(&self) -> &EcoProfile {
        self.settings.profile(self.state)
    }

    pub fn should_run_detection(&self) -> bool {
        self.profile().detection_enabled
    }

    pub fn scale_dimensions(&self, width: u32, height: u32) -> (u32, u32) {
        self.profile().scale_dimensions(width, height)
    }

    fn transition(&mut self, to: EcoState, now: Instant, reason: &str) {
        if self.state == to || !self.settings.enabled {
            return;
        }
        tracing::info!(
            "Eco state for {}: {} -> {} ({})",
            self.source_id,
            self.state,
            to,
            reason
        );
        self.state = to;
        self.state_since = now;
    }

    /// 对帧做运动估计并据此更新状态，返回估计结果
    pub fn observe_frame(&mut self, frame: &DynamicImage, now: Instant) -> MotionReading {
        let reading = self.estimator.estimate(frame);
        self.last_reading = reading;
        self.observe_motion(reading.motion, now);
        reading
    }

    /// 外部运动信号（或 observe_frame 的结果）
    pub fn observe_motion(&mut self, motion: bool, now: Instant) {
        if !motion {
            return;
        }
        self.last_motion_at = now;
        if self.state == EcoState::Idle {
            self.transition(EcoState::Alert, now, "motion");
        }
    }

    pub fn confirm_open(&mut self, now: Instant) {
        self.last_confirmed_at = Some(now);
        self.transition(EcoState::Active, now, "open confirmed");
    }

    /// 基于超时的降级；zone_active 为真时不会降到 IDLE
    pub fn update(&mut self, now: Instant, zone_active: bool) -> EcoState {
        match self.state {
            EcoState::Active => {
                let since = self.last_confirmed_at.unwrap_or(self.state_since);
                if now.saturating_duration_since(since) > self.settings.alert_timeout() {
                    self.transition(EcoState::Alert, now, "no confirmed detection");
                }
            }
            EcoState::Alert => {
                let quiet = now.saturating_duration_since(self.last_motion_at);
                if quiet > self.settings.idle_timeout() {
                    if zone_active {
                        tracing::debug!(
                            "Eco state for {} held at alert: zone still active",
                            self.source_id
                        );
                    } else {
                        self.transition(EcoState::Idle, now, "no motion");
                    }
                }
            }
            EcoState::Idle => {}
        }
        self.state
    }

    pub fn status(&self, now: Instant) -> EcoStatus {
        EcoStatus {
            source_id: self.source_id.clone(),
            state: self.state,
            profile: self.profile().clone(),
            since_motion: now.saturating_duration_since(self.last_motion_at),
            since_detection: self
                .last_confirmed_at
                .map(|at| now.saturating_duration_since(at)),
            in_state_for: now.saturating_duration_since(self.state_since),
            last_motion_ratio: self.last_reading.ratio,
            motion_threshold: self.settings.motion.motion_threshold,
        }
    }

    pub fn time_in_state(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.state_since)
    }
}
