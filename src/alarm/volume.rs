//! 按时段调整音量（白天 / 夜间倍率），在播放时计算而不是写进阶段配置

use chrono::Timelike;
use serde::{Deserialize, Serialize};

/// [alarm.volume] 段：夜间区间 [night_start_hour, night_end_hour)，可跨午夜
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeSchedule {
    pub day_volume: f32,
    pub night_volume: f32,
    pub night_start_hour: u32,
    pub night_end_hour: u32,
}

impl Default for VolumeSchedule {
    fn default() -> Self {
        Self {
            day_volume: 0.8,
            night_volume: 0.5,
            night_start_hour: 20,
            night_end_hour: 8,
        }
    }
}

impl VolumeSchedule {
    pub fn is_night(&self, hour: u32) -> bool {
        let (start, end) = (self.night_start_hour % 24, self.night_end_hour % 24);
        if start <= end {
            hour >= start && hour < end
        } else {
            hour >= start || hour < end
        }
    }

    pub fn multiplier_at(&self, hour: u32) -> f32 {
        if self.is_night(hour) {
            self.night_volume
        } else {
            self.day_volume
        }
    }

    /// 本地时间的当前倍率
    pub fn current_multiplier(&self) -> f32 {
        self.multiplier_at(chrono::Local::now().hour())
    }

    /// 阶段音量 × 时段倍率，结果截断到 0..=1
    pub fn apply(&self, base_volume: f32) -> f32 {
        (base_volume * self.current_multiplier()).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_night_window_wraps_midnight() {
        let schedule = VolumeSchedule::default();
        assert!(schedule.is_night(20));
        assert!(schedule.is_night(23));
        assert!(schedule.is_night(0));
        assert!(schedule.is_night(7));
        assert!(!schedule.is_night(8));
        assert!(!schedule.is_night(19));
        assert_eq!(schedule.multiplier_at(3), 0.5);
        assert_eq!(schedule.multiplier_at(12), 0.8);
    }

    #[test]
    fn test_night_window_same_day() {
        let schedule = VolumeSchedule {
            night_start_hour: 1,
            night_end_hour: 5,
            ..Default::default()
        };
        assert!(!schedule.is_night(0));
        assert!(schedule.is_night(1));
        assert!(schedule.is_night(4));
        assert!(!schedule.is_night(5));
    }

    #[test]
    fn test_apply_is_clamped() {
        let schedule = VolumeSchedule {
            day_volume: 2.0,
            night_volume: 2.0,
            ..Default::default()
        };
        assert_eq!(schedule.apply(1.0), 1.0);
        assert_eq!(schedule.apply(0.0), 0.0);
    }
}
