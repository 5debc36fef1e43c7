//! 错误恢复引擎
//!
//! 根据 WatchError 类型返回 RecoveryAction：音频回退合成音、通知记录后继续、陈旧状态强制过期、配置缺失用默认值。

use crate::core::{RecoveryAction, WatchError};

/// 将错误分类映射为可执行动作；所有动作都是局部恢复，不向上传播
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &WatchError) -> RecoveryAction {
        let action = match err {
            WatchError::Audio(_) => RecoveryAction::FallbackTone,
            WatchError::Notify(_) | WatchError::Journal(_) => RecoveryAction::LogAndContinue,
            WatchError::OrphanedTimer { .. } | WatchError::StaleZone(_) => {
                RecoveryAction::ForceExpire
            }
            WatchError::MissingGrace(_)
            | WatchError::InvalidPhasePlan(_)
            | WatchError::Config(_) => RecoveryAction::UseDefault,
            WatchError::DuplicateTimer(_) => RecoveryAction::KeepEarliest,
        };

        match action {
            RecoveryAction::KeepEarliest => {
                tracing::error!("Invariant violation: {} -> {:?}", err, action);
            }
            RecoveryAction::LogAndContinue => {
                tracing::debug!("Recoverable fault: {} -> {:?}", err, action);
            }
            _ => {
                tracing::warn!("Recoverable fault: {} -> {:?}", err, action);
            }
        }
        action
    }
}
