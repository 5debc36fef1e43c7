//! Doorwatch - 门禁区域监控与逐级报警
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: Monitor 主控、错误与恢复、事件投影、优雅关闭
//! - **detection**: 检测结果聚合为区域开 / 关 / 超时边沿
//! - **escalation**: 宽限期计时器与报警触发
//! - **alarm**: 分阶段报警循环、音频输出、外部通知
//! - **eco**: 运动检测驱动的节能调度
//! - **journal**: SQLite 事件日志
//! - **observability**: tracing 初始化

pub mod alarm;
pub mod config;
pub mod core;
pub mod detection;
pub mod eco;
pub mod escalation;
pub mod journal;
pub mod observability;

pub use crate::core::{Monitor, MonitorBuilder, MonitorEvent};
