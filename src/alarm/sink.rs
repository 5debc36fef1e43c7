//! 音频输出：素材 / 合成音两种片段，AudioSink 抽象外部音频设备
//!
//! 设备是共享资源，多区域并发播放时的混音或覆盖由设备自己决定。

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::core::AudioError;

const TONE_SAMPLE_RATE: u32 = 22_050;

/// 合成提示音（单声道正弦波）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tone {
    pub frequency_hz: f32,
    pub duration: Duration,
    pub sample_rate: u32,
}

impl Tone {
    /// 按严重程度选音高与时长：0 = 友好，最后一级 = 危急，其余为中等
    pub fn for_severity(phase_index: usize, total_phases: usize) -> Self {
        let (frequency_hz, millis) = if total_phases > 1 && phase_index + 1 >= total_phases {
            (880.0, 300)
        } else if phase_index == 0 {
            (440.0, 100)
        } else {
            (660.0, 200)
        };
        Self {
            frequency_hz,
            duration: Duration::from_millis(millis),
            sample_rate: TONE_SAMPLE_RATE,
        }
    }

    /// 16 位 PCM 采样
    pub fn samples(&self) -> Vec<i16> {
        let frames = (self.duration.as_secs_f32() * self.sample_rate as f32) as usize;
        (0..frames)
            .map(|i| {
                let t = i as f32 / self.sample_rate as f32;
                let v = (2.0 * std::f32::consts::PI * self.frequency_hz * t).sin();
                (v * i16::MAX as f32) as i16
            })
            .collect()
    }
}

/// 一次播放的内容
#[derive(Debug, Clone, PartialEq)]
pub enum AudioClip {
    Asset(PathBuf),
    Tone(Tone),
}

/// 外部音频设备
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn play(&self, clip: &AudioClip, volume: f32) -> Result<(), AudioError>;

    /// 停止当前播放（释放设备）；默认无操作
    async fn stop(&self) {}

    fn name(&self) -> &'static str;
}

/// 只写日志的音频输出（无声卡环境 / 调试）
#[derive(Debug, Default)]
pub struct LogAudioSink;

#[async_trait]
impl AudioSink for LogAudioSink {
    async fn play(&self, clip: &AudioClip, volume: f32) -> Result<(), AudioError> {
        match clip {
            AudioClip::Asset(path) => {
                tracing::info!("Play asset {} at volume {:.2}", path.display(), volume)
            }
            AudioClip::Tone(tone) => tracing::info!(
                "Play tone {}Hz for {}ms at volume {:.2}",
                tone.frequency_hz,
                tone.duration.as_millis(),
                volume
            ),
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// 调用外部播放器命令
///
/// - 素材：`asset_command` 后追加文件路径，`{volume}` 参数替换为 0..=1 的音量
/// - 合成音：把 16 位小端 PCM 写入 `tone_command` 的标准输入（如 `aplay -q -f S16_LE -r 22050 -c 1`）
#[derive(Debug, Clone)]
pub struct CommandAudioSink {
    asset_command: Vec<String>,
    tone_command: Vec<String>,
    timeout: Duration,
}

impl CommandAudioSink {
    pub fn new(asset_command: Vec<String>, tone_command: Vec<String>, timeout: Duration) -> Self {
        Self {
            asset_command,
            tone_command,
            timeout,
        }
    }

    fn command(parts: &[String], volume: f32) -> Result<tokio::process::Command, AudioError> {
        let (program, args) = parts
            .split_first()
            .ok_or_else(|| AudioError::PlayerFailed("empty player command".to_string()))?;
        let mut cmd = tokio::process::Command::new(program);
        for arg in args {
            cmd.arg(
                arg.replace("{volume_pct}", &format!("{}", (volume * 100.0).round() as u32))
                    .replace("{volume}", &format!("{:.2}", volume)),
            );
        }
        cmd.stdout(Stdio::null()).stderr(Stdio::null()).kill_on_drop(true);
        Ok(cmd)
    }

    async fn run(&self, mut child: tokio::process::Child) -> Result<(), AudioError> {
        match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(AudioError::PlayerFailed(format!("exit status {}", status))),
            Ok(Err(e)) => Err(AudioError::Io(e)),
            Err(_) => {
                let _ = child.kill().await;
                Err(AudioError::PlayerFailed(format!(
                    "player timed out after {}ms",
                    self.timeout.as_millis()
                )))
            }
        }
    }
}

#[async_trait]
impl AudioSink for CommandAudioSink {
    async fn play(&self, clip: &AudioClip, volume: f32) -> Result<(), AudioError> {
        match clip {
            AudioClip::Asset(path) => {
                if !path.exists() {
                    return Err(AudioError::AssetMissing(path.display().to_string()));
                }
                let mut cmd = Self::command(&self.asset_command, volume)?;
                cmd.arg(path);
                let child = cmd.spawn()?;
                self.run(child).await
            }
            AudioClip::Tone(tone) => {
                let mut cmd = Self::command(&self.tone_command, volume)?;
                cmd.stdin(Stdio::piped());
                let mut child = cmd.spawn()?;
                let bytes: Vec<u8> = tone
                    .samples()
                    .into_iter()
                    .map(|s| (s as f32 * volume) as i16)
                    .flat_map(|s| s.to_le_bytes())
                    .collect();
                if let Some(mut stdin) = child.stdin.take() {
                    stdin.write_all(&bytes).await?;
                    stdin.shutdown().await?;
                }
                self.run(child).await
            }
        }
    }

    fn name(&self) -> &'static str {
        "command"
    }
}
