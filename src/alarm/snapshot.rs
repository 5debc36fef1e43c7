//! 每个视频源最近一帧的 JPEG 快照，供通知附图

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::RwLock;

use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;

#[derive(Debug, Default)]
pub struct SnapshotStore {
    frames: RwLock<HashMap<String, Vec<u8>>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, source_id: &str, jpeg: Vec<u8>) {
        let mut frames = self.frames.write().unwrap_or_else(|e| e.into_inner());
        frames.insert(source_id.to_string(), jpeg);
    }

    pub fn latest(&self, source_id: &str) -> Option<Vec<u8>> {
        let frames = self.frames.read().unwrap_or_else(|e| e.into_inner());
        frames.get(source_id).cloned()
    }

    /// 只保留 keep 返回 true 的视频源
    pub fn retain(&self, mut keep: impl FnMut(&str) -> bool) {
        let mut frames = self.frames.write().unwrap_or_else(|e| e.into_inner());
        frames.retain(|source_id, _| {
            let kept = keep(source_id);
            if !kept {
                tracing::debug!("Snapshot for {} dropped", source_id);
            }
            kept
        });
    }

    pub fn len(&self) -> usize {
        self.frames.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 按给定质量编码 JPEG；编码失败返回 None
pub fn encode_jpeg(frame: &DynamicImage, quality: u8) -> Option<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
    match frame.to_rgb8().write_with_encoder(encoder) {
        Ok(()) => Some(buf.into_inner()),
        Err(e) => {
            tracing::warn!("Snapshot encode failed: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_and_replace() {
        let store = SnapshotStore::new();
        assert!(store.latest("cam1").is_none());
        store.store("cam1", vec![1, 2, 3]);
        store.store("cam1", vec![4]);
        assert_eq!(store.latest("cam1"), Some(vec![4]));
        store.store("cam2", vec![5]);
        store.retain(|source| source == "cam2");
        assert!(store.latest("cam1").is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_encode_jpeg_produces_jpeg_magic() {
        let frame = DynamicImage::new_rgb8(32, 24);
        let jpeg = encode_jpeg(&frame, 60).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }
}
