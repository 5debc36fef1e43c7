//! 帧间运动估计
//!
//! 缩放到固定尺寸灰度图 -> 高斯模糊 -> 与参考帧求差并二值化 -> 开运算 + 膨胀去噪
//! -> 八连通区域标记，只统计面积足够的区域 -> 运动面积占比超过阈值即为运动。
//! 参考帧按 alpha 缓慢融合当前帧，光照渐变不会被当作运动。

use std::collections::HashMap;

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::region_labelling::{connected_components, Connectivity};
use serde::{Deserialize, Serialize};

/// [eco.motion] 段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionSettings {
    pub width: u32,
    pub height: u32,
    pub blur_sigma: f32,
    /// 像素差阈值
    pub pixel_threshold: u8,
    /// 单个区域最小面积（像素）
    pub min_area: usize,
    /// 运动面积占比阈值
    pub motion_threshold: f64,
    /// 参考帧学习率
    pub alpha: f32,
    /// 开运算半径（LInf）
    pub morph_radius: u8,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            blur_sigma: 3.5,
            pixel_threshold: 25,
            min_area: 500,
            motion_threshold: 0.02,
            alpha: 0.1,
            morph_radius: 2,
        }
    }
}

/// 单帧估计结果
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MotionReading {
    pub motion: bool,
    /// 有效运动面积 / 帧面积
    pub ratio: f64,
    /// 通过面积过滤的区域数
    pub regions: usize,
}

#[derive(Debug, Clone)]
pub struct MotionEstimator {
    settings: MotionSettings,
    reference: Option<Vec<f32>>,
    /// 参考帧对应的原始帧尺寸；变化时重建参考帧
    source_dims: (u32, u32),
}

impl MotionEstimator {
    pub fn new(settings: MotionSettings) -> Self {
        Self {
            settings,
            reference: None,
            source_dims: (0, 0),
        }
    }

    pub fn reset(&mut self) {
        self.reference = None;
    }

    fn prepare(&self, frame: &DynamicImage) -> GrayImage {
        let gray = frame
            .resize_exact(self.settings.width, self.settings.height, FilterType::Triangle)
            .to_luma8();
        imageproc::filter::gaussian_blur_f32(&gray, self.settings.blur_sigma.max(0.1))
    }

    pub fn estimate(&mut self, frame: &DynamicImage) -> MotionReading {
        if frame.width() == 0 || frame.height() == 0 {
            return MotionReading::default();
        }
        let blurred = self.prepare(frame);
        let dims = (frame.width(), frame.height());

        let reseed = match &self.reference {
            Some(reference) => {
                self.source_dims != dims || reference.len() != blurred.as_raw().len()
            }
            None => true,
        };
        if reseed {
            tracing::debug!("Motion reference seeded at {}x{}", dims.0, dims.1);
            self.reference = Some(blurred.as_raw().iter().map(|&p| p as f32).collect());
            self.source_dims = dims;
            return MotionReading::default();
        }
        let Some(reference) = self.reference.as_mut() else {
            return MotionReading::default();
        };

        let threshold = self.settings.pixel_threshold as f32;
        let mask: Vec<u8> = blurred
            .as_raw()
            .iter()
            .zip(reference.iter())
            .map(|(&p, &r)| if (p as f32 - r).abs() > threshold { 255 } else { 0 })
            .collect();

        let alpha = self.settings.alpha.clamp(0.0, 1.0);
        for (r, &p) in reference.iter_mut().zip(blurred.as_raw().iter()) {
            *r = p as f32 * alpha + *r * (1.0 - alpha);
        }

        let (width, height) = blurred.dimensions();
        let Some(mask) = GrayImage::from_raw(width, height, mask) else {
            return MotionReading::default();
        };
        let radius = self.settings.morph_radius;
        let opened = imageproc::morphology::open(&mask, Norm::LInf, radius);
        let cleaned = imageproc::morphology::dilate(&opened, Norm::LInf, radius.saturating_mul(2));

        let labeled = connected_components(&cleaned, Connectivity::Eight, Luma([0u8]));
        let mut area_by_label: HashMap<u32, usize> = HashMap::new();
        for pixel in labeled.pixels() {
            let label = pixel.0[0];
            if label != 0 {
                *area_by_label.entry(label).or_insert(0) += 1;
            }
        }
        let accepted: Vec<usize> = area_by_label
            .into_values()
            .filter(|area| *area > self.settings.min_area)
            .collect();
        let area: usize = accepted.iter().sum();
        let ratio = area as f64 / (width as f64 * height as f64);
        let motion = ratio > self.settings.motion_threshold;
        if motion {
            tracing::debug!(
                "Motion detected: {:.1}% of frame in {} region(s)",
                ratio * 100.0,
                accepted.len()
            );
        }
        MotionReading {
            motion,
            ratio,
            regions: accepted.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};

    use super::*;

    fn black(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::new(width, height))
    }

    fn with_white_block(width: u32, height: u32, size: u32) -> DynamicImage {
        let mut img = RgbImage::new(width, height);
        for y in 60..60 + size {
            for x in 100..100 + size {
                img.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn test_first_frame_seeds_reference() {
        let mut estimator = MotionEstimator::new(MotionSettings::default());
        assert!(!estimator.estimate(&with_white_block(320, 240, 100)).motion);
    }

    #[test]
    fn test_static_scene_has_no_motion() {
        let mut estimator = MotionEstimator::new(MotionSettings::default());
        estimator.estimate(&black(320, 240));
        for _ in 0..5 {
            let reading = estimator.estimate(&black(320, 240));
            assert!(!reading.motion);
            assert_eq!(reading.ratio, 0.0);
        }
    }

    #[test]
    fn test_large_block_is_motion() {
        let mut estimator = MotionEstimator::new(MotionSettings::default());
        estimator.estimate(&black(320, 240));
        let reading = estimator.estimate(&with_white_block(320, 240, 100));
        assert!(reading.motion);
        assert!(reading.ratio > 0.02);
        assert_eq!(reading.regions, 1);
    }

    #[test]
    fn test_small_speck_filtered_by_area() {
        let mut estimator = MotionEstimator::new(MotionSettings::default());
        estimator.estimate(&black(320, 240));
        let reading = estimator.estimate(&with_white_block(320, 240, 6));
        assert!(!reading.motion);
    }

    #[test]
    fn test_size_change_reseeds() {
        let mut estimator = MotionEstimator::new(MotionSettings::default());
        estimator.estimate(&black(320, 240));
        let reading = estimator.estimate(&with_white_block(640, 480, 200));
        assert!(!reading.motion);
        let reading = estimator.estimate(&with_white_block(640, 480, 200));
        assert!(!reading.motion);
    }
}
