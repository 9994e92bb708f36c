//! 画像の読み込みと前処理
//!
//! 画像パス → 生バイト列 → 正規化済みテンソルデータ (C, H, W) の変換を行います。

use image::imageops::FilterType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ClassifierError, Result};

/// ImageNetの平均
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNetの標準偏差
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// 前処理設定（学習済みモデルと一緒に保存される）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureStageConfig {
    /// バックボーンへの入力サイズ（正方形）
    pub image_size: usize,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl FeatureStageConfig {
    pub fn new(image_size: usize) -> Self {
        Self {
            image_size,
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
        }
    }
}

/// 読み込んだままの画像バイト列
#[derive(Debug, Clone)]
pub struct RawImage {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
}

impl RawImage {
    /// 内容のフィンガープリント（キャッシュキー用）
    pub fn fingerprint(&self) -> String {
        blake3::hash(&self.bytes).to_hex().to_string()
    }
}

/// 正規化済みRGB画像データ (C, H, W) の順で平坦化
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub size: usize,
    pub data: Vec<f32>,
}

/// 画像ファイルを読み込む
pub fn extract(path: &Path) -> Result<RawImage> {
    let bytes = std::fs::read(path).map_err(|e| ClassifierError::image_read(path, e))?;
    if bytes.is_empty() {
        return Err(ClassifierError::image_read(path, "file is empty"));
    }
    Ok(RawImage {
        path: path.to_path_buf(),
        bytes,
    })
}

/// デコード・リサイズして正規化
pub fn decode(raw: &RawImage, config: &FeatureStageConfig) -> Result<DecodedImage> {
    let img = image::load_from_memory(&raw.bytes)
        .map_err(|e| ClassifierError::image_read(&raw.path, e))?;

    let size = config.image_size as u32;
    let img = if img.width() == size && img.height() == size {
        img.to_rgb8()
    } else {
        img.resize_exact(size, size, FilterType::Triangle).to_rgb8()
    };

    let mut data = Vec::with_capacity(3 * config.image_size * config.image_size);
    for channel in 0..3 {
        for y in 0..size {
            for x in 0..size {
                let pixel = img.get_pixel(x, y);
                let value = pixel[channel] as f32 / 255.0;
                data.push((value - config.mean[channel]) / config.std[channel]);
            }
        }
    }

    Ok(DecodedImage {
        size: config.image_size,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_decode_resizes_and_normalizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("white.png");
        RgbImage::from_pixel(20, 10, Rgb([255, 255, 255])).save(&path).unwrap();

        let raw = extract(&path).unwrap();
        let decoded = decode(&raw, &FeatureStageConfig::new(8)).unwrap();

        assert_eq!(decoded.data.len(), 3 * 8 * 8);
        let expected_red = (1.0 - IMAGENET_MEAN[0]) / IMAGENET_STD[0];
        assert!((decoded.data[0] - expected_red).abs() < 1e-5);
        let expected_blue = (1.0 - IMAGENET_MEAN[2]) / IMAGENET_STD[2];
        assert!((decoded.data[2 * 64] - expected_blue).abs() < 1e-5);
    }

    #[test]
    fn test_missing_and_corrupt_images_are_image_read_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.jpg");
        assert!(matches!(extract(&missing), Err(ClassifierError::ImageRead { .. })));

        let corrupt = dir.path().join("corrupt.jpg");
        std::fs::write(&corrupt, b"definitely not a jpeg").unwrap();
        let raw = extract(&corrupt).unwrap();
        assert!(matches!(
            decode(&raw, &FeatureStageConfig::new(8)),
            Err(ClassifierError::ImageRead { .. })
        ));
    }

    #[test]
    fn test_fingerprint_follows_content() {
        let a = RawImage { path: "a.jpg".into(), bytes: vec![1, 2, 3] };
        let b = RawImage { path: "b.jpg".into(), bytes: vec![1, 2, 3] };
        let c = RawImage { path: "a.jpg".into(), bytes: vec![1, 2, 4] };
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }
}
