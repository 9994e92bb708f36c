//! 特徴抽出バックボーン
//!
//! 学習済み（凍結）ネットワークを最終層の手前まで実行し、
//! 画像1枚ごとに固定長の埋め込みベクトルを生成します。

use burn::{
    config::Config,
    module::{Module, Param},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        Relu,
    },
    record::{BinFileRecorder, FullPrecisionSettings},
    tensor::{backend::Backend, Tensor},
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;
use std::path::PathBuf;

use crate::error::{self, ClassifierError};
use crate::ml::features::DecodedImage;

/// アーキテクチャ名（識別子の一部）
pub const BACKBONE_ARCH: &str = "conv3-gap";

/// 埋め込みベクトル
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding(Vec<f32>);

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.0
    }
}

/// バックボーンの入出力契約
pub trait Backbone {
    /// 設定と重みから決まる識別子（キャッシュキー・スキーマ検証に使用）
    fn identity(&self) -> &str;

    /// 入力画像サイズ（正方形）
    fn input_size(&self) -> usize;

    /// 埋め込みの次元数
    fn embedding_dim(&self) -> usize;

    /// 画像1枚の埋め込みを計算
    fn embed(&self, image: &DecodedImage) -> error::Result<Embedding>;
}

/// バックボーン設定
#[derive(Config, Debug)]
pub struct BackboneConfig {
    /// 入力画像サイズ（正方形）
    #[config(default = 64)]
    pub image_size: usize,
    /// 各畳み込み層の出力チャネル数
    #[config(default = "[16, 32, 64]")]
    pub channels: [usize; 3],
    /// 重みファイルが無い場合の初期化シード
    #[config(default = 42)]
    pub seed: u64,
    /// 学習済み重み（burnのbinレコード）
    pub weights_path: Option<String>,
}

impl BackboneConfig {
    /// Conv3後の特徴マップサイズ
    pub fn feature_map_size(&self) -> usize {
        // Conv (3x3, no padding): size -> size - 2
        // Pool (2x2, stride 2): size -> size / 2
        let after_conv1 = self.image_size.saturating_sub(2);
        let after_pool1 = after_conv1 / 2;
        let after_conv2 = after_pool1.saturating_sub(2);
        let after_pool2 = after_conv2 / 2;
        after_pool2.saturating_sub(2)
    }

    fn weights_file(&self) -> Option<PathBuf> {
        self.weights_path
            .as_ref()
            .map(|p| PathBuf::from(p).with_extension("bin"))
    }
}

#[derive(Serialize)]
struct BackboneFingerprint<'a> {
    arch: &'a str,
    image_size: usize,
    channels: [usize; 3],
    seed: Option<u64>,
    weights: Option<String>,
}

/// 畳み込み3層 + Global Average Pooling
#[derive(Module, Debug)]
pub struct FeatureNet<B: Backend> {
    conv1: Conv2d<B>,
    pool1: MaxPool2d,
    conv2: Conv2d<B>,
    pool2: MaxPool2d,
    conv3: Conv2d<B>,
    activation: Relu,
}

impl<B: Backend> FeatureNet<B> {
    /// シードから決定的に重みを生成
    fn seeded(config: &BackboneConfig, device: &B::Device) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let [c1, c2, c3] = config.channels;

        Self {
            conv1: seeded_conv([3, c1], &mut rng, device),
            pool1: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            conv2: seeded_conv([c1, c2], &mut rng, device),
            pool2: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            conv3: seeded_conv([c2, c3], &mut rng, device),
            activation: Relu::new(),
        }
    }

    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    ///
    /// # 戻り値
    /// - 埋め込み [batch_size, channels]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.conv1.forward(images);
        let x = self.activation.forward(x);
        let x = self.pool1.forward(x);

        let x = self.conv2.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool2.forward(x);

        let x = self.conv3.forward(x);
        let x = self.activation.forward(x);

        // Global Average Pooling
        let [batch_size, channels, _, _] = x.dims();
        x.mean_dim(3).mean_dim(2).reshape([batch_size, channels])
    }
}

/// He-uniform で重みを初期化した 3x3 畳み込み
fn seeded_conv<B: Backend>(channels: [usize; 2], rng: &mut StdRng, device: &B::Device) -> Conv2d<B> {
    let [in_channels, out_channels] = channels;
    let mut conv = Conv2dConfig::new(channels, [3, 3])
        .with_stride([1, 1])
        .init(device);

    let fan_in = in_channels * 9;
    let bound = (6.0 / fan_in as f32).sqrt();
    let weights: Vec<f32> = (0..out_channels * fan_in)
        .map(|_| rng.gen_range(-bound..bound))
        .collect();

    conv.weight = Param::from_tensor(
        Tensor::<B, 1>::from_floats(weights.as_slice(), device).reshape([out_channels, in_channels, 3, 3]),
    );
    conv.bias = Some(Param::from_tensor(Tensor::zeros([out_channels], device)));
    conv
}

/// burnで実装した凍結バックボーン
pub struct ConvBackbone<B: Backend> {
    net: FeatureNet<B>,
    config: BackboneConfig,
    identity: String,
    device: B::Device,
}

impl<B: Backend> ConvBackbone<B> {
    /// 設定からバックボーンを構築
    ///
    /// `weights_path` があればその重みを読み込み、無ければシードから生成します。
    pub fn new(config: &BackboneConfig, device: &B::Device) -> error::Result<Self> {
        if config.feature_map_size() == 0 {
            return Err(ClassifierError::Backbone(format!(
                "input size too small: {} (at least 18x18 required)",
                config.image_size
            )));
        }

        let net = FeatureNet::seeded(config, device);
        let (net, weights_digest) = match config.weights_file() {
            Some(file) => {
                let bytes = std::fs::read(&file).map_err(|e| {
                    ClassifierError::Backbone(format!("failed to read weights {}: {}", file.display(), e))
                })?;
                let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
                let net = net.load_file(file.clone(), &recorder, device).map_err(|e| {
                    ClassifierError::Backbone(format!("failed to load weights {}: {:?}", file.display(), e))
                })?;
                (net, Some(blake3::hash(&bytes).to_hex().to_string()))
            }
            None => (net, None),
        };

        let fingerprint = BackboneFingerprint {
            arch: BACKBONE_ARCH,
            image_size: config.image_size,
            channels: config.channels,
            // 重みファイルを使う場合はシードは結果に影響しない
            seed: weights_digest.is_none().then_some(config.seed),
            weights: weights_digest,
        };
        let fingerprint = serde_json::to_vec(&fingerprint)
            .map_err(|e| ClassifierError::Backbone(e.to_string()))?;
        let digest = blake3::hash(&fingerprint).to_hex().to_string();
        let identity = format!("{}-{}", BACKBONE_ARCH, &digest[..16]);

        tracing::debug!(identity = %identity, "backbone initialised");

        Ok(Self {
            net,
            config: config.clone(),
            identity,
            device: device.clone(),
        })
    }

    pub fn config(&self) -> &BackboneConfig {
        &self.config
    }
}

impl<B: Backend> Backbone for ConvBackbone<B> {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn input_size(&self) -> usize {
        self.config.image_size
    }

    fn embedding_dim(&self) -> usize {
        self.config.channels[2]
    }

    fn embed(&self, image: &DecodedImage) -> error::Result<Embedding> {
        let size = self.config.image_size;
        if image.size != size || image.data.len() != 3 * size * size {
            return Err(ClassifierError::Backbone(format!(
                "expected a {}x{} RGB image, got {} values at size {}",
                size,
                size,
                image.data.len(),
                image.size
            )));
        }

        // Tensorに変換 [1, 3, size, size]
        let tensor = Tensor::<B, 1>::from_floats(image.data.as_slice(), &self.device)
            .reshape([1, 3, size, size]);
        let output = self.net.forward(tensor);

        let values = output
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| ClassifierError::Backbone(format!("{:?}", e)))?;
        Ok(Embedding::new(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn image(size: usize, value: f32) -> DecodedImage {
        DecodedImage {
            size,
            data: vec![value; 3 * size * size],
        }
    }

    #[test]
    fn test_embedding_is_deterministic_for_same_config() {
        let device = Default::default();
        let config = BackboneConfig::new().with_image_size(24);
        let a = ConvBackbone::<TestBackend>::new(&config, &device).unwrap();
        let b = ConvBackbone::<TestBackend>::new(&config, &device).unwrap();

        assert_eq!(a.identity(), b.identity());
        let ea = a.embed(&image(24, 0.3)).unwrap();
        let eb = b.embed(&image(24, 0.3)).unwrap();
        assert_eq!(ea, eb);
        assert_eq!(ea.len(), a.embedding_dim());
    }

    #[test]
    fn test_identity_changes_with_config() {
        let device = Default::default();
        let a = ConvBackbone::<TestBackend>::new(&BackboneConfig::new().with_image_size(24), &device).unwrap();
        let b = ConvBackbone::<TestBackend>::new(&BackboneConfig::new().with_image_size(24).with_seed(7), &device)
            .unwrap();
        let c = ConvBackbone::<TestBackend>::new(&BackboneConfig::new().with_image_size(32), &device).unwrap();

        assert_ne!(a.identity(), b.identity());
        assert_ne!(a.identity(), c.identity());
    }

    #[test]
    fn test_too_small_input_is_rejected() {
        let device = Default::default();
        let result = ConvBackbone::<TestBackend>::new(&BackboneConfig::new().with_image_size(8), &device);
        assert!(matches!(result, Err(ClassifierError::Backbone(_))));
    }

    #[test]
    fn test_wrong_image_size_is_rejected() {
        let device = Default::default();
        let backbone = ConvBackbone::<TestBackend>::new(&BackboneConfig::new().with_image_size(24), &device).unwrap();
        assert!(backbone.embed(&image(16, 0.0)).is_err());
    }
}
