//! アプリケーション設定管理モジュール
//!
//! データセット・バックボーン・学習・キャッシュの設定をJSON形式で保存・読み込みします。

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::ml::backbone::BackboneConfig;
use crate::ml::training::TrainingConfig;

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド（`wgpu` フィーチャー有効時のみ）
    Wgpu,
    /// NdArray (CPU) バックエンド
    #[default]
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// データセット設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetSettings {
    /// マニフェスト（CSV）のパス
    pub manifest_path: PathBuf,
    /// 画像のルートディレクトリ
    pub image_root: PathBuf,
    /// 学習サブセットのタグ
    pub train_tag: String,
    /// 検証サブセットのタグ
    pub validation_tag: String,
    /// マニフェストの相対パスから取り除く先頭要素数
    pub strip_components: usize,
}

impl Default for DatasetSettings {
    fn default() -> Self {
        Self {
            manifest_path: PathBuf::from("data/labels.csv"),
            image_root: PathBuf::from("data/image"),
            train_tag: "T".to_string(),
            validation_tag: "V".to_string(),
            strip_components: 1,
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// 画像読み込みのワーカー数
    pub num_workers: usize,
    /// 学習率
    pub learning_rate: f64,
    /// ランダムシード
    pub seed: u64,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 20,
            batch_size: 8,
            num_workers: 4,
            learning_rate: 1e-2,
            seed: 42,
        }
    }
}

impl TrainingSettings {
    pub fn training_config(&self) -> TrainingConfig {
        TrainingConfig::new()
            .with_num_epochs(self.num_epochs)
            .with_batch_size(self.batch_size)
            .with_learning_rate(self.learning_rate)
            .with_seed(self.seed)
    }
}

/// 埋め込みキャッシュ設定
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    /// キャッシュディレクトリ
    pub dir: PathBuf,
    /// 検証・推論時にもキャッシュを使う
    pub apply_to_evaluation: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("workspace/embeddings"),
            apply_to_evaluation: true,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 計算デバイスの種類
    #[serde(default)]
    pub device_type: DeviceType,
    #[serde(default)]
    pub dataset: DatasetSettings,
    /// バックボーン設定
    #[serde(default = "BackboneConfig::new")]
    pub backbone: BackboneConfig,
    #[serde(default)]
    pub training: TrainingSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    /// 学習済みモデルの保存先
    #[serde(default = "default_model_path")]
    pub model_path: PathBuf,
    /// ログファイル（追記）
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
}

fn default_model_path() -> PathBuf {
    PathBuf::from("models/damage_classifier.tar.gz")
}

fn default_log_path() -> PathBuf {
    PathBuf::from("log.txt")
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device_type: DeviceType::default(),
            dataset: DatasetSettings::default(),
            backbone: BackboneConfig::new(),
            training: TrainingSettings::default(),
            cache: CacheSettings::default(),
            model_path: default_model_path(),
            log_path: default_log_path(),
        }
    }
}

impl AppConfig {
    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: AppConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// 設定を読み込む、存在しない・読めない場合はデフォルト設定を返す
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    tracing::info!("loaded config file: {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("{:#}; using default settings", e);
                    Self::default()
                }
            }
        } else {
            tracing::info!("config file {} not found; using default settings", path.display());
            Self::default()
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// 設定情報を表示
    pub fn display(&self) {
        println!("=== アプリケーション設定 ===");
        println!("計算デバイス: {}", self.device_type);
        println!("マニフェスト: {}", self.dataset.manifest_path.display());
        println!("画像ルート: {}", self.dataset.image_root.display());
        println!(
            "サブセットタグ: 学習={} / 検証={}",
            self.dataset.train_tag, self.dataset.validation_tag
        );
        println!("モデルパス: {}", self.model_path.display());
        println!("\n--- バックボーン設定 ---");
        println!("入力サイズ: {}x{}", self.backbone.image_size, self.backbone.image_size);
        println!("チャネル数: {:?}", self.backbone.channels);
        match &self.backbone.weights_path {
            Some(weights) => println!("重み: {}", weights),
            None => println!("重み: シード {} から生成", self.backbone.seed),
        }
        println!("\n--- トレーニング設定 ---");
        println!("エポック数: {}", self.training.num_epochs);
        println!("バッチサイズ: {}", self.training.batch_size);
        println!("学習率: {}", self.training.learning_rate);
        println!("シード: {}", self.training.seed);
        println!("\n--- キャッシュ設定 ---");
        println!("有効: {}", self.cache.enabled);
        println!("ディレクトリ: {}", self.cache.dir.display());
        println!("========================\n");
    }
}
