//! 車両損傷画像分類器
//!
//! 凍結した畳み込みバックボーンで画像を埋め込みベクトルに変換し、
//! その上の線形ヘッドだけを学習する転移学習パイプラインです。
//!
//! 処理の流れ:
//! マニフェスト読み込み → 学習/検証サブセットに分割 → `Pipeline::fit` →
//! `evaluate` → `save_trained_model` →（別プロセス）`InferenceEngine::load` → `classify`

pub mod csv_loader;
pub mod error;
pub mod logging;
pub mod ml;
pub mod ml_commands;
pub mod model;
pub mod types;

pub use csv_loader::{load_manifest, records_for_subset, ManifestReader};
pub use error::{ClassifierError, Result};
pub use logging::{ConsoleFileSink, Milestone, MilestoneSink, RecordingSink, Stage};
pub use types::{ImageRecord, Prediction};
