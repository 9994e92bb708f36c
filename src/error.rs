//! エラー型の定義
//!
//! 学習・評価・永続化・推論の各段階で発生するエラーを1つの列挙型にまとめます。

use std::path::PathBuf;

use thiserror::Error;

/// 分類器のエラー
#[derive(Error, Debug)]
pub enum ClassifierError {
    /// マニフェストの行が必要な列数を満たしていない
    #[error("manifest line {line}: expected at least {expected} fields, found {found}")]
    ManifestFormat {
        line: u64,
        expected: usize,
        found: usize,
    },

    /// 画像の読み込み失敗（存在しない・読めない・壊れている）
    #[error("failed to read image '{path}': {reason}")]
    ImageRead { path: PathBuf, reason: String },

    /// 学習時に見ていないラベルをエンコードしようとした
    #[error("label '{0}' was not seen when the label codec was fit")]
    UnknownLabel(String),

    /// 学習済み範囲外のキー
    #[error("label key {key} is out of range (codec has {len} labels)")]
    InvalidKey { key: usize, len: usize },

    /// ラベルの無いレコードを学習・評価に渡した
    #[error("record '{0}' has no label")]
    MissingLabel(PathBuf),

    #[error("training subset is empty")]
    EmptyTrainingSet,

    /// 2クラス未満では分類器を学習できない
    #[error("training subset has {0} distinct label(s); at least 2 are required")]
    SingleClass(usize),

    #[error("validation subset is empty")]
    EmptyValidationSet,

    /// fit時とtransform時で特徴量のレイアウトが一致しない
    #[error("input schema mismatch: {0}")]
    InputSchema(String),

    /// アーティファクトを解析できない
    #[error("model artifact '{path}' is corrupt: {reason}")]
    ArtifactCorrupt { path: PathBuf, reason: String },

    /// アーティファクトの入力スキーマが呼び出し側の期待と異なる
    #[error("model artifact schema mismatch: expected {expected}, found {found}")]
    SchemaMismatch { expected: String, found: String },

    /// バックボーンの初期化・推論エラー
    #[error("backbone error: {0}")]
    Backbone(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClassifierError {
    pub(crate) fn image_read(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::ImageRead {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::ArtifactCorrupt {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClassifierError>;
