use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// データセットの1レコード（画像への参照）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub path: PathBuf,
    // 推論専用レコードでは None
    #[serde(default)]
    pub label: Option<String>,
    // 読み込み時の分割にのみ使用（モデルには保存しない）
    #[serde(default, skip_serializing)]
    pub subset: Option<String>,
}

impl ImageRecord {
    pub fn labeled(path: impl Into<PathBuf>, label: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            label: Some(label.into()),
            subset: None,
        }
    }

    /// ラベル無しのレコード（推論用）
    pub fn unlabeled(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            label: None,
            subset: None,
        }
    }

    pub fn file_name(&self) -> String {
        file_name_of(&self.path)
    }
}

/// 1レコード分の推論結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub path: PathBuf,
    pub actual_label: Option<String>,
    pub predicted_label: String,
    /// 予測クラスのsoftmax確率
    pub confidence: f32,
}

impl Prediction {
    pub fn is_correct(&self) -> Option<bool> {
        self.actual_label
            .as_ref()
            .map(|actual| actual == &self.predicted_label)
    }
}

pub(crate) fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}
