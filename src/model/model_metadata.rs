//! モデルメタデータの定義
//!
//! tar.gz形式のアーティファクトに `metadata.json` として保存される情報と、
//! 学習時と推論時で共通の入力レイアウト（入力スキーマ）を定義します。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ml::backbone::BackboneConfig;
use crate::ml::features::FeatureStageConfig;
use crate::ml::head::HeadConfig;
use crate::ml::label_codec::LabelCodec;
use crate::ml::training::{TrainingConfig, TrainingSummary};

/// 現在のアーティファクト形式のバージョン
pub const FORMAT_VERSION: u32 = 1;

/// 入力列の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    /// 画像ファイルへのパス
    ImagePath,
    Text,
}

/// 入力列
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaColumn {
    pub name: String,
    pub kind: ColumnKind,
}

impl SchemaColumn {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

impl fmt::Display for SchemaColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:?}", self.name, self.kind)
    }
}

/// `ImageRecord` に対応する入力列 `[path, label]`
pub fn image_record_columns() -> Vec<SchemaColumn> {
    vec![
        SchemaColumn::new("path", ColumnKind::ImagePath),
        SchemaColumn::new("label", ColumnKind::Text),
    ]
}

pub(crate) fn describe_columns(columns: &[SchemaColumn]) -> String {
    let names: Vec<String> = columns.iter().map(ToString::to_string).collect();
    format!("[{}]", names.join(", "))
}

/// 入力スキーマ
///
/// fit時の特徴量レイアウトを記録し、transform時に同じレイアウトであることを検証します。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSchema {
    pub columns: Vec<SchemaColumn>,
    /// バックボーン識別子（設定と重みのハッシュ）
    pub backbone_identity: String,
    /// バックボーンへの入力サイズ
    pub image_size: usize,
    pub embedding_dim: usize,
}

/// アーティファクトのメタデータ
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub format_version: u32,

    /// キー順のラベル一覧
    pub labels: LabelCodec,

    pub input_schema: InputSchema,

    /// 前処理設定（入力サイズ・正規化パラメータ）
    pub feature_stage: FeatureStageConfig,

    /// バックボーン設定（推論時に同じバックボーンを再構築する）
    pub backbone: BackboneConfig,

    pub head: HeadConfig,

    pub training: TrainingConfig,

    pub summary: TrainingSummary,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ArtifactMetadata {
    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> ArtifactMetadata {
        ArtifactMetadata {
            format_version: FORMAT_VERSION,
            labels: LabelCodec::fit(["dent", "scratch"]),
            input_schema: InputSchema {
                columns: image_record_columns(),
                backbone_identity: "conv3-gap-0123456789abcdef".to_string(),
                image_size: 32,
                embedding_dim: 64,
            },
            feature_stage: FeatureStageConfig::new(32),
            backbone: BackboneConfig::new().with_image_size(32),
            head: HeadConfig::new(64, 2),
            training: TrainingConfig::new(),
            summary: TrainingSummary {
                epochs_completed: 20,
                final_loss: Some(0.25),
                final_accuracy: Some(1.0),
                stopped_early: false,
            },
            trained_at: chrono::Local::now().to_rfc3339(),
        }
    }

    #[test]
    fn test_json_roundtrip() {
        let original = metadata();
        let json = original.to_json_string().unwrap();
        let restored = ArtifactMetadata::from_json_string(&json).unwrap();

        assert_eq!(restored.labels, original.labels);
        assert_eq!(restored.input_schema, original.input_schema);
        assert_eq!(restored.feature_stage, original.feature_stage);
        assert_eq!(restored.backbone.image_size, 32);
        assert_eq!(restored.head.num_classes, 2);
        assert_eq!(restored.summary, original.summary);
    }

    #[test]
    fn test_labels_are_stored_in_key_order() {
        let json = metadata().to_json_string().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["labels"], serde_json::json!(["dent", "scratch"]));
        assert_eq!(value["input_schema"]["columns"][0]["kind"], "image_path");
    }

    #[test]
    fn test_describe_columns() {
        assert_eq!(
            describe_columns(&image_record_columns()),
            "[path:ImagePath, label:Text]"
        );
    }
}
