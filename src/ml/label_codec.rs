//! ラベル名 ⇔ クラスIDの変換
//!
//! 学習サブセットに現れた順にクラスIDを割り当てます。
//! 学習済みモデルと一緒に保存され、読み込み時に同じ対応関係を再現します。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{ClassifierError, Result};

/// ラベルコーデック
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct LabelCodec {
    labels: Vec<String>,
    index: HashMap<String, usize>,
}

impl LabelCodec {
    /// 初出順にキーを割り当てる
    pub fn fit<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut codec = Self {
            labels: Vec::new(),
            index: HashMap::new(),
        };
        for label in labels {
            let label = label.as_ref();
            if !codec.index.contains_key(label) {
                codec.index.insert(label.to_string(), codec.labels.len());
                codec.labels.push(label.to_string());
            }
        }
        codec
    }

    pub fn encode(&self, label: &str) -> Result<usize> {
        self.index
            .get(label)
            .copied()
            .ok_or_else(|| ClassifierError::UnknownLabel(label.to_string()))
    }

    pub fn decode(&self, key: usize) -> Result<&str> {
        self.labels
            .get(key)
            .map(String::as_str)
            .ok_or(ClassifierError::InvalidKey {
                key,
                len: self.labels.len(),
            })
    }

    pub fn contains(&self, label: &str) -> bool {
        self.index.contains_key(label)
    }

    /// クラス数
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// キー順のラベル一覧
    pub fn labels(&self) -> &[String] {
        &self.labels
    }
}

impl From<Vec<String>> for LabelCodec {
    fn from(labels: Vec<String>) -> Self {
        Self::fit(labels)
    }
}

impl From<LabelCodec> for Vec<String> {
    fn from(codec: LabelCodec) -> Self {
        codec.labels
    }
}
