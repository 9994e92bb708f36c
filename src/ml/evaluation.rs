//! 検証データでのモデル評価

use burn::tensor::backend::Backend;
use serde::Serialize;

use crate::error::{ClassifierError, Result};
use crate::logging::{report_failure, Milestone, MilestoneSink, Stage};
use crate::ml::label_codec::LabelCodec;
use crate::ml::pipeline::{Pipeline, TrainedModel};
use crate::types::{ImageRecord, Prediction};

/// クラスごとの正解率
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassAccuracy {
    pub label: String,
    pub correct: usize,
    /// このクラスを正解とするレコード数
    pub support: usize,
}

impl ClassAccuracy {
    pub fn accuracy(&self) -> f64 {
        if self.support == 0 {
            0.0
        } else {
            self.correct as f64 / self.support as f64
        }
    }
}

/// 評価結果
#[derive(Debug, Clone, Serialize)]
pub struct Metrics {
    /// クラスごとの正解率の単純平均
    pub macro_accuracy: f64,
    /// 集計対象レコードでの正解率
    pub micro_accuracy: f64,
    /// 検証データに現れた学習済みラベルのみ（ラベルキー順）
    pub per_class: Vec<ClassAccuracy>,
    /// 学習時に無かったラベルを持つため集計から除外したレコード数
    pub unseen_label_records: usize,
    pub predictions: Vec<Prediction>,
}

impl Metrics {
    /// 予測結果から指標を計算
    pub fn from_predictions(codec: &LabelCodec, predictions: Vec<Prediction>) -> Self {
        let per_class = per_class_accuracy(codec, &predictions);
        let total: usize = per_class.iter().map(|c| c.support).sum();
        let correct: usize = per_class.iter().map(|c| c.correct).sum();
        let unseen_label_records = predictions
            .iter()
            .filter(|p| p.actual_label.as_deref().is_some_and(|label| !codec.contains(label)))
            .count();

        Self {
            macro_accuracy: macro_accuracy(&per_class),
            micro_accuracy: if total == 0 { 0.0 } else { correct as f64 / total as f64 },
            per_class,
            unseen_label_records,
            predictions,
        }
    }
}

/// ラベルキーごとに正解数を集計
///
/// 正解ラベルの無い予測と、学習時に無かったラベルの予測は数えない。
pub fn per_class_accuracy(codec: &LabelCodec, predictions: &[Prediction]) -> Vec<ClassAccuracy> {
    let mut classes: Vec<ClassAccuracy> = codec
        .labels()
        .iter()
        .map(|label| ClassAccuracy {
            label: label.clone(),
            correct: 0,
            support: 0,
        })
        .collect();

    for prediction in predictions {
        let Some(actual) = prediction.actual_label.as_deref() else {
            continue;
        };
        let Ok(key) = codec.encode(actual) else {
            continue;
        };
        classes[key].support += 1;
        if prediction.predicted_label == actual {
            classes[key].correct += 1;
        }
    }

    classes.retain(|c| c.support > 0);
    classes
}

/// マクロ正解率（クラス数0なら0.0）
pub fn macro_accuracy(per_class: &[ClassAccuracy]) -> f64 {
    if per_class.is_empty() {
        return 0.0;
    }
    per_class.iter().map(ClassAccuracy::accuracy).sum::<f64>() / per_class.len() as f64
}

/// 検証サブセットでモデルを評価
///
/// 画像の読み込みに1枚でも失敗したら評価全体をエラーとします。
/// 学習時に無かったラベルのレコードは分類はしますが、正解率の集計からは除外します。
pub fn evaluate<B: Backend>(
    pipeline: &Pipeline<B>,
    model: &TrainedModel<B>,
    records: &[ImageRecord],
    sink: &dyn MilestoneSink,
) -> Result<Metrics> {
    report_failure(sink, Stage::Validation, evaluate_inner(pipeline, model, records, sink))
}

fn evaluate_inner<B: Backend>(
    pipeline: &Pipeline<B>,
    model: &TrainedModel<B>,
    records: &[ImageRecord],
    sink: &dyn MilestoneSink,
) -> Result<Metrics> {
    if records.is_empty() {
        return Err(ClassifierError::EmptyValidationSet);
    }
    for record in records {
        if record.label.is_none() {
            return Err(ClassifierError::MissingLabel(record.path.clone()));
        }
    }

    sink.emit(Milestone::ValidationStarted {
        records: records.len(),
    });

    let predictions = pipeline
        .transform(model, records)?
        .into_iter()
        .collect::<Result<Vec<Prediction>>>()?;

    for prediction in &predictions {
        sink.emit(Milestone::ImageEvaluated {
            image: crate::types::file_name_of(&prediction.path),
            actual: prediction.actual_label.clone().unwrap_or_default(),
            predicted: prediction.predicted_label.clone(),
        });
    }

    let metrics = Metrics::from_predictions(model.codec(), predictions);
    if metrics.unseen_label_records > 0 {
        tracing::warn!(
            "{} validation records have labels not seen during training and were excluded from accuracy",
            metrics.unseen_label_records
        );
    }
    sink.emit(Milestone::ValidationCompleted {
        macro_accuracy: metrics.macro_accuracy,
    });
    Ok(metrics)
}
