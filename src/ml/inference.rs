//! モデル推論機能
//!
//! 保存済みアーティファクトだけから推論環境を再構築します。
//! バックボーンと前処理の設定はアーティファクトに含まれるため、学習時の設定は不要です。

use std::path::{Path, PathBuf};

use burn::tensor::backend::Backend;

use crate::error::Result;
use crate::logging::{report_failure, Milestone, MilestoneSink, Stage};
use crate::ml::embedding_cache::EmbeddingCache;
use crate::ml::pipeline::{Pipeline, TrainedModel};
use crate::model::model_metadata::image_record_columns;
use crate::model::model_storage::load_trained_model;
use crate::types::{file_name_of, ImageRecord, Prediction};

/// 推論エンジン
pub struct InferenceEngine<B: Backend> {
    pipeline: Pipeline<B>,
    model: TrainedModel<B>,
}

impl<B: Backend> InferenceEngine<B> {
    /// モデルを読み込んで推論エンジンを初期化
    pub fn load<P: AsRef<Path>>(
        model_path: P,
        cache: Option<EmbeddingCache>,
        num_workers: usize,
        device: &B::Device,
        sink: &dyn MilestoneSink,
    ) -> Result<Self> {
        let (model, _) = load_trained_model::<B>(model_path.as_ref(), &image_record_columns(), device, sink)?;
        let pipeline = report_failure(
            sink,
            Stage::ModelLoading,
            Pipeline::new(
                model.backbone_config(),
                model.training_config().clone(),
                cache,
                num_workers,
                device,
            ),
        )?;

        Ok(Self { pipeline, model })
    }

    pub fn model(&self) -> &TrainedModel<B> {
        &self.model
    }

    /// 複数画像をバッチ分類
    ///
    /// 読み込めない画像はその画像の結果だけがエラーになり、残りの画像は分類を続けます。
    /// 入力スキーマの不一致はバッチ全体のエラーです。
    pub fn classify(&self, image_paths: &[PathBuf], sink: &dyn MilestoneSink) -> Result<Vec<Result<Prediction>>> {
        sink.emit(Milestone::ClassifyingImages {
            count: image_paths.len(),
        });

        let records: Vec<ImageRecord> = image_paths.iter().map(ImageRecord::unlabeled).collect();
        let results = report_failure(sink, Stage::Classification, self.pipeline.transform(&self.model, &records))?;

        for (path, result) in image_paths.iter().zip(&results) {
            match result {
                Ok(prediction) => sink.emit(Milestone::ImageClassified {
                    image: file_name_of(path),
                    predicted: prediction.predicted_label.clone(),
                }),
                Err(e) => sink.emit(Milestone::ImageFailed {
                    image: file_name_of(path),
                    reason: e.to_string(),
                }),
            }
        }

        Ok(results)
    }
}
