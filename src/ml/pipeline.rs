//! 学習・推論パイプライン
//!
//! 画像 → 埋め込み → ヘッド → ラベル の順序付きパイプラインです。
//! `fit` で得られる状態はすべて不変の `TrainedModel` にまとめられ、
//! `transform` はモデルを読み取るだけで変更しません。

use burn::tensor::backend::{AutodiffBackend, Backend};

use crate::error::{ClassifierError, Result};
use crate::logging::{report_failure, Milestone, MilestoneSink, Stage};
use crate::ml::backbone::{Backbone, BackboneConfig, ConvBackbone, Embedding};
use crate::ml::embedder::Embedder;
use crate::ml::embedding_cache::EmbeddingCache;
use crate::ml::features::FeatureStageConfig;
use crate::ml::head::{ClassificationHead, HeadConfig};
use crate::ml::label_codec::LabelCodec;
use crate::ml::training::{train_head, MetricsCallback, TrainingConfig, TrainingSummary};
use crate::model::model_metadata::{describe_columns, image_record_columns, InputSchema};
use crate::types::{ImageRecord, Prediction};

/// ヘッドに一度に渡す埋め込み数
const SCORE_BATCH_SIZE: usize = 256;

/// 学習済みモデル（不変）
#[derive(Debug)]
pub struct TrainedModel<B: Backend> {
    codec: LabelCodec,
    feature_stage: FeatureStageConfig,
    backbone: BackboneConfig,
    head_config: HeadConfig,
    head: ClassificationHead<B>,
    input_schema: InputSchema,
    training: TrainingConfig,
    summary: TrainingSummary,
    trained_at: String,
}

impl<B: Backend> TrainedModel<B> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        codec: LabelCodec,
        feature_stage: FeatureStageConfig,
        backbone: BackboneConfig,
        head_config: HeadConfig,
        head: ClassificationHead<B>,
        input_schema: InputSchema,
        training: TrainingConfig,
        summary: TrainingSummary,
        trained_at: String,
    ) -> Self {
        Self {
            codec,
            feature_stage,
            backbone,
            head_config,
            head,
            input_schema,
            training,
            summary,
            trained_at,
        }
    }

    pub fn codec(&self) -> &LabelCodec {
        &self.codec
    }

    pub fn feature_stage(&self) -> &FeatureStageConfig {
        &self.feature_stage
    }

    pub fn backbone_config(&self) -> &BackboneConfig {
        &self.backbone
    }

    pub fn head_config(&self) -> &HeadConfig {
        &self.head_config
    }

    pub fn head(&self) -> &ClassificationHead<B> {
        &self.head
    }

    pub fn input_schema(&self) -> &InputSchema {
        &self.input_schema
    }

    pub fn training_config(&self) -> &TrainingConfig {
        &self.training
    }

    pub fn summary(&self) -> &TrainingSummary {
        &self.summary
    }

    /// 学習時刻（RFC3339）
    pub fn trained_at(&self) -> &str {
        &self.trained_at
    }
}

/// 特徴抽出 + ヘッド学習のパイプライン
pub struct Pipeline<B: Backend> {
    embedder: Embedder,
    backbone_config: BackboneConfig,
    training: TrainingConfig,
    device: B::Device,
    cache_for_transform: bool,
}

impl<B: Backend> Pipeline<B> {
    /// バックボーンを構築してパイプラインを作成
    ///
    /// `cache` を渡すと学習時の埋め込みはキャッシュを経由します。
    /// `transform` でも使うかどうかは `with_cache_for_transform` で切り替えます。
    pub fn new(
        backbone_config: &BackboneConfig,
        training: TrainingConfig,
        cache: Option<EmbeddingCache>,
        num_workers: usize,
        device: &B::Device,
    ) -> Result<Self> {
        let backbone = ConvBackbone::<B>::new(backbone_config, device)?;
        let embedder = Embedder::new(Box::new(backbone), cache, num_workers)?;

        Ok(Self {
            embedder,
            backbone_config: backbone_config.clone(),
            training,
            device: device.clone(),
            cache_for_transform: true,
        })
    }

    pub fn with_cache_for_transform(mut self, enabled: bool) -> Self {
        self.cache_for_transform = enabled;
        self
    }

    pub fn embedder(&self) -> &Embedder {
        &self.embedder
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// このパイプラインが生成する入力スキーマ
    pub fn input_schema(&self) -> InputSchema {
        let backbone = self.embedder.backbone();
        InputSchema {
            columns: image_record_columns(),
            backbone_identity: backbone.identity().to_string(),
            image_size: backbone.input_size(),
            embedding_dim: backbone.embedding_dim(),
        }
    }

    /// 学習サブセットからモデルを学習
    ///
    /// 処理順: ラベルコーデックの学習 → ラベルのエンコード → 埋め込み → ヘッド学習。
    /// 画像が1枚でも読めなければ学習は中断します。
    pub fn fit<AB>(
        &self,
        records: &[ImageRecord],
        callback: &mut dyn MetricsCallback,
        sink: &dyn MilestoneSink,
    ) -> Result<TrainedModel<B>>
    where
        AB: AutodiffBackend<InnerBackend = B, Device = B::Device>,
    {
        report_failure(sink, Stage::Training, self.fit_inner::<AB>(records, callback, sink))
    }

    fn fit_inner<AB>(
        &self,
        records: &[ImageRecord],
        callback: &mut dyn MetricsCallback,
        sink: &dyn MilestoneSink,
    ) -> Result<TrainedModel<B>>
    where
        AB: AutodiffBackend<InnerBackend = B, Device = B::Device>,
    {
        if records.is_empty() {
            return Err(ClassifierError::EmptyTrainingSet);
        }

        let labels = records
            .iter()
            .map(|r| {
                r.label
                    .as_deref()
                    .ok_or_else(|| ClassifierError::MissingLabel(r.path.clone()))
            })
            .collect::<Result<Vec<&str>>>()?;

        let codec = LabelCodec::fit(labels.iter().copied());
        if codec.len() < 2 {
            return Err(ClassifierError::SingleClass(codec.len()));
        }
        let targets = labels
            .iter()
            .map(|label| codec.encode(label))
            .collect::<Result<Vec<usize>>>()?;

        sink.emit(Milestone::TrainingStarted {
            records: records.len(),
            classes: codec.len(),
        });

        let embeddings = self.embedder.embed_all(records, true)?;
        tracing::debug!(count = embeddings.len(), "training embeddings ready");

        let (head, head_config, summary) = train_head::<AB>(
            &embeddings,
            &targets,
            codec.len(),
            &self.training,
            callback,
            &self.device,
        )?;

        sink.emit(Milestone::TrainingCompleted {
            epochs: summary.epochs_completed,
        });

        Ok(TrainedModel::from_parts(
            codec,
            self.embedder.feature_config().clone(),
            self.backbone_config.clone(),
            head_config,
            head,
            self.input_schema(),
            self.training.clone(),
            summary,
            chrono::Local::now().to_rfc3339(),
        ))
    }

    /// モデルのスキーマがこのパイプラインと一致するか検証
    pub fn check_schema(&self, schema: &InputSchema) -> Result<()> {
        let current = self.input_schema();
        if schema.columns != current.columns {
            return Err(ClassifierError::InputSchema(format!(
                "model expects columns {}, pipeline provides {}",
                describe_columns(&schema.columns),
                describe_columns(&current.columns)
            )));
        }
        if schema.backbone_identity != current.backbone_identity {
            return Err(ClassifierError::InputSchema(format!(
                "model was trained with backbone {}, pipeline uses {}",
                schema.backbone_identity, current.backbone_identity
            )));
        }
        if schema.image_size != current.image_size || schema.embedding_dim != current.embedding_dim {
            return Err(ClassifierError::InputSchema(format!(
                "model expects {}px input / {}-d embeddings, pipeline produces {}px / {}-d",
                schema.image_size, schema.embedding_dim, current.image_size, current.embedding_dim
            )));
        }
        Ok(())
    }

    /// レコードごとに予測（画像の読み込み失敗はレコード単位のエラー）
    pub fn transform(&self, model: &TrainedModel<B>, records: &[ImageRecord]) -> Result<Vec<Result<Prediction>>> {
        self.check_schema(model.input_schema())?;

        let embedded = self.embedder.embed_records(records, self.cache_for_transform);

        let ready: Vec<(usize, &Embedding)> = embedded
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().ok().map(|e| (i, e)))
            .collect();

        let mut scores: Vec<Option<(usize, f32)>> = vec![None; records.len()];
        for chunk in ready.chunks(SCORE_BATCH_SIZE) {
            let batch: Vec<&Embedding> = chunk.iter().map(|(_, e)| *e).collect();
            let predicted = model.head().predict(&batch, &self.device)?;
            for ((index, _), score) in chunk.iter().zip(predicted) {
                scores[*index] = Some(score);
            }
        }

        let predictions = records
            .iter()
            .zip(embedded)
            .zip(scores)
            .map(|((record, embedding), score)| {
                embedding?;
                let (key, confidence) = score.ok_or_else(|| {
                    ClassifierError::Backbone(format!("no score for {}", record.path.display()))
                })?;
                Ok(Prediction {
                    path: record.path.clone(),
                    actual_label: record.label.clone(),
                    predicted_label: model.codec().decode(key)?.to_string(),
                    confidence,
                })
            })
            .collect();

        Ok(predictions)
    }
}
