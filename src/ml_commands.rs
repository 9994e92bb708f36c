//! 学習・分類コマンド
//!
//! 設定ファイルの内容に従ってデータ読み込み → 学習 → 評価 → 保存、
//! および保存済みモデルでのバッチ分類を実行します。

use anyhow::{Context, Result};
use burn::tensor::backend::{AutodiffBackend, Backend};
use std::path::{Path, PathBuf};

use crate::csv_loader::{load_manifest, records_for_subset};
use crate::logging::{report_failure, Milestone, MilestoneSink, Stage};
use crate::ml::embedding_cache::EmbeddingCache;
use crate::ml::evaluation::{evaluate, Metrics};
use crate::ml::inference::InferenceEngine;
use crate::ml::pipeline::{Pipeline, TrainedModel};
use crate::ml::training::LogProgress;
use crate::model::config::AppConfig;
use crate::model::model_storage::save_trained_model;
use crate::types::{ImageRecord, Prediction};

/// 学習コマンドの結果
pub struct TrainReport<B: Backend> {
    pub model: TrainedModel<B>,
    pub metrics: Metrics,
    pub model_path: PathBuf,
}

/// 設定に従って埋め込みキャッシュを開く（無効なら None）
pub fn open_cache(config: &AppConfig, sink: &dyn MilestoneSink) -> Result<Option<EmbeddingCache>> {
    if !config.cache.enabled {
        return Ok(None);
    }
    let cache = report_failure(sink, Stage::Cache, EmbeddingCache::open(&config.cache.dir))
        .with_context(|| format!("Failed to open embedding cache: {}", config.cache.dir.display()))?;
    Ok(Some(cache))
}

/// 埋め込みキャッシュの全エントリを削除し、削除件数を返す
pub fn clear_cache_command(config: &AppConfig, sink: &dyn MilestoneSink) -> Result<usize> {
    let cache = report_failure(sink, Stage::Cache, EmbeddingCache::open(&config.cache.dir))
        .with_context(|| format!("Failed to open embedding cache: {}", config.cache.dir.display()))?;
    let removed = report_failure(sink, Stage::Cache, cache.clear())
        .with_context(|| format!("Failed to clear embedding cache: {}", config.cache.dir.display()))?;
    tracing::info!("removed {} cached embeddings from {}", removed, config.cache.dir.display());
    Ok(removed)
}

/// マニフェストを読み込み、学習・検証サブセットに分割
pub fn load_dataset(config: &AppConfig, sink: &dyn MilestoneSink) -> Result<(Vec<ImageRecord>, Vec<ImageRecord>)> {
    sink.emit(Milestone::LoadingData);

    let dataset = &config.dataset;
    let records = report_failure(
        sink,
        Stage::Loading,
        load_manifest(&dataset.manifest_path, &dataset.image_root, dataset.strip_components),
    )
    .with_context(|| format!("Failed to load manifest: {}", dataset.manifest_path.display()))?;

    let training: Vec<ImageRecord> = records_for_subset(&records, &dataset.train_tag).cloned().collect();
    let validation: Vec<ImageRecord> = records_for_subset(&records, &dataset.validation_tag)
        .cloned()
        .collect();

    let ignored = records.len() - training.len() - validation.len();
    if ignored > 0 {
        tracing::info!("{} manifest records belong to neither subset", ignored);
    }

    sink.emit(Milestone::DataLoaded {
        training: training.len(),
        validation: validation.len(),
    });
    Ok((training, validation))
}

/// 学習 → 評価 → 保存
pub fn train_command<B, AB>(config: &AppConfig, device: &B::Device, sink: &dyn MilestoneSink) -> Result<TrainReport<B>>
where
    B: Backend,
    AB: AutodiffBackend<InnerBackend = B, Device = B::Device>,
{
    let (training, validation) = load_dataset(config, sink)?;

    let cache = open_cache(config, sink)?;
    let pipeline = report_failure(
        sink,
        Stage::Training,
        Pipeline::<B>::new(
            &config.backbone,
            config.training.training_config(),
            cache,
            config.training.num_workers,
            device,
        ),
    )?
    .with_cache_for_transform(config.cache.apply_to_evaluation);

    let model = pipeline.fit::<AB>(&training, &mut LogProgress, sink)?;
    let metrics = evaluate(&pipeline, &model, &validation, sink)?;
    print_metrics(&metrics);

    save_trained_model(&model, &config.model_path, sink)
        .with_context(|| format!("Failed to save model: {}", config.model_path.display()))?;

    Ok(TrainReport {
        model,
        metrics,
        model_path: config.model_path.clone(),
    })
}

/// 保存済みモデルで画像を分類
pub fn classify_command<B: Backend>(
    config: &AppConfig,
    model_path: &Path,
    images: &[PathBuf],
    device: &B::Device,
    sink: &dyn MilestoneSink,
) -> Result<Vec<crate::error::Result<Prediction>>> {
    let cache = if config.cache.apply_to_evaluation {
        open_cache(config, sink)?
    } else {
        None
    };
    let engine = InferenceEngine::<B>::load(model_path, cache, config.training.num_workers, device, sink)
        .with_context(|| format!("Failed to load model: {}", model_path.display()))?;

    let results = engine.classify(images, sink)?;
    let failed = results.iter().filter(|r| r.is_err()).count();
    if failed > 0 {
        tracing::warn!("{} of {} images could not be classified", failed, results.len());
    }
    Ok(results)
}

/// 学習・保存した後、保存したモデルを読み直して分類
///
/// `images` が空なら検証サブセットの画像を分類します。
pub fn run_command<B, AB>(
    config: &AppConfig,
    images: &[PathBuf],
    device: &B::Device,
    sink: &dyn MilestoneSink,
) -> Result<Vec<crate::error::Result<Prediction>>>
where
    B: Backend,
    AB: AutodiffBackend<InnerBackend = B, Device = B::Device>,
{
    let report = train_command::<B, AB>(config, device, sink)?;

    let images: Vec<PathBuf> = if images.is_empty() {
        report.metrics.predictions.iter().map(|p| p.path.clone()).collect()
    } else {
        images.to_vec()
    };
    classify_command::<B>(config, &report.model_path, &images, device, sink)
}

/// 評価結果をコンソールに表示
pub fn print_metrics(metrics: &Metrics) {
    println!("\n=== 評価結果 ===");
    println!("Macro Accuracy: {:.4}", metrics.macro_accuracy);
    println!("Micro Accuracy: {:.4}", metrics.micro_accuracy);
    for class in &metrics.per_class {
        println!(
            "  {:<20} {:>6.2}% ({}/{})",
            class.label,
            class.accuracy() * 100.0,
            class.correct,
            class.support
        );
    }
    if metrics.unseen_label_records > 0 {
        println!("  （未学習ラベルのため除外: {} 件）", metrics.unseen_label_records);
    }
    println!("================");
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_autodiff::Autodiff;
    use burn_ndarray::NdArray;

    use crate::logging::RecordingSink;
    use crate::ml::backbone::Embedding;

    fn config_with_manifest(dir: &Path) -> AppConfig {
        let manifest = dir.join("labels.csv");
        std::fs::write(&manifest, "image,class,subset
image/0.png,dent,T
").unwrap();

        let mut config = AppConfig::default();
        config.dataset.manifest_path = manifest;
        config.dataset.image_root = dir.join("image");
        config.model_path = dir.join("model.tar.gz");
        config
    }

    #[test]
    fn test_cache_open_failure_ends_with_failed() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_with_manifest(dir.path());
        let blocker = dir.path().join("not_a_dir");
        std::fs::write(&blocker, b"file").unwrap();
        config.cache.dir = blocker.join("embeddings");

        let sink = RecordingSink::new();
        let result = train_command::<NdArray, Autodiff<NdArray>>(&config, &Default::default(), &sink);
        assert!(result.is_err());

        let events = sink.events();
        assert_eq!(events[1], Milestone::DataLoaded { training: 1, validation: 0 });
        assert!(matches!(
            events.last(),
            Some(Milestone::Failed { stage: Stage::Cache, .. })
        ));
    }

    #[test]
    fn test_disabled_cache_is_not_opened() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_with_manifest(dir.path());
        config.cache.enabled = false;
        config.cache.dir = dir.path().join("never_created");

        let sink = RecordingSink::new();
        assert!(open_cache(&config, &sink).unwrap().is_none());
        assert!(!config.cache.dir.exists());
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_clear_cache_command() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_with_manifest(dir.path());
        config.cache.dir = dir.path().join("cache");

        let cache = EmbeddingCache::open(&config.cache.dir).unwrap();
        let key = EmbeddingCache::key("b", Path::new("a.png"), "c");
        cache.put(&key, &Embedding::new(vec![1.0])).unwrap();

        let sink = RecordingSink::new();
        assert_eq!(clear_cache_command(&config, &sink).unwrap(), 1);
        assert!(cache.get(&key, 1).is_none());
    }
}
