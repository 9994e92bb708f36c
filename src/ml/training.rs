//! 分類ヘッドの学習
//!
//! 埋め込みは学習前に計算済みのため、ここではヘッドのみをAdamで学習します。
//! エポックごとのサンプル順はシード付き乱数でシャッフルするので、
//! 同じ入力・同じ設定なら結果は再現します。

use std::ops::ControlFlow;

use burn::{
    config::Config,
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{backend::AutodiffBackend, ElementConversion, Int, Tensor},
};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{self, ClassifierError};
use crate::ml::backbone::Embedding;
use crate::ml::head::{embedding_batch, ClassificationHead, HeadConfig};

/// 学習設定
#[derive(Config, Debug)]
pub struct TrainingConfig {
    /// エポック数
    #[config(default = 20)]
    pub num_epochs: usize,
    /// バッチサイズ
    #[config(default = 8)]
    pub batch_size: usize,
    /// 学習率
    #[config(default = 1e-2)]
    pub learning_rate: f64,
    /// シャッフル用シード
    #[config(default = 42)]
    pub seed: u64,
}

/// 1エポック分の学習状況
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingProgress {
    /// 1始まり
    pub epoch: usize,
    pub num_epochs: usize,
    /// バッチ平均の損失
    pub loss: f64,
    /// 学習データでの正解率 (0.0〜1.0)
    pub accuracy: f64,
}

/// エポック終了ごとに呼ばれるコールバック
///
/// `ControlFlow::Break` を返すと次のエポックを開始せずに学習を終了します。
pub trait MetricsCallback {
    fn on_epoch(&mut self, progress: &TrainingProgress) -> ControlFlow<()>;
}

impl<F> MetricsCallback for F
where
    F: FnMut(&TrainingProgress) -> ControlFlow<()>,
{
    fn on_epoch(&mut self, progress: &TrainingProgress) -> ControlFlow<()> {
        self(progress)
    }
}

/// 進捗を `tracing` に出すだけのコールバック
pub struct LogProgress;

impl MetricsCallback for LogProgress {
    fn on_epoch(&mut self, progress: &TrainingProgress) -> ControlFlow<()> {
        tracing::info!(
            "Epoch {}/{}: loss = {:.4}, acc = {:.2}%",
            progress.epoch,
            progress.num_epochs,
            progress.loss,
            progress.accuracy * 100.0
        );
        ControlFlow::Continue(())
    }
}

/// 学習結果の要約（アーティファクトに保存される）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub epochs_completed: usize,
    pub final_loss: Option<f64>,
    pub final_accuracy: Option<f64>,
    /// コールバックにより途中で終了した
    #[serde(default)]
    pub stopped_early: bool,
}

/// ヘッドを学習し、推論用（autodiff無し）のヘッドを返す
///
/// # 引数
/// - `embeddings`: 学習データの埋め込み（全て同じ次元）
/// - `targets`: 各埋め込みのクラスID（`num_classes` 未満）
pub fn train_head<AB: AutodiffBackend>(
    embeddings: &[Embedding],
    targets: &[usize],
    num_classes: usize,
    config: &TrainingConfig,
    callback: &mut dyn MetricsCallback,
    device: &AB::Device,
) -> error::Result<(ClassificationHead<AB::InnerBackend>, HeadConfig, TrainingSummary)> {
    if embeddings.is_empty() {
        return Err(ClassifierError::EmptyTrainingSet);
    }
    if embeddings.len() != targets.len() {
        return Err(ClassifierError::Backbone(format!(
            "{} embeddings for {} targets",
            embeddings.len(),
            targets.len()
        )));
    }

    let head_config = HeadConfig::new(embeddings[0].len(), num_classes);
    let mut head = head_config.init::<AB>(device);
    let mut optimizer = AdamConfig::new().init();

    let batch_size = config.batch_size.max(1);
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut indices: Vec<usize> = (0..embeddings.len()).collect();

    let mut summary = TrainingSummary {
        epochs_completed: 0,
        final_loss: None,
        final_accuracy: None,
        stopped_early: false,
    };

    for epoch in 1..=config.num_epochs {
        indices.shuffle(&mut rng);

        let mut epoch_loss = 0.0f64;
        let mut correct = 0usize;
        let mut num_batches = 0usize;

        for batch in indices.chunks(batch_size) {
            let inputs = embedding_batch::<AB>(
                batch.iter().map(|&i| &embeddings[i]),
                head_config.embedding_dim,
                device,
            )?;
            let batch_targets: Vec<i64> = batch.iter().map(|&i| targets[i] as i64).collect();
            let batch_targets = Tensor::<AB, 1, Int>::from_ints(batch_targets.as_slice(), device);

            let logits = head.forward(inputs);
            let loss = head.loss(logits.clone(), batch_targets.clone());

            let loss_value: f64 = loss.clone().into_scalar().elem();
            epoch_loss += loss_value;

            let batch_correct: i64 = logits
                .argmax(1)
                .reshape([batch.len()])
                .equal(batch_targets)
                .int()
                .sum()
                .into_scalar()
                .elem();
            correct += batch_correct as usize;
            num_batches += 1;

            let grads = loss.backward();
            let grads = GradientsParams::from_grads(grads, &head);
            head = optimizer.step(config.learning_rate, head, grads);
        }

        let progress = TrainingProgress {
            epoch,
            num_epochs: config.num_epochs,
            loss: epoch_loss / num_batches.max(1) as f64,
            accuracy: correct as f64 / embeddings.len() as f64,
        };
        summary.epochs_completed = epoch;
        summary.final_loss = Some(progress.loss);
        summary.final_accuracy = Some(progress.accuracy);

        if callback.on_epoch(&progress).is_break() {
            tracing::info!("training stopped by callback after epoch {}", epoch);
            summary.stopped_early = epoch < config.num_epochs;
            break;
        }
    }

    Ok((head.valid(), head_config, summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_autodiff::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn separable() -> (Vec<Embedding>, Vec<usize>) {
        let mut embeddings = Vec::new();
        let mut targets = Vec::new();
        for i in 0..6 {
            let offset = i as f32 * 0.1;
            embeddings.push(Embedding::new(vec![1.0 + offset, -1.0]));
            targets.push(0);
            embeddings.push(Embedding::new(vec![-1.0, 1.0 + offset]));
            targets.push(1);
        }
        (embeddings, targets)
    }

    #[test]
    fn test_head_learns_separable_data() {
        let device = Default::default();
        let (embeddings, targets) = separable();
        let config = TrainingConfig::new().with_num_epochs(30).with_batch_size(4);

        let mut losses = Vec::new();
        let mut callback = |p: &TrainingProgress| {
            losses.push(p.loss);
            ControlFlow::Continue(())
        };
        let (head, head_config, summary) =
            train_head::<TestBackend>(&embeddings, &targets, 2, &config, &mut callback, &device).unwrap();

        assert_eq!(head_config.num_classes, 2);
        assert_eq!(summary.epochs_completed, 30);
        assert!(!summary.stopped_early);
        assert_eq!(losses.len(), 30);
        assert!(losses[29] < losses[0]);

        let refs: Vec<&Embedding> = embeddings.iter().collect();
        let predicted: Vec<usize> = head.predict(&refs, &device).unwrap().into_iter().map(|(c, _)| c).collect();
        assert_eq!(predicted, targets);
    }

    #[test]
    fn test_callback_can_stop_training() {
        let device = Default::default();
        let (embeddings, targets) = separable();
        let config = TrainingConfig::new().with_num_epochs(10);

        let mut callback = |p: &TrainingProgress| {
            if p.epoch == 3 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        };
        let (_, _, summary) =
            train_head::<TestBackend>(&embeddings, &targets, 2, &config, &mut callback, &device).unwrap();

        assert_eq!(summary.epochs_completed, 3);
        assert!(summary.stopped_early);
    }

    #[test]
    fn test_training_is_reproducible() {
        let device = Default::default();
        let (embeddings, targets) = separable();
        let config = TrainingConfig::new().with_num_epochs(5).with_batch_size(3);

        let run = || {
            let (head, _, summary) =
                train_head::<TestBackend>(&embeddings, &targets, 2, &config, &mut LogProgress, &device).unwrap();
            let refs: Vec<&Embedding> = embeddings.iter().collect();
            (head.predict(&refs, &device).unwrap(), summary)
        };
        assert_eq!(run(), run());
    }
}
