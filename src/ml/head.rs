//! 分類ヘッド
//!
//! 埋め込みベクトルを入力とする全結合1層の分類器です。
//! 重みはゼロで初期化するため、同じデータ・同じシードなら学習結果は常に同じになります。

use burn::{
    config::Config,
    module::Module,
    nn::{loss::CrossEntropyLossConfig, Initializer, Linear, LinearConfig},
    tensor::{activation::softmax, backend::Backend, Int, Tensor},
};

use crate::error::{self, ClassifierError};
use crate::ml::backbone::Embedding;

/// ヘッド設定
#[derive(Config, Debug)]
pub struct HeadConfig {
    /// 入力（埋め込み）の次元数
    pub embedding_dim: usize,
    /// 分類クラス数
    pub num_classes: usize,
}

impl HeadConfig {
    /// ヘッドを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> ClassificationHead<B> {
        ClassificationHead {
            linear: LinearConfig::new(self.embedding_dim, self.num_classes)
                .with_initializer(Initializer::Zeros)
                .init(device),
        }
    }
}

/// 線形分類ヘッド
#[derive(Module, Debug)]
pub struct ClassificationHead<B: Backend> {
    linear: Linear<B>, // embedding_dim -> num_classes
}

impl<B: Backend> ClassificationHead<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `embeddings`: [batch_size, embedding_dim]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, embeddings: Tensor<B, 2>) -> Tensor<B, 2> {
        self.linear.forward(embeddings)
    }

    /// ソフトマックス交差エントロピー損失
    pub fn loss(&self, logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Tensor<B, 1> {
        CrossEntropyLossConfig::new()
            .init(&logits.device())
            .forward(logits, targets)
    }

    /// クラスごとの確率 [batch_size, num_classes]
    pub fn probabilities(&self, embeddings: Tensor<B, 2>) -> Tensor<B, 2> {
        softmax(self.forward(embeddings), 1)
    }

    /// 予測クラスIDとその確率を返す
    pub fn predict(&self, embeddings: &[&Embedding], device: &B::Device) -> error::Result<Vec<(usize, f32)>> {
        if embeddings.is_empty() {
            return Ok(Vec::new());
        }

        let dim = embeddings[0].len();
        let probabilities = self
            .probabilities(embedding_batch::<B>(embeddings.iter().copied(), dim, device)?)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| ClassifierError::Backbone(format!("failed to read head output: {:?}", e)))?;

        let num_classes = probabilities.len() / embeddings.len();
        Ok(probabilities
            .chunks(num_classes)
            .map(argmax)
            .collect())
    }
}

/// 同点の場合は小さいクラスIDを選ぶ
fn argmax(row: &[f32]) -> (usize, f32) {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &p)| if p > best.1 { (i, p) } else { best })
}

/// 埋め込みを [rows, dim] のテンソルにまとめる
pub fn embedding_batch<'a, B: Backend>(
    embeddings: impl IntoIterator<Item = &'a Embedding>,
    dim: usize,
    device: &B::Device,
) -> error::Result<Tensor<B, 2>> {
    let mut values = Vec::new();
    let mut rows = 0;
    for embedding in embeddings {
        if embedding.len() != dim {
            return Err(ClassifierError::Backbone(format!(
                "embedding has {} values, expected {}",
                embedding.len(),
                dim
            )));
        }
        values.extend_from_slice(embedding.as_slice());
        rows += 1;
    }

    Ok(Tensor::<B, 1>::from_floats(values.as_slice(), device).reshape([rows, dim]))
}
