//! 画像レコード → 埋め込みベクトルの変換
//!
//! 画像の読み込み・デコード・キャッシュ参照はスレッドプールで並列に行い、
//! バックボーンの推論は呼び出しスレッドで入力順に1枚ずつ実行します。
//! 結果は常に入力レコードと同じ順序で返します。

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::{ClassifierError, Result};
use crate::ml::backbone::{Backbone, Embedding};
use crate::ml::embedding_cache::{CacheKey, EmbeddingCache};
use crate::ml::features::{self, DecodedImage, FeatureStageConfig};
use crate::types::ImageRecord;

/// 一度に前処理するレコード数（デコード済み画像のメモリ使用量を抑える）
const CHUNK_SIZE: usize = 256;

enum Prepared {
    Cached(Embedding),
    Pending {
        key: Option<CacheKey>,
        image: DecodedImage,
    },
}

/// 特徴抽出ステージ（前処理 + バックボーン + キャッシュ）
pub struct Embedder {
    backbone: Box<dyn Backbone>,
    feature_config: FeatureStageConfig,
    cache: Option<EmbeddingCache>,
    pool: ThreadPool,
}

impl Embedder {
    pub fn new(backbone: Box<dyn Backbone>, cache: Option<EmbeddingCache>, num_workers: usize) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_workers.max(1))
            .thread_name(|i| format!("embed-worker-{}", i))
            .build()
            .map_err(|e| ClassifierError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;

        Ok(Self {
            feature_config: FeatureStageConfig::new(backbone.input_size()),
            backbone,
            cache,
            pool,
        })
    }

    pub fn backbone(&self) -> &dyn Backbone {
        self.backbone.as_ref()
    }

    pub fn feature_config(&self) -> &FeatureStageConfig {
        &self.feature_config
    }

    pub fn cache(&self) -> Option<&EmbeddingCache> {
        self.cache.as_ref()
    }

    /// レコードごとの埋め込みを計算（失敗はレコード単位で返す）
    pub fn embed_records(&self, records: &[ImageRecord], use_cache: bool) -> Vec<Result<Embedding>> {
        let cache = if use_cache { self.cache.as_ref() } else { None };
        let mut results = Vec::with_capacity(records.len());
        let mut hits = 0usize;

        for chunk in records.chunks(CHUNK_SIZE) {
            let prepared = self.prepare_chunk(chunk, cache);

            for item in prepared {
                let embedding = match item {
                    Ok(Prepared::Cached(embedding)) => {
                        hits += 1;
                        Ok(embedding)
                    }
                    Ok(Prepared::Pending { key, image }) => self.embed_and_store(key, &image, cache),
                    Err(e) => Err(e),
                };
                results.push(embedding);
            }
        }

        if cache.is_some() {
            tracing::debug!(hits, total = records.len(), "embedding cache lookup");
        }
        results
    }

    /// 全レコードの埋め込みを計算（1件でも失敗したらエラー）
    ///
    /// 最初の失敗で打ち切り、それ以降のレコードはバックボーンに渡さない。
    pub fn embed_all(&self, records: &[ImageRecord], use_cache: bool) -> Result<Vec<Embedding>> {
        let cache = if use_cache { self.cache.as_ref() } else { None };
        let mut embeddings = Vec::with_capacity(records.len());

        for chunk in records.chunks(CHUNK_SIZE) {
            for item in self.prepare_chunk(chunk, cache) {
                let embedding = match item? {
                    Prepared::Cached(embedding) => embedding,
                    Prepared::Pending { key, image } => self.embed_and_store(key, &image, cache)?,
                };
                embeddings.push(embedding);
            }
        }
        Ok(embeddings)
    }

    fn prepare_chunk(&self, chunk: &[ImageRecord], cache: Option<&EmbeddingCache>) -> Vec<Result<Prepared>> {
        let feature_config = &self.feature_config;
        let identity = self.backbone.identity();
        let dim = self.backbone.embedding_dim();

        // par_iter + collect は入力順を保つ
        self.pool.install(|| {
            chunk
                .par_iter()
                .map(|record| prepare(record, feature_config, identity, dim, cache))
                .collect()
        })
    }

    fn embed_and_store(
        &self,
        key: Option<CacheKey>,
        image: &DecodedImage,
        cache: Option<&EmbeddingCache>,
    ) -> Result<Embedding> {
        let embedding = self.backbone.embed(image)?;
        if let (Some(cache), Some(key)) = (cache, key) {
            // キャッシュは最適化なので書き込み失敗は致命的ではない
            if let Err(e) = cache.put(&key, &embedding) {
                tracing::warn!("failed to write embedding cache entry: {}", e);
            }
        }
        Ok(embedding)
    }
}

fn prepare(
    record: &ImageRecord,
    feature_config: &FeatureStageConfig,
    backbone_identity: &str,
    dim: usize,
    cache: Option<&EmbeddingCache>,
) -> Result<Prepared> {
    let raw = features::extract(&record.path)?;

    let key = match cache {
        Some(cache) => {
            let key = EmbeddingCache::key(backbone_identity, &record.path, &raw.fingerprint());
            if let Some(embedding) = cache.get(&key, dim) {
                return Ok(Prepared::Cached(embedding));
            }
            Some(key)
        }
        None => None,
    };

    let image = features::decode(&raw, feature_config)?;
    Ok(Prepared::Pending { key, image })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::path::Path;
    use std::rc::Rc;

    /// 呼び出し回数を数えるバックボーン（平均画素値を埋め込みとする）
    struct CountingBackbone {
        calls: Rc<Cell<usize>>,
    }

    impl Backbone for CountingBackbone {
        fn identity(&self) -> &str {
            "counting"
        }
        fn input_size(&self) -> usize {
            4
        }
        fn embedding_dim(&self) -> usize {
            1
        }
        fn embed(&self, image: &DecodedImage) -> Result<Embedding> {
            self.calls.set(self.calls.get() + 1);
            let mean = image.data.iter().sum::<f32>() / image.data.len() as f32;
            Ok(Embedding::new(vec![mean]))
        }
    }

    fn write_image(dir: &Path, name: &str, value: u8) -> std::path::PathBuf {
        let path = dir.join(name);
        image::RgbImage::from_pixel(4, 4, image::Rgb([value, value, value]))
            .save(&path)
            .unwrap();
        path
    }

    fn embedder(cache: Option<EmbeddingCache>) -> (Embedder, Rc<Cell<usize>>) {
        let calls = Rc::new(Cell::new(0));
        let backbone = CountingBackbone { calls: calls.clone() };
        (Embedder::new(Box::new(backbone), cache, 2).unwrap(), calls)
    }

    #[test]
    fn test_results_keep_record_order_and_report_failures() {
        let dir = tempfile::tempdir().unwrap();
        let records = vec![
            ImageRecord::unlabeled(write_image(dir.path(), "a.png", 0)),
            ImageRecord::unlabeled(dir.path().join("missing.png")),
            ImageRecord::unlabeled(write_image(dir.path(), "c.png", 255)),
        ];

        let (embedder, calls) = embedder(None);
        let results = embedder.embed_records(&records, false);
        assert_eq!(results.len(), 3);
        let a = results[0].as_ref().unwrap().as_slice()[0];
        let c = results[2].as_ref().unwrap().as_slice()[0];
        assert!(a < c);
        assert!(matches!(results[1], Err(ClassifierError::ImageRead { .. })));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_cache_hit_matches_fresh_embedding() {
        let dir = tempfile::tempdir().unwrap();
        let cache = EmbeddingCache::open(dir.path().join("cache")).unwrap();
        let records = vec![
            ImageRecord::unlabeled(write_image(dir.path(), "a.png", 10)),
            ImageRecord::unlabeled(write_image(dir.path(), "b.png", 200)),
        ];

        let (fresh, fresh_calls) = embedder(Some(cache.clone()));
        let first = fresh.embed_all(&records, true).unwrap();
        assert_eq!(fresh_calls.get(), 2);
        assert_eq!(std::fs::read_dir(cache.dir()).unwrap().count(), 2);

        let (reused, reused_calls) = embedder(Some(cache.clone()));
        let cached = reused.embed_all(&records, true).unwrap();
        assert_eq!(reused_calls.get(), 0);

        let (plain, _) = embedder(Some(cache));
        let uncached = plain.embed_all(&records, false).unwrap();
        assert_eq!(first, cached);
        assert_eq!(first, uncached);
    }

    #[test]
    fn test_changed_image_is_not_served_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = EmbeddingCache::open(dir.path().join("cache")).unwrap();
        let path = write_image(dir.path(), "a.png", 10);
        let records = vec![ImageRecord::unlabeled(&path)];

        let before = embedder(Some(cache.clone())).0.embed_all(&records, true).unwrap();
        write_image(dir.path(), "a.png", 250);
        let (embedder, calls) = embedder(Some(cache));
        let after = embedder.embed_all(&records, true).unwrap();
        assert_eq!(calls.get(), 1);
        assert_ne!(before, after);
    }

    #[test]
    fn test_embed_all_fails_on_first_bad_record() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad.jpg");
        std::fs::write(&bad, b"not an image").unwrap();
        let records = vec![
            ImageRecord::unlabeled(write_image(dir.path(), "a.png", 10)),
            ImageRecord::unlabeled(bad),
        ];
        assert!(matches!(
            embedder(None).0.embed_all(&records, false),
            Err(ClassifierError::ImageRead { .. })
        ));
    }

    #[test]
    fn test_embed_all_stops_before_embedding_after_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut records = vec![ImageRecord::unlabeled(dir.path().join("missing.png"))];
        for i in 0..5 {
            records.push(ImageRecord::unlabeled(write_image(dir.path(), &format!("{}.png", i), i * 40)));
        }

        let (embedder, calls) = embedder(None);
        assert!(matches!(
            embedder.embed_all(&records, false),
            Err(ClassifierError::ImageRead { .. })
        ));
        assert_eq!(calls.get(), 0);
    }
}
