pub mod backbone;
pub mod embedder;
pub mod embedding_cache;
pub mod evaluation;
pub mod features;
pub mod head;
pub mod inference;
pub mod label_codec;
pub mod pipeline;
pub mod training;

pub use backbone::{Backbone, BackboneConfig, ConvBackbone, Embedding, BACKBONE_ARCH};
pub use embedder::Embedder;
pub use embedding_cache::{CacheKey, EmbeddingCache};
pub use evaluation::{evaluate, macro_accuracy, ClassAccuracy, Metrics};
pub use features::{decode, extract, DecodedImage, FeatureStageConfig, RawImage, IMAGENET_MEAN, IMAGENET_STD};
pub use head::{ClassificationHead, HeadConfig};
pub use inference::InferenceEngine;
pub use label_codec::LabelCodec;
pub use pipeline::{Pipeline, TrainedModel};
pub use training::{train_head, LogProgress, MetricsCallback, TrainingConfig, TrainingProgress, TrainingSummary};
