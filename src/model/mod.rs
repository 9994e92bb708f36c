pub mod config;
pub mod model_metadata;
pub mod model_storage;

pub use config::{AppConfig, CacheSettings, DatasetSettings, DeviceType, TrainingSettings};
pub use model_metadata::{image_record_columns, ArtifactMetadata, ColumnKind, InputSchema, SchemaColumn, FORMAT_VERSION};
pub use model_storage::{artifact_metadata, load_metadata, load_trained_model, print_metadata_info, save_trained_model};
