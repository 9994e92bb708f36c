//! 学習済みモデルの永続化
//!
//! Tar.gz形式でヘッドの重みとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（ラベル一覧、入力スキーマ、バックボーン設定など）
//! - head.bin        - 分類ヘッドの重み（バイナリ）
//!
//! 保存は同じディレクトリの一時ファイルに書いてから rename するため、
//! 途中で失敗しても既存のアーティファクトは壊れません。

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::backend::Backend,
};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder};

use crate::error::{ClassifierError, Result};
use crate::logging::{report_failure, Milestone, MilestoneSink, Stage};
use crate::ml::head::ClassificationHead;
use crate::ml::pipeline::TrainedModel;
use crate::model::model_metadata::{describe_columns, ArtifactMetadata, InputSchema, SchemaColumn, FORMAT_VERSION};

const METADATA_ENTRY: &str = "metadata.json";
const WEIGHTS_ENTRY: &str = "head.bin";

type HeadRecord<B> = <ClassificationHead<B> as Module<B>>::Record;

/// 学習済みモデルのメタデータを作成
pub fn artifact_metadata<B: Backend>(model: &TrainedModel<B>) -> ArtifactMetadata {
    ArtifactMetadata {
        format_version: FORMAT_VERSION,
        labels: model.codec().clone(),
        input_schema: model.input_schema().clone(),
        feature_stage: model.feature_stage().clone(),
        backbone: model.backbone_config().clone(),
        head: model.head_config().clone(),
        training: model.training_config().clone(),
        summary: model.summary().clone(),
        trained_at: model.trained_at().to_string(),
    }
}

/// 学習済みモデルを保存
pub fn save_trained_model<B: Backend>(
    model: &TrainedModel<B>,
    output_path: &Path,
    sink: &dyn MilestoneSink,
) -> Result<()> {
    sink.emit(Milestone::SavingModel {
        path: output_path.to_path_buf(),
    });
    report_failure(sink, Stage::Saving, write_artifact(model, output_path))?;
    sink.emit(Milestone::ModelSaved {
        path: output_path.to_path_buf(),
    });
    Ok(())
}

fn write_artifact<B: Backend>(model: &TrainedModel<B>, output_path: &Path) -> Result<()> {
    let metadata = artifact_metadata(model)
        .to_json_string()
        .map_err(|e| ClassifierError::corrupt(output_path, format!("{:#}", e)))?;

    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let weights = Recorder::<B>::record(&recorder, model.head().clone().into_record(), ())
        .map_err(|e| ClassifierError::corrupt(output_path, format!("failed to encode head weights: {:?}", e)))?;

    write_atomically(output_path, metadata.as_bytes(), &weights)?;
    Ok(())
}

/// 保存先と同じディレクトリの一時ファイル名
fn temp_path_for(output_path: &Path) -> PathBuf {
    let parent = match output_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = output_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "model".to_string());
    parent.join(format!(".{}.{}.tmp", file_name, std::process::id()))
}

/// 一時ファイルに書き込んでから rename する（失敗時は既存ファイルに触れない）
fn write_atomically(output_path: &Path, metadata: &[u8], weights: &[u8]) -> std::io::Result<()> {
    let tmp_path = temp_path_for(output_path);
    // 親ディレクトリが存在しない場合は作成
    if let Some(parent) = tmp_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let written = write_archive(&tmp_path, metadata, weights).and_then(|_| fs::rename(&tmp_path, output_path));
    if written.is_err() && tmp_path.is_file() {
        fs::remove_file(&tmp_path).ok();
    }
    written
}

fn write_archive(path: &Path, metadata: &[u8], weights: &[u8]) -> std::io::Result<()> {
    let file = File::create(path)?;

    // Gzip圧縮を設定
    let encoder = GzEncoder::new(file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    append_entry(&mut tar_builder, METADATA_ENTRY, metadata)?;
    append_entry(&mut tar_builder, WEIGHTS_ENTRY, weights)?;

    let mut file = tar_builder.into_inner()?.finish()?;
    file.flush()?;
    file.sync_all()
}

fn append_entry<W: Write>(builder: &mut Builder<W>, name: &str, data: &[u8]) -> std::io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append(&header, data)
}

/// アーカイブから metadata.json と head.bin を取り出す
fn read_entries(path: &Path) -> Result<(Option<String>, Option<Vec<u8>>)> {
    let file = File::open(path)?;
    let decoder = GzDecoder::new(file);
    let mut archive = Archive::new(decoder);

    let mut metadata = None;
    let mut weights = None;

    let entries = archive
        .entries()
        .map_err(|e| ClassifierError::corrupt(path, e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| ClassifierError::corrupt(path, e))?;
        let name = entry
            .path()
            .map_err(|e| ClassifierError::corrupt(path, e))?
            .to_string_lossy()
            .to_string();

        match name.as_str() {
            METADATA_ENTRY => {
                let mut json = String::new();
                entry
                    .read_to_string(&mut json)
                    .map_err(|e| ClassifierError::corrupt(path, e))?;
                metadata = Some(json);
            }
            WEIGHTS_ENTRY => {
                let mut buffer = Vec::new();
                entry
                    .read_to_end(&mut buffer)
                    .map_err(|e| ClassifierError::corrupt(path, e))?;
                weights = Some(buffer);
            }
            _ => {}
        }
    }

    Ok((metadata, weights))
}

fn parse_metadata(path: &Path, json: Option<String>) -> Result<ArtifactMetadata> {
    let json = json.ok_or_else(|| ClassifierError::corrupt(path, "metadata.json not found in archive"))?;
    let metadata =
        ArtifactMetadata::from_json_string(&json).map_err(|e| ClassifierError::corrupt(path, format!("{:#}", e)))?;

    if metadata.format_version != FORMAT_VERSION {
        return Err(ClassifierError::corrupt(
            path,
            format!(
                "unsupported format version {} (expected {})",
                metadata.format_version, FORMAT_VERSION
            ),
        ));
    }
    if metadata.head.num_classes != metadata.labels.len()
        || metadata.head.embedding_dim != metadata.input_schema.embedding_dim
    {
        return Err(ClassifierError::corrupt(
            path,
            "head dimensions do not match labels / input schema",
        ));
    }
    Ok(metadata)
}

/// アーティファクトからメタデータのみを読み込む
pub fn load_metadata(path: &Path) -> Result<ArtifactMetadata> {
    let (metadata, _) = read_entries(path)?;
    parse_metadata(path, metadata)
}

/// 学習済みモデルを読み込む
///
/// `expected_columns` は呼び出し側が渡す入力列。アーティファクトの入力スキーマと
/// 異なる場合は `SchemaMismatch` を返します。
pub fn load_trained_model<B: Backend>(
    path: &Path,
    expected_columns: &[SchemaColumn],
    device: &B::Device,
    sink: &dyn MilestoneSink,
) -> Result<(TrainedModel<B>, InputSchema)> {
    sink.emit(Milestone::LoadingModel {
        path: path.to_path_buf(),
    });
    let loaded = report_failure(sink, Stage::ModelLoading, read_artifact(path, expected_columns, device))?;
    sink.emit(Milestone::ModelLoaded {
        path: path.to_path_buf(),
    });
    Ok(loaded)
}

fn read_artifact<B: Backend>(
    path: &Path,
    expected_columns: &[SchemaColumn],
    device: &B::Device,
) -> Result<(TrainedModel<B>, InputSchema)> {
    let (metadata, weights) = read_entries(path)?;
    let metadata = parse_metadata(path, metadata)?;

    if metadata.input_schema.columns.as_slice() != expected_columns {
        return Err(ClassifierError::SchemaMismatch {
            expected: describe_columns(expected_columns),
            found: describe_columns(&metadata.input_schema.columns),
        });
    }

    let weights = weights.ok_or_else(|| ClassifierError::corrupt(path, "head.bin not found in archive"))?;
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let record: HeadRecord<B> = Recorder::<B>::load(&recorder, weights, device)
        .map_err(|e| ClassifierError::corrupt(path, format!("failed to decode head weights: {:?}", e)))?;
    let head = metadata.head.init::<B>(device).load_record(record);

    let schema = metadata.input_schema.clone();
    let model = TrainedModel::from_parts(
        metadata.labels,
        metadata.feature_stage,
        metadata.backbone,
        metadata.head,
        head,
        metadata.input_schema,
        metadata.training,
        metadata.summary,
        metadata.trained_at,
    );
    Ok((model, schema))
}

/// メタデータをコンソールに表示
pub fn print_metadata_info(metadata: &ArtifactMetadata) {
    println!("\n=== モデルメタデータ ===");
    println!("形式バージョン: {}", metadata.format_version);
    println!("ラベル ({}): {}", metadata.labels.len(), metadata.labels.labels().join(", "));
    println!("入力列: {}", describe_columns(&metadata.input_schema.columns));
    println!("バックボーン: {}", metadata.input_schema.backbone_identity);
    println!(
        "入力サイズ: {}x{}",
        metadata.feature_stage.image_size, metadata.feature_stage.image_size
    );
    println!("埋め込み次元: {}", metadata.input_schema.embedding_dim);
    println!("学習エポック数: {}", metadata.summary.epochs_completed);
    if let Some(accuracy) = metadata.summary.final_accuracy {
        println!("学習時正解率: {:.2}%", accuracy * 100.0);
    }
    println!("学習日時: {}", metadata.trained_at);
    println!("========================");
}
