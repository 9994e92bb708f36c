//! ログ出力
//!
//! 処理の節目（マイルストーン）は `MilestoneSink` を通じて出力します。
//! コンソールとログファイル（追記のみ）の両方にタイムスタンプ付きで書き込む
//! `ConsoleFileSink` と、テスト用の `RecordingSink` を提供します。
//! 細かな診断ログは `tracing` を使用します。

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

/// 処理の節目
#[derive(Debug, Clone, PartialEq)]
pub enum Milestone {
    LoadingData,
    DataLoaded { training: usize, validation: usize },
    TrainingStarted { records: usize, classes: usize },
    TrainingCompleted { epochs: usize },
    ValidationStarted { records: usize },
    ValidationCompleted { macro_accuracy: f64 },
    /// 検証画像ごとの結果
    ImageEvaluated {
        image: String,
        actual: String,
        predicted: String,
    },
    SavingModel { path: PathBuf },
    ModelSaved { path: PathBuf },
    LoadingModel { path: PathBuf },
    ModelLoaded { path: PathBuf },
    ClassifyingImages { count: usize },
    ImageClassified { image: String, predicted: String },
    ImageFailed { image: String, reason: String },
    /// 致命的エラー（成功時のマイルストーンとは必ず区別される）
    Failed { stage: Stage, reason: String },
}

/// 致命的エラーが発生した処理段階
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Loading,
    Training,
    Validation,
    Saving,
    ModelLoading,
    Classification,
    Cache,
    Configuration,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Loading => "loading data",
            Stage::Training => "training",
            Stage::Validation => "validation",
            Stage::Saving => "saving model",
            Stage::ModelLoading => "loading model",
            Stage::Classification => "classification",
            Stage::Cache => "preparing embedding cache",
            Stage::Configuration => "writing configuration",
        };
        f.write_str(name)
    }
}

impl Milestone {
    pub fn is_failure(&self) -> bool {
        matches!(self, Milestone::Failed { .. })
    }
}

impl fmt::Display for Milestone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Milestone::LoadingData => write!(f, "Loading data"),
            Milestone::DataLoaded { training, validation } => write!(
                f,
                "Data loaded: {} training / {} validation images",
                training, validation
            ),
            Milestone::TrainingStarted { records, classes } => {
                write!(f, "Training starts ({} images, {} classes)", records, classes)
            }
            Milestone::TrainingCompleted { epochs } => {
                write!(f, "Training completed ({} epochs)", epochs)
            }
            Milestone::ValidationStarted { records } => {
                write!(f, "Validating model ({} images)", records)
            }
            Milestone::ValidationCompleted { macro_accuracy } => write!(
                f,
                "Validation completed. Macro Accuracy: {:.4}",
                macro_accuracy
            ),
            Milestone::ImageEvaluated { image, actual, predicted } => write!(
                f,
                "* Image: {} | Actual damage: {} | Predicted: {}",
                image, actual, predicted
            ),
            Milestone::SavingModel { path } => write!(f, "Saving model to {}", path.display()),
            Milestone::ModelSaved { path } => write!(f, "Model saved: {}", path.display()),
            Milestone::LoadingModel { path } => write!(f, "Loading model from {}", path.display()),
            Milestone::ModelLoaded { path } => write!(f, "Model loaded: {}", path.display()),
            Milestone::ClassifyingImages { count } => write!(f, "Classifying {} images", count),
            Milestone::ImageClassified { image, predicted } => {
                write!(f, "* Image: {} | Predicted damage: {}", image, predicted)
            }
            Milestone::ImageFailed { image, reason } => {
                write!(f, "* Image: {} | FAILED: {}", image, reason)
            }
            Milestone::Failed { stage, reason } => write!(f, "FAILED while {}: {}", stage, reason),
        }
    }
}

/// マイルストーンの出力先
pub trait MilestoneSink {
    fn emit(&self, milestone: Milestone);

    /// 書き込みバッファをフラッシュ（プロセス終了時に呼ぶ）
    fn flush(&self) {}
}

/// 結果がエラーなら `Failed` を出力してそのまま返す
pub fn report_failure<T, E: fmt::Display>(sink: &dyn MilestoneSink, stage: Stage, result: Result<T, E>) -> Result<T, E> {
    if let Err(ref e) = result {
        sink.emit(Milestone::Failed {
            stage,
            reason: format!("{:#}", e),
        });
    }
    result
}

/// コンソールとログファイルへ出力するシンク
pub struct ConsoleFileSink {
    log_path: PathBuf,
    file: Mutex<File>,
}

impl ConsoleFileSink {
    /// ログファイルを追記モードで開く
    pub fn open(log_path: impl AsRef<Path>) -> std::io::Result<Self> {
        let log_path = log_path.as_ref().to_path_buf();
        if let Some(parent) = log_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&log_path)?;
        Ok(Self {
            log_path,
            file: Mutex::new(file),
        })
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }
}

/// `hh.mm.ss.ffffff -> message...` 形式の1行
pub fn format_line(message: &str) -> String {
    let time = chrono::Local::now().format("%H.%M.%S%.6f");
    format!("{} -> {}...", time, message)
}

impl MilestoneSink for ConsoleFileSink {
    fn emit(&self, milestone: Milestone) {
        let line = format_line(&milestone.to_string());
        if milestone.is_failure() {
            eprintln!("{}", line);
        } else {
            println!("{}", line);
        }

        // ログ書き込み失敗で処理を止めない
        match self.file.lock() {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{}", line) {
                    tracing::warn!("failed to append to {}: {}", self.log_path.display(), e);
                }
            }
            Err(_) => tracing::warn!("log file lock poisoned: {}", self.log_path.display()),
        }
    }

    fn flush(&self) {
        if let Ok(mut file) = self.file.lock() {
            file.flush().ok();
        }
    }
}

impl Drop for ConsoleFileSink {
    fn drop(&mut self) {
        MilestoneSink::flush(self);
    }
}

/// マイルストーンをメモリ上に記録するシンク（テスト・組み込み用）
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Milestone>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Milestone> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn last(&self) -> Option<Milestone> {
        self.events().pop()
    }
}

impl MilestoneSink for RecordingSink {
    fn emit(&self, milestone: Milestone) {
        if let Ok(mut events) = self.events.lock() {
            events.push(milestone);
        }
    }
}

/// `tracing` の購読者を初期化（`DAMAGE_LOG` → `RUST_LOG` → info の順）
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env("DAMAGE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClassifierError;

    #[test]
    fn test_console_file_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/log.txt");

        {
            let sink = ConsoleFileSink::open(&path).unwrap();
            sink.emit(Milestone::LoadingData);
        }
        {
            let sink = ConsoleFileSink::open(&path).unwrap();
            sink.emit(Milestone::TrainingCompleted { epochs: 3 });
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("-> Loading data..."));
        assert!(lines[1].contains("Training completed (3 epochs)"));
    }

    #[test]
    fn test_report_failure_emits_failed() {
        let sink = RecordingSink::new();
        let result: Result<(), _> = report_failure(&sink, Stage::Training, Err(ClassifierError::EmptyTrainingSet));
        assert!(result.is_err());
        assert_eq!(
            sink.last(),
            Some(Milestone::Failed {
                stage: Stage::Training,
                reason: "training subset is empty".to_string(),
            })
        );

        let ok = report_failure::<_, ClassifierError>(&sink, Stage::Training, Ok(1));
        assert_eq!(ok.unwrap(), 1);
        assert_eq!(sink.events().len(), 1);

        let config: anyhow::Result<()> = Err(anyhow::anyhow!("permission denied").context("Failed to write config"));
        assert!(report_failure(&sink, Stage::Configuration, config).is_err());
        assert_eq!(
            sink.last(),
            Some(Milestone::Failed {
                stage: Stage::Configuration,
                reason: "Failed to write config: permission denied".to_string(),
            })
        );
    }

    #[test]
    fn test_failure_display_is_distinct() {
        let failed = Milestone::Failed {
            stage: Stage::Saving,
            reason: "disk full".into(),
        };
        assert!(failed.is_failure());
        assert!(!Milestone::ModelSaved { path: "m.tar.gz".into() }.is_failure());
        assert_eq!(failed.to_string(), "FAILED while saving model: disk full");
    }
}
