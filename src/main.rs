//! 車両損傷画像分類器 CLI
//!
//! 使い方:
//!   damage_classifier train
//!   damage_classifier classify <画像>...
//!   damage_classifier run [<画像>...]
//!   damage_classifier show-model
//!   damage_classifier clear-cache

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;
use clap::{Parser, Subcommand};

use damage_classifier_lib::logging::{init_tracing, report_failure, ConsoleFileSink, MilestoneSink, Stage};
use damage_classifier_lib::ml_commands::{classify_command, clear_cache_command, run_command, train_command};
use damage_classifier_lib::model::{load_metadata, print_metadata_info, AppConfig, DeviceType};

#[derive(Parser, Debug)]
#[command(author, version, about = "Vehicle damage image classifier")]
struct Cli {
    /// 設定ファイル（JSON）
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// 設定ファイルのモデルパスを上書き
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// 埋め込みキャッシュを使わない
    #[arg(long)]
    no_cache: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// マニフェストの学習サブセットで学習し、検証サブセットで評価して保存
    Train,
    /// 保存済みモデルで画像を分類
    Classify {
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// 学習・保存の後、保存したモデルで分類（画像省略時は検証サブセット）
    Run { images: Vec<PathBuf> },
    /// 保存済みモデルのメタデータを表示
    ShowModel,
    /// 埋め込みキャッシュを削除
    ClearCache,
    /// 現在の設定を表示（`--save` でデフォルト値を書き出す）
    Config {
        #[arg(long)]
        save: bool,
    },
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let mut config = AppConfig::load_or_default(&cli.config);
    if let Some(model) = &cli.model {
        config.model_path = model.clone();
    }
    if cli.no_cache {
        config.cache.enabled = false;
    }

    let sink = match ConsoleFileSink::open(&config.log_path) {
        Ok(sink) => sink,
        Err(e) => {
            eprintln!("failed to open log file {}: {}", config.log_path.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let result = dispatch(&cli, &config, &sink);
    sink.flush();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn dispatch(cli: &Cli, config: &AppConfig, sink: &dyn MilestoneSink) -> Result<()> {
    match config.device_type {
        DeviceType::Cpu => execute::<NdArray, Autodiff<NdArray>>(cli, config, &Default::default(), sink),
        #[cfg(feature = "wgpu")]
        DeviceType::Wgpu => {
            use burn_wgpu::Wgpu;
            execute::<Wgpu, Autodiff<Wgpu>>(cli, config, &Default::default(), sink)
        }
        #[cfg(not(feature = "wgpu"))]
        DeviceType::Wgpu => {
            tracing::warn!("built without the `wgpu` feature; falling back to CPU");
            execute::<NdArray, Autodiff<NdArray>>(cli, config, &Default::default(), sink)
        }
    }
}

fn execute<B, AB>(cli: &Cli, config: &AppConfig, device: &B::Device, sink: &dyn MilestoneSink) -> Result<()>
where
    B: Backend,
    AB: AutodiffBackend<InnerBackend = B, Device = B::Device>,
{
    match &cli.command {
        Command::Train => {
            let report = train_command::<B, AB>(config, device, sink)?;
            println!(
                "Macro Accuracy: {:.4} ({} epochs) -> {}",
                report.metrics.macro_accuracy,
                report.model.summary().epochs_completed,
                report.model_path.display()
            );
        }
        Command::Classify { images } => {
            classify_command::<B>(config, &config.model_path, images, device, sink)?;
        }
        Command::Run { images } => {
            run_command::<B, AB>(config, images, device, sink)?;
        }
        Command::ShowModel => {
            let metadata = report_failure(sink, Stage::ModelLoading, load_metadata(&config.model_path))?;
            print_metadata_info(&metadata);
        }
        Command::ClearCache => {
            let removed = clear_cache_command(config, sink)?;
            println!("{} 件の埋め込みを削除しました: {}", removed, config.cache.dir.display());
        }
        Command::Config { save } => {
            config.display();
            if *save {
                report_failure(sink, Stage::Configuration, config.save(&cli.config))?;
                println!("設定ファイルを保存しました: {}", cli.config.display());
            }
        }
    }
    Ok(())
}
