use korean_polisher::checkpoint::CheckpointStore;
use korean_polisher::config::{TrainingConfig, TransformerConfig};
use korean_polisher::data::PolishData;
use korean_polisher::inference::{
    polish_and_export, run_inference, PolishText, Polisher, RunDemo,
};
use korean_polisher::metrics::save_metrics;
use korean_polisher::tokenizer::PolisherTokenizer;
use korean_polisher::training::{build_trainer, train_polisher, TrainingBackend, TrainingInputs};

use anyhow::{anyhow, Context, Result};
use burn::backend::wgpu::{Wgpu, WgpuDevice};
use burn::module::AutodiffModule;
use burn::prelude::*;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Transformer による韓国語文の校正モデル
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 訓練モード（訓練を実行する場合に指定）
    #[arg(long)]
    train: bool,

    /// 訓練設定の JSON ファイル
    #[arg(long)]
    config: Option<PathBuf>,

    /// 訓練データ（原文[TAB]校正文）
    #[arg(long)]
    data: Option<PathBuf>,

    /// 検証データ（原文[TAB]校正文）
    #[arg(long)]
    valid: Option<PathBuf>,

    /// トークナイザー（tokenizer.json）
    #[arg(long, default_value = "tokenizer.json")]
    tokenizer: PathBuf,

    /// チェックポイントを保存・読み込みするディレクトリ
    #[arg(long, default_value = "checkpoints")]
    checkpoint_dir: PathBuf,

    /// 最新のチェックポイントから訓練を再開
    #[arg(long)]
    resume: bool,

    /// 校正するテキスト
    #[arg(long)]
    predict: Option<String>,

    /// デモ用の文を1行ずつ書いたファイル（訓練時はエポックごとに実行）
    #[arg(long)]
    demo: Option<PathBuf>,

    /// バックエンドの選択（auto, wgpu, ndarray）
    #[arg(long, default_value = "wgpu")]
    backend: String,

    /// Attention行列をCSVエクスポート（推論時のみ）
    #[arg(long)]
    export_attn: bool,
}

/// --config > 再開時の保存済み設定 > トークナイザーの語彙サイズから作るデフォルト
fn load_training_config(
    args: &Args,
    store: &CheckpointStore,
    tokenizer: &PolisherTokenizer,
) -> Result<TrainingConfig> {
    if let Some(config_path) = &args.config {
        return TrainingConfig::load(config_path)
            .map_err(|e| anyhow!("設定ファイルを読み込めません {}: {:?}", config_path.display(), e));
    }

    if args.resume && store.dir().join("config.json").exists() {
        return Ok(store.load_config()?);
    }

    let vocab_size = tokenizer.vocab_size();
    let model = TransformerConfig::new()
        .with_input_vocab_size(vocab_size)
        .with_target_vocab_size(vocab_size);
    Ok(TrainingConfig::with_model(model))
}

fn load_data(
    tokenizer: &PolisherTokenizer,
    path: &Path,
    max_position: usize,
) -> Result<PolishData> {
    PolishData::load(tokenizer, path, max_position)
        .with_context(|| format!("データを読み込めません: {}", path.display()))
}

fn main() -> Result<()> {
    let start_time = Instant::now();

    let args = Args::parse();

    let tokenizer =
        PolisherTokenizer::from_file(&args.tokenizer).context("トークナイザーを読み込めません")?;
    let store = CheckpointStore::new(&args.checkpoint_dir);
    let export_dir = args.export_attn.then_some(args.checkpoint_dir.as_path());

    // 訓練直後のモデル（推論用）
    let mut trained = None;

    // 訓練モード
    if args.train {
        println!("\n===== 訓練開始 =====");
        let config = load_training_config(&args, &store, &tokenizer)?;
        config.validate()?;
        TrainingBackend::seed(config.seed);

        let data_path = args
            .data
            .as_deref()
            .context("--train には --data が必要です")?;
        let train_data = load_data(&tokenizer, data_path, config.model.max_position)?;
        let valid_data = args
            .valid
            .as_deref()
            .map(|path| load_data(&tokenizer, path, config.model.max_position))
            .transpose()?;

        store.save_config(&config)?;

        let device = WgpuDevice::default();
        let trainer = build_trainer::<TrainingBackend>(&config, &device)?;
        let (trainer, resume_from) = if args.resume {
            trainer.resume(&store)?
        } else {
            (trainer, None)
        };

        let inputs = TrainingInputs {
            train_data: &train_data,
            valid_data: valid_data.as_ref(),
            tokenizer: &tokenizer,
            demo_file: args.demo.as_deref(),
        };
        let (trainer, training_metrics) =
            train_polisher(trainer, &config, &inputs, &store, resume_from)?;
        println!("訓練完了！");

        save_metrics(store.dir(), &config, &training_metrics)?;
        trained = Some(Polisher::<Wgpu, _, _>::new(
            trainer.model().valid(),
            &tokenizer,
            config.max_decode_length,
            device,
        ));
    }

    // 推論モード
    if let Some(predict_text) = &args.predict {
        println!("\n===== 推論 =====");

        let polished = match &trained {
            // 訓練直後の場合はそのモデルで推論
            Some(polisher) => polish_and_export(polisher, predict_text, export_dir)?,
            // それ以外は保存済みチェックポイントを指定されたバックエンドで推論
            None => run_inference(
                &args.backend,
                &args.checkpoint_dir,
                &tokenizer,
                PolishText {
                    text: predict_text,
                    export_dir,
                },
            )?,
        };
        println!("入力: {} → 校正: {}", predict_text, polished);
    }

    // デモ（訓練時はエポックごとに実行済み）
    if let (false, Some(demo_file)) = (args.train, args.demo.as_deref()) {
        println!("\n===== デモ =====");
        let polished = run_inference(
            &args.backend,
            &args.checkpoint_dir,
            &tokenizer,
            RunDemo { demo_file },
        )?;
        println!("{}文を校正しました", polished);
    }

    if !args.train && args.predict.is_none() && args.demo.is_none() {
        println!("===== 使用方法 =====");
        println!("  訓練: cargo run --release -- --train --data data/train.tsv --valid data/valid.tsv");
        println!("  推論: cargo run --release -- --predict \"안녕 하세요\"");
        println!("  デモ: cargo run --release -- --demo demo.txt --backend ndarray");
        println!("  継続訓練: cargo run --release -- --train --resume --data data/train.tsv");
    }

    let duration = start_time.elapsed();
    println!("\n実行時間: {:.2}秒", duration.as_secs_f64());

    Ok(())
}
