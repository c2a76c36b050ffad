use crate::config::{TrainingConfig, PAD_ID};
use crate::error::Result;
use burn::prelude::*;
use burn::tensor::activation::log_softmax;
use burn::tensor::ElementConversion;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

// ===== マスク付き損失・正解率 =====

/// PAD 以外を 1 とするマスク [batch, seq_len]
fn non_pad_mask<B: Backend>(labels: &Tensor<B, 2, Int>) -> Tensor<B, 2> {
    labels.clone().not_equal_elem(PAD_ID).float()
}

/// マスク付きクロスエントロピー損失
///
/// logits: [batch, seq_len, vocab], labels: [batch, seq_len]
/// PAD の位置は損失に寄与しない: `sum(loss * mask) / sum(mask)`
pub fn masked_loss<B: Backend>(logits: Tensor<B, 3>, labels: Tensor<B, 2, Int>) -> Tensor<B, 1> {
    let [batch_size, seq_len] = labels.dims();
    let mask = non_pad_mask(&labels);

    let log_probs = log_softmax(logits, 2);
    let target_log_probs = log_probs
        .gather(2, labels.reshape([batch_size, seq_len, 1]))
        .reshape([batch_size, seq_len]);

    let token_loss = target_log_probs.neg() * mask.clone();

    token_loss.sum() / mask.sum()
}

/// PAD 以外の位置での正解率と、その位置数
pub fn masked_accuracy<B: Backend>(
    logits: Tensor<B, 3>,
    labels: Tensor<B, 2, Int>,
) -> (f32, usize) {
    let [batch_size, seq_len] = labels.dims();
    let mask = non_pad_mask(&labels);

    let predictions = logits.argmax(2).reshape([batch_size, seq_len]);
    let correct = predictions.equal(labels).float() * mask.clone();

    let token_count = mask.sum().into_scalar().elem::<f32>();
    if token_count == 0.0 {
        return (0.0, 0);
    }

    let correct_count = correct.sum().into_scalar().elem::<f32>();
    (correct_count / token_count, token_count as usize)
}

// ===== 移動平均 =====

/// 重み付きの累積平均
#[derive(Debug, Clone, Default)]
pub struct RunningMean {
    total: f64,
    weight: f64,
}

impl RunningMean {
    pub fn update(&mut self, value: f32, weight: f64) {
        if weight <= 0.0 {
            return;
        }
        self.total += value as f64 * weight;
        self.weight += weight;
    }

    pub fn result(&self) -> f32 {
        if self.weight == 0.0 {
            0.0
        } else {
            (self.total / self.weight) as f32
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// 損失と正解率の累積
///
/// 損失はバッチ単位の平均、正解率は PAD 以外のトークン数で重み付けした平均。
#[derive(Debug, Clone, Default)]
pub struct MetricTracker {
    loss: RunningMean,
    accuracy: RunningMean,
}

impl MetricTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, loss: f32, accuracy: f32, token_count: usize) {
        self.loss.update(loss, 1.0);
        self.accuracy.update(accuracy, token_count as f64);
    }

    pub fn loss(&self) -> f32 {
        self.loss.result()
    }

    pub fn accuracy(&self) -> f32 {
        self.accuracy.result()
    }

    pub fn reset(&mut self) {
        self.loss.reset();
        self.accuracy.reset();
    }
}

/// 評価結果
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub loss: f32,
    pub accuracy: f32,
}

// ===== ファイル出力 =====

/// history.txt に `\n<loss> <accuracy>` を追記
pub fn append_history(path: &Path, loss: f32, accuracy: f32) -> Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    write!(file, "\n{} {}", loss, accuracy)?;
    Ok(())
}

/// 訓練メトリクス
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TrainingMetrics {
    /// エポックごとの訓練損失
    pub loss_history: Vec<f32>,
    /// エポックごとの訓練正解率
    pub accuracy_history: Vec<f32>,
    /// エポックごとの検証結果
    pub evaluation_history: Vec<EvaluationResult>,
    pub final_loss: f32,
    /// 最後に使ったステップ番号
    pub steps: usize,
}

/// metrics.json の中身
#[derive(Serialize, Deserialize, Debug)]
pub struct MetricsFile {
    pub d_model: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub dff: usize,
    pub epochs: usize,
    pub batch_size: usize,
    pub warmup_steps: usize,
    pub training: TrainingMetrics,
    pub trained_at: String,
}

/// メトリクスを保存
pub fn save_metrics(
    save_dir: &Path,
    config: &TrainingConfig,
    training_metrics: &TrainingMetrics,
) -> Result<()> {
    fs::create_dir_all(save_dir)?;

    let metrics_file = MetricsFile {
        d_model: config.model.d_model,
        num_layers: config.model.num_layers,
        num_heads: config.model.num_heads,
        dff: config.model.dff,
        epochs: config.epochs,
        batch_size: config.batch_size,
        warmup_steps: config.warmup_steps,
        training: training_metrics.clone(),
        trained_at: chrono::Local::now().to_rfc3339(),
    };

    let metrics_path = save_dir.join("metrics.json");
    fs::write(&metrics_path, serde_json::to_string_pretty(&metrics_file)?)?;
    println!("メトリクスを保存: {}", metrics_path.display());

    Ok(())
}
