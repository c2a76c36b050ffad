#![allow(dead_code)]

use burn::backend::ndarray::NdArray;
use burn::backend::Autodiff;
use burn::prelude::*;
use korean_polisher::config::{TrainingConfig, TransformerConfig};
use korean_polisher::error::Result;
use korean_polisher::tokenizer::Tokenizer;

pub type TestBackend = NdArray;
pub type TestAutodiffBackend = Autodiff<NdArray>;

pub const VOCAB_SIZE: usize = 16;

/// テスト用の小さいモデル設定（Dropout なし）
pub fn tiny_model_config() -> TransformerConfig {
    TransformerConfig::new()
        .with_num_layers(2)
        .with_d_model(16)
        .with_num_heads(4)
        .with_dff(32)
        .with_dropout_rate(0.0)
        .with_input_vocab_size(VOCAB_SIZE)
        .with_target_vocab_size(VOCAB_SIZE)
        .with_max_position(16)
}

pub fn tiny_training_config() -> TrainingConfig {
    TrainingConfig::with_model(tiny_model_config())
        .with_batch_size(2)
        .with_epochs(2)
        .with_warmup_steps(50)
        .with_max_decode_length(8)
        .with_log_every(1)
        .with_checkpoint_every(1000)
}

/// 単語 `t<n>` を ID n に、それ以外の単語を 4..14 に割り当てるトークナイザー
pub struct StubTokenizer;

impl Tokenizer for StubTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<i32>> {
        Ok(text
            .split_whitespace()
            .map(|word| {
                word.strip_prefix('t')
                    .and_then(|n| n.parse().ok())
                    .unwrap_or(4 + (word.chars().count() % 10) as i32)
            })
            .collect())
    }

    fn decode(&self, ids: &[i32]) -> Result<String> {
        Ok(ids
            .iter()
            .map(|id| format!("t{}", id))
            .collect::<Vec<_>>()
            .join(" "))
    }
}

pub fn ids<B: Backend>(rows: &[&[i32]], device: &B::Device) -> Tensor<B, 2, Int> {
    let len = rows[0].len();
    let flattened: Vec<i32> = rows.iter().flat_map(|row| row.iter().copied()).collect();
    Tensor::from_data(TensorData::new(flattened, [rows.len(), len]), device)
}

pub fn to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f32> {
    tensor.into_data().iter::<f32>().collect()
}

/// テンソル間の近似一致を検証
pub fn assert_tensors_close<B: Backend, const D: usize>(
    a: Tensor<B, D>,
    b: Tensor<B, D>,
    tolerance: f32,
) {
    assert_eq!(a.dims(), b.dims());
    let max_diff = to_vec((a - b).abs())
        .into_iter()
        .fold(0.0_f32, f32::max);
    assert!(max_diff < tolerance, "最大差: {}", max_diff);
}
