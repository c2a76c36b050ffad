use crate::config::{END_ID, PAD_ID, START_ID};
use crate::error::{PolisherError, Result};
use crate::tokenizer::Tokenizer;
use burn::prelude::*;
use std::fs;
use std::path::Path;

/// パディング済みのミニバッチ
#[derive(Debug, Clone)]
pub struct Batch {
    pub inputs: Vec<Vec<i32>>,
    /// [START, ..., END, PAD...]
    pub targets: Vec<Vec<i32>>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// (入力 [batch, input_len], ターゲット [batch, target_len]) のテンソルに変換
    pub fn to_tensors<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<(Tensor<B, 2, Int>, Tensor<B, 2, Int>)> {
        Ok((
            ids_to_tensor(&self.inputs, device)?,
            ids_to_tensor(&self.targets, device)?,
        ))
    }
}

/// 校正前後の文ペア
pub struct PolishData {
    pub samples: Vec<(Vec<i32>, Vec<i32>)>, // (入力: 原文, 出力: 校正文)
}

impl PolishData {
    /// TSV形式のファイルから読み込む
    /// 形式: 原文[TAB]校正文
    ///
    /// max_position を超える文はスキップする。
    pub fn load<T: Tokenizer>(
        tokenizer: &T,
        file_path: &Path,
        max_position: usize,
    ) -> Result<Self> {
        let content = fs::read_to_string(file_path)?;

        let mut samples = Vec::new();

        for line in content.lines() {
            let line = line.trim();

            // 空行とコメント行をスキップ
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let parts: Vec<&str> = line.split('\t').collect();
            if parts.len() != 2 {
                eprintln!("Warning: 無効な行形式 (TAB区切りではありません): {}", line);
                continue;
            }

            let source_text = parts[0].trim();
            let polished_text = parts[1].trim();

            let source_tokens = tokenizer.encode(source_text)?;
            if source_tokens.is_empty() {
                eprintln!("Warning: 原文のエンコードが空です: {}", source_text);
                continue;
            }

            let target_sequence = with_boundaries(tokenizer.encode(polished_text)?);

            if source_tokens.len() > max_position || target_sequence.len() > max_position {
                eprintln!(
                    "Warning: 最大長 {} を超えるためスキップ: {}",
                    max_position, source_text
                );
                continue;
            }

            samples.push((source_tokens, target_sequence));
        }

        println!("校正サンプル数: {} ({})", samples.len(), file_path.display());

        Ok(Self { samples })
    }

    /// エンコード済みのペアから作成（ターゲットの START/END は補完する）
    pub fn from_pairs(pairs: Vec<(Vec<i32>, Vec<i32>)>) -> Self {
        let samples = pairs
            .into_iter()
            .map(|(input, target)| (input, with_boundaries(target)))
            .collect();

        Self { samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// ファイル順にバッチを生成（バッチ内の最大長まで PAD で右詰め）
    pub fn batches(&self, batch_size: usize) -> Vec<Batch> {
        self.samples
            .chunks(batch_size.max(1))
            .map(|chunk| {
                let max_input_len = chunk.iter().map(|(input, _)| input.len()).max();
                let max_target_len = chunk.iter().map(|(_, target)| target.len()).max();
                let max_input_len = max_input_len.unwrap_or(0);
                let max_target_len = max_target_len.unwrap_or(0);

                Batch {
                    inputs: chunk
                        .iter()
                        .map(|(input, _)| pad_to(input, max_input_len))
                        .collect(),
                    targets: chunk
                        .iter()
                        .map(|(_, target)| pad_to(target, max_target_len))
                        .collect(),
                }
            })
            .collect()
    }

    /// 全サンプルを1つの長さに揃えたテンソル（評価用）
    pub fn to_tensors<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<(Tensor<B, 2, Int>, Tensor<B, 2, Int>)> {
        let batch = self
            .batches(self.samples.len())
            .into_iter()
            .next()
            .ok_or_else(|| PolisherError::InvalidBatch("データが空です".to_string()))?;

        batch.to_tensors(device)
    }
}

/// 先頭に START、末尾に END がなければ付け足す
fn with_boundaries(mut ids: Vec<i32>) -> Vec<i32> {
    if ids.first() != Some(&START_ID) {
        ids.insert(0, START_ID);
    }
    if ids.len() < 2 || ids.last() != Some(&END_ID) {
        ids.push(END_ID);
    }
    ids
}

fn pad_to(ids: &[i32], len: usize) -> Vec<i32> {
    let mut padded = ids.to_vec();
    padded.resize(len, PAD_ID);
    padded
}

/// 同じ長さの ID 列を [rows, len] の Int テンソルにする
pub fn ids_to_tensor<B: Backend>(
    rows: &[Vec<i32>],
    device: &B::Device,
) -> Result<Tensor<B, 2, Int>> {
    let len = rows.first().map(|row| row.len()).unwrap_or(0);
    if rows.is_empty() || len == 0 {
        return Err(PolisherError::InvalidBatch("空のバッチです".to_string()));
    }
    if rows.iter().any(|row| row.len() != len) {
        return Err(PolisherError::InvalidBatch(
            "バッチ内の長さが揃っていません".to_string(),
        ));
    }

    let flattened: Vec<i32> = rows.iter().flatten().copied().collect();
    Ok(Tensor::from_data(TensorData::new(flattened, [rows.len(), len]), device))
}
