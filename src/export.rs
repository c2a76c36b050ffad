use crate::error::Result;
use crate::model::AttentionWeights;
use burn::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};

// これより長いシーケンスは CSV にしても読めないので出力しない
const MAX_EXPORT_SEQ_LEN: usize = 64;

/// Decoder の全レイヤーの Attention 行列を CSV ファイルにエクスポート
///
/// ファイル名は `decoder_layer{n}_{self|cross}_batch{b}_head{h}.csv`。
/// 書き出したファイルのパスを返す。
pub fn export_attention_to_csv<B: Backend>(
    attention_weights: &AttentionWeights<B>,
    save_dir: &Path,
) -> Result<Vec<PathBuf>> {
    let exports_dir = save_dir.join("exports");
    fs::create_dir_all(&exports_dir)?;

    let mut written = Vec::new();
    for (layer, block, weights) in attention_weights.iter() {
        let layer_name = format!("decoder_layer{}_{}", layer + 1, block.name());
        written.extend(export_matrix(weights, &exports_dir, &layer_name)?);
    }

    Ok(written)
}

/// attn_weights: [batch, n_heads, seq_q, seq_k]
fn export_matrix<B: Backend>(
    attn_weights: &Tensor<B, 4>,
    exports_dir: &Path,
    layer_name: &str,
) -> Result<Vec<PathBuf>> {
    let [batch_size, n_heads, seq_q, seq_k] = attn_weights.dims();

    if seq_q > MAX_EXPORT_SEQ_LEN || seq_k > MAX_EXPORT_SEQ_LEN {
        println!(
            "警告: シーケンス長が{}x{}と長いため、{} の CSV出力をスキップします",
            seq_q, seq_k, layer_name
        );
        return Ok(Vec::new());
    }

    // データをホストに転送
    let attn_data: Vec<f32> = attn_weights.to_data().iter::<f32>().collect();

    let mut written = Vec::new();
    for batch_idx in 0..batch_size {
        for head_idx in 0..n_heads {
            let filename = format!("{}_batch{}_head{}.csv", layer_name, batch_idx, head_idx);
            let filepath = exports_dir.join(filename);

            let mut csv_content = String::new();

            // ヘッダー行（列番号）
            csv_content.push_str("query\\key");
            for key_idx in 0..seq_k {
                csv_content.push_str(&format!(",{}", key_idx));
            }
            csv_content.push('\n');

            for query_idx in 0..seq_q {
                csv_content.push_str(&format!("{}", query_idx));
                for key_idx in 0..seq_k {
                    let index = batch_idx * (n_heads * seq_q * seq_k)
                        + head_idx * (seq_q * seq_k)
                        + query_idx * seq_k
                        + key_idx;
                    csv_content.push_str(&format!(",{:.6}", attn_data[index]));
                }
                csv_content.push('\n');
            }

            fs::write(&filepath, csv_content)?;
            println!("  Attention行列を出力: {}", filepath.display());
            written.push(filepath);
        }
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AttentionBlock;
    use burn::backend::ndarray::NdArray;

    #[test]
    fn writes_one_file_per_layer_block_and_head() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();

        let mut weights = AttentionWeights::<NdArray>::new();
        weights.push(0, AttentionBlock::SelfAttention, Tensor::ones([1, 2, 3, 3], &device));
        weights.push(0, AttentionBlock::CrossAttention, Tensor::ones([1, 2, 3, 4], &device));

        let written = export_attention_to_csv(&weights, dir.path()).unwrap();
        assert_eq!(written.len(), 4);

        let cross = dir
            .path()
            .join("exports")
            .join("decoder_layer1_cross_batch0_head1.csv");
        let content = fs::read_to_string(cross).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "query\\key,0,1,2,3");
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[1], "0,1.000000,1.000000,1.000000,1.000000");
    }
}
