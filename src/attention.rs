use crate::error::{PolisherError, Result};
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;

/// マスクされた位置に加算する値
const MASK_FILL: f32 = -1e9;

/// Scaled Dot-Product Attention
///
/// q: [batch, heads, seq_q, depth], k/v: [batch, heads, seq_k, depth]
/// mask: スコア [batch, heads, seq_q, seq_k] の末尾2軸にブロードキャスト可能な {0,1} テンソル
///
/// 戻り値は (出力 [batch, heads, seq_q, depth], Attention重み [batch, heads, seq_q, seq_k])。
/// 1行すべてがマスクされた場合の特別扱いはしない（正しい入力では自分自身の位置が残る）。
pub fn scaled_dot_product_attention<B: Backend>(
    q: Tensor<B, 4>,
    k: Tensor<B, 4>,
    v: Tensor<B, 4>,
    mask: Option<Tensor<B, 4>>,
) -> (Tensor<B, 4>, Tensor<B, 4>) {
    let depth = k.dims()[3];

    // Q × K^T / sqrt(depth)
    let scores = q.matmul(k.transpose());
    let scores = scores.div_scalar((depth as f32).sqrt());

    let scores = match mask {
        Some(mask) => scores + mask.mul_scalar(MASK_FILL),
        None => scores,
    };

    // softmax は最大値を引いてから計算される
    let attention_weights = burn::tensor::activation::softmax(scores, 3);
    let output = attention_weights.clone().matmul(v);

    (output, attention_weights)
}

/// Multi-Head Attention の出力
#[derive(Debug, Clone)]
pub struct AttentionOutput<B: Backend> {
    /// [batch, seq_q, d_model]
    pub context: Tensor<B, 3>,
    /// [batch, heads, seq_q, seq_k]
    pub weights: Tensor<B, 4>,
}

#[derive(Module, Debug)]
pub struct MultiHeadAttention<B: Backend> {
    w_q: Linear<B>,
    w_k: Linear<B>,
    w_v: Linear<B>,
    // 出力射影
    w_o: Linear<B>,
    num_heads: usize,
    head_depth: usize,
}

impl<B: Backend> MultiHeadAttention<B> {
    /// d_model が num_heads で割り切れない場合はエラー
    pub fn new(d_model: usize, num_heads: usize, device: &B::Device) -> Result<Self> {
        if num_heads == 0 || d_model % num_heads != 0 {
            return Err(PolisherError::HeadsMismatch { d_model, num_heads });
        }

        Ok(Self {
            w_q: LinearConfig::new(d_model, d_model).init(device),
            w_k: LinearConfig::new(d_model, d_model).init(device),
            w_v: LinearConfig::new(d_model, d_model).init(device),
            w_o: LinearConfig::new(d_model, d_model).init(device),
            num_heads,
            head_depth: d_model / num_heads,
        })
    }

    /// query: [batch, seq_q, d_model], key/value: [batch, seq_k, d_model]
    ///
    /// Self-Attention では3つとも同じテンソル、Cross-Attention では key/value に Encoder 出力を渡す。
    pub fn forward(
        &self,
        query: Tensor<B, 3>,
        key: Tensor<B, 3>,
        value: Tensor<B, 3>,
        mask: Option<Tensor<B, 4>>,
    ) -> AttentionOutput<B> {
        let [batch_size, seq_q, d_model] = query.dims();

        let q = self.split_heads(self.w_q.forward(query));
        let k = self.split_heads(self.w_k.forward(key));
        let v = self.split_heads(self.w_v.forward(value));

        let (scaled, weights) = scaled_dot_product_attention(q, k, v, mask);

        // [batch, heads, seq_q, depth] → [batch, seq_q, d_model]
        let concat = scaled.swap_dims(1, 2).reshape([batch_size, seq_q, d_model]);

        AttentionOutput {
            context: self.w_o.forward(concat),
            weights,
        }
    }

    /// [batch, seq, d_model] → [batch, heads, seq, depth]
    fn split_heads(&self, x: Tensor<B, 3>) -> Tensor<B, 4> {
        let [batch_size, seq_len, _] = x.dims();

        x.reshape([batch_size, seq_len, self.num_heads, self.head_depth])
            .swap_dims(1, 2)
    }
}
