use crate::attention::MultiHeadAttention;
use crate::config::TransformerConfig;
use crate::error::{PolisherError, Result};
use crate::mask::Masks;
use burn::module::Ignored;
use burn::nn::{
    Dropout, DropoutConfig, Embedding, EmbeddingConfig, LayerNorm, LayerNormConfig, Linear,
    LinearConfig,
};
use burn::prelude::*;

const LAYER_NORM_EPSILON: f64 = 1e-6;

// ===== Positional Encoding =====

/// 学習しない正弦波位置エンコーディング表 [max_position, d_model]
#[derive(Debug, Clone)]
pub struct PositionalEncoding {
    table: Vec<f32>,
    max_position: usize,
    d_model: usize,
}

impl PositionalEncoding {
    pub fn new(max_position: usize, d_model: usize) -> Self {
        let mut table = Vec::with_capacity(max_position * d_model);

        for pos in 0..max_position {
            for i in 0..d_model {
                // angle = pos / 10000^(2 * (i / 2) / d_model)
                let exponent = (2 * (i / 2)) as f64 / d_model as f64;
                let angle = pos as f64 / 10000_f64.powf(exponent);
                let value = if i % 2 == 0 { angle.sin() } else { angle.cos() };
                table.push(value as f32);
            }
        }

        Self {
            table,
            max_position,
            d_model,
        }
    }

    pub fn max_position(&self) -> usize {
        self.max_position
    }

    pub fn value(&self, pos: usize, i: usize) -> f32 {
        self.table[pos * self.d_model + i]
    }

    /// 先頭 seq_len 行を [1, seq_len, d_model] で取り出す（seq_len <= max_position）
    pub fn slice<B: Backend>(&self, seq_len: usize, device: &B::Device) -> Tensor<B, 3> {
        let values = self.table[..seq_len * self.d_model].to_vec();
        Tensor::from_data(TensorData::new(values, [1, seq_len, self.d_model]), device)
    }
}

/// GELU（tanh 近似）
fn gelu<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    let coefficient = (2.0 / std::f32::consts::PI).sqrt();
    let cubic = x.clone() * x.clone() * x.clone();
    let inner = (x.clone() + cubic.mul_scalar(0.044715)).mul_scalar(coefficient);

    x.mul_scalar(0.5) * inner.tanh().add_scalar(1.0)
}

// ===== FeedForward =====

#[derive(Module, Debug)]
pub struct FeedForward<B: Backend> {
    w_1: Linear<B>,
    w_2: Linear<B>,
    dropout: Dropout,
}

impl<B: Backend> FeedForward<B> {
    pub fn new(d_model: usize, dff: usize, dropout_rate: f64, device: &B::Device) -> Self {
        Self {
            w_1: LinearConfig::new(d_model, dff).init(device),
            w_2: LinearConfig::new(dff, d_model).init(device),
            dropout: DropoutConfig::new(dropout_rate).init(),
        }
    }

    /// 位置ごとに独立に適用（位置間の混合はない）
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        // d_model → dff
        let hidden = gelu(self.w_1.forward(x));
        let hidden = self.dropout.forward(hidden);

        // dff → d_model
        self.w_2.forward(hidden)
    }
}

// ===== Encoder Layer =====

#[derive(Module, Debug)]
pub struct EncoderLayer<B: Backend> {
    attention: MultiHeadAttention<B>,
    feed_forward: FeedForward<B>,
    layer_norm1: LayerNorm<B>,
    layer_norm2: LayerNorm<B>,
    dropout1: Dropout,
    dropout2: Dropout,
}

impl<B: Backend> EncoderLayer<B> {
    pub fn new(config: &TransformerConfig, device: &B::Device) -> Result<Self> {
        Ok(Self {
            attention: MultiHeadAttention::new(config.d_model, config.num_heads, device)?,
            feed_forward: FeedForward::new(config.d_model, config.dff, config.dropout_rate, device),
            layer_norm1: layer_norm(config.d_model, device),
            layer_norm2: layer_norm(config.d_model, device),
            dropout1: DropoutConfig::new(config.dropout_rate).init(),
            dropout2: DropoutConfig::new(config.dropout_rate).init(),
        })
    }

    pub fn forward(&self, x: Tensor<B, 3>, padding_mask: Option<Tensor<B, 4>>) -> Tensor<B, 3> {
        // Post-LN方式: Attention → Dropout → 残差接続 → Layer Norm
        let attention = self
            .attention
            .forward(x.clone(), x.clone(), x.clone(), padding_mask);
        let attention_output = self.dropout1.forward(attention.context);
        let out1 = self.layer_norm1.forward(x + attention_output);

        let ff_output = self.dropout2.forward(self.feed_forward.forward(out1.clone()));
        self.layer_norm2.forward(out1 + ff_output)
    }
}

// ===== Decoder Layer =====

/// Decoder レイヤーの出力
#[derive(Debug, Clone)]
pub struct DecoderLayerOutput<B: Backend> {
    pub hidden: Tensor<B, 3>,
    /// マスク付き Self-Attention の重み
    pub self_attention: Tensor<B, 4>,
    /// Cross-Attention の重み
    pub cross_attention: Tensor<B, 4>,
}

#[derive(Module, Debug)]
pub struct DecoderLayer<B: Backend> {
    self_attention: MultiHeadAttention<B>,
    cross_attention: MultiHeadAttention<B>,
    feed_forward: FeedForward<B>,
    layer_norm1: LayerNorm<B>,
    layer_norm2: LayerNorm<B>,
    layer_norm3: LayerNorm<B>,
    dropout1: Dropout,
    dropout2: Dropout,
    dropout3: Dropout,
}

impl<B: Backend> DecoderLayer<B> {
    pub fn new(config: &TransformerConfig, device: &B::Device) -> Result<Self> {
        Ok(Self {
            self_attention: MultiHeadAttention::new(config.d_model, config.num_heads, device)?,
            cross_attention: MultiHeadAttention::new(config.d_model, config.num_heads, device)?,
            feed_forward: FeedForward::new(config.d_model, config.dff, config.dropout_rate, device),
            layer_norm1: layer_norm(config.d_model, device),
            layer_norm2: layer_norm(config.d_model, device),
            layer_norm3: layer_norm(config.d_model, device),
            dropout1: DropoutConfig::new(config.dropout_rate).init(),
            dropout2: DropoutConfig::new(config.dropout_rate).init(),
            dropout3: DropoutConfig::new(config.dropout_rate).init(),
        })
    }

    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        encoder_output: Tensor<B, 3>,
        look_ahead_mask: Option<Tensor<B, 4>>,
        padding_mask: Option<Tensor<B, 4>>,
    ) -> DecoderLayerOutput<B> {
        // 1. マスク付き Self-Attention
        let block1 = self
            .self_attention
            .forward(x.clone(), x.clone(), x.clone(), look_ahead_mask);
        let attn1 = self.dropout1.forward(block1.context);
        let out1 = self.layer_norm1.forward(attn1 + x);

        // 2. Cross-Attention（Query は out1、Key/Value は Encoder の出力）
        let block2 = self.cross_attention.forward(
            out1.clone(),
            encoder_output.clone(),
            encoder_output,
            padding_mask,
        );
        let attn2 = self.dropout2.forward(block2.context);
        let out2 = self.layer_norm2.forward(attn2 + out1);

        // 3. Feed-Forward
        let ff_output = self.dropout3.forward(self.feed_forward.forward(out2.clone()));
        let out3 = self.layer_norm3.forward(ff_output + out2);

        DecoderLayerOutput {
            hidden: out3,
            self_attention: block1.weights,
            cross_attention: block2.weights,
        }
    }
}

fn layer_norm<B: Backend>(d_model: usize, device: &B::Device) -> LayerNorm<B> {
    LayerNormConfig::new(d_model)
        .with_epsilon(LAYER_NORM_EPSILON)
        .init(device)
}

// ===== Attention Weights =====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionBlock {
    /// Decoder のマスク付き Self-Attention
    SelfAttention,
    /// Encoder 出力への Cross-Attention
    CrossAttention,
}

impl AttentionBlock {
    pub fn name(&self) -> &'static str {
        match self {
            AttentionBlock::SelfAttention => "self",
            AttentionBlock::CrossAttention => "cross",
        }
    }
}

/// (レイヤー番号, ブロック) ごとの Attention 重み。Decoder の forward のたびに作り直す。
#[derive(Debug, Clone)]
pub struct AttentionWeights<B: Backend> {
    entries: Vec<(usize, AttentionBlock, Tensor<B, 4>)>,
}

impl<B: Backend> AttentionWeights<B> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, layer: usize, block: AttentionBlock, weights: Tensor<B, 4>) {
        self.entries.push((layer, block, weights));
    }

    pub fn get(&self, layer: usize, block: AttentionBlock) -> Option<&Tensor<B, 4>> {
        self.entries
            .iter()
            .find(|(l, b, _)| *l == layer && *b == block)
            .map(|(_, _, weights)| weights)
    }

    /// 追加順（レイヤー順、各レイヤーで self → cross）に列挙
    pub fn iter(&self) -> impl Iterator<Item = (usize, AttentionBlock, &Tensor<B, 4>)> {
        self.entries
            .iter()
            .map(|(layer, block, weights)| (*layer, *block, weights))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<B: Backend> Default for AttentionWeights<B> {
    fn default() -> Self {
        Self::new()
    }
}

// ===== Encoder =====

#[derive(Module, Debug)]
pub struct Encoder<B: Backend> {
    embedding: Embedding<B>,
    positional_encoding: Ignored<PositionalEncoding>,
    layers: Vec<EncoderLayer<B>>,
    dropout: Dropout,
    d_model: usize,
}

impl<B: Backend> Encoder<B> {
    pub fn new(config: &TransformerConfig, device: &B::Device) -> Result<Self> {
        let layers = (0..config.num_layers)
            .map(|_| EncoderLayer::new(config, device))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            embedding: EmbeddingConfig::new(config.input_vocab_size, config.d_model).init(device),
            positional_encoding: Ignored(PositionalEncoding::new(
                config.max_position,
                config.d_model,
            )),
            layers,
            dropout: DropoutConfig::new(config.dropout_rate).init(),
            d_model: config.d_model,
        })
    }

    /// [batch, input_len] → [batch, input_len, d_model]
    pub fn forward(
        &self,
        ids: Tensor<B, 2, Int>,
        padding_mask: Option<Tensor<B, 4>>,
    ) -> Tensor<B, 3> {
        let x = embed(&self.embedding, &self.positional_encoding.0, self.d_model, ids);
        let mut x = self.dropout.forward(x);

        for layer in &self.layers {
            x = layer.forward(x, padding_mask.clone());
        }

        x
    }
}

// ===== Decoder =====

#[derive(Module, Debug)]
pub struct Decoder<B: Backend> {
    embedding: Embedding<B>,
    positional_encoding: Ignored<PositionalEncoding>,
    layers: Vec<DecoderLayer<B>>,
    dropout: Dropout,
    d_model: usize,
}

impl<B: Backend> Decoder<B> {
    pub fn new(config: &TransformerConfig, device: &B::Device) -> Result<Self> {
        let layers = (0..config.num_layers)
            .map(|_| DecoderLayer::new(config, device))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            embedding: EmbeddingConfig::new(config.target_vocab_size, config.d_model).init(device),
            positional_encoding: Ignored(PositionalEncoding::new(
                config.max_position,
                config.d_model,
            )),
            layers,
            dropout: DropoutConfig::new(config.dropout_rate).init(),
            d_model: config.d_model,
        })
    }

    /// [batch, target_len] → ([batch, target_len, d_model], Attention重み)
    pub fn forward(
        &self,
        ids: Tensor<B, 2, Int>,
        encoder_output: Tensor<B, 3>,
        look_ahead_mask: Option<Tensor<B, 4>>,
        padding_mask: Option<Tensor<B, 4>>,
    ) -> (Tensor<B, 3>, AttentionWeights<B>) {
        let x = embed(&self.embedding, &self.positional_encoding.0, self.d_model, ids);
        let mut x = self.dropout.forward(x);
        let mut attention_weights = AttentionWeights::new();

        for (index, layer) in self.layers.iter().enumerate() {
            let output = layer.forward(
                x,
                encoder_output.clone(),
                look_ahead_mask.clone(),
                padding_mask.clone(),
            );
            attention_weights.push(index, AttentionBlock::SelfAttention, output.self_attention);
            attention_weights.push(index, AttentionBlock::CrossAttention, output.cross_attention);
            x = output.hidden;
        }

        (x, attention_weights)
    }
}

/// 埋め込み × sqrt(d_model) + 位置エンコーディング
fn embed<B: Backend>(
    embedding: &Embedding<B>,
    positional_encoding: &PositionalEncoding,
    d_model: usize,
    ids: Tensor<B, 2, Int>,
) -> Tensor<B, 3> {
    let [_, seq_len] = ids.dims();
    let device = ids.device();

    let embedded = embedding.forward(ids).mul_scalar((d_model as f32).sqrt());
    embedded + positional_encoding.slice::<B>(seq_len, &device)
}

// ===== Transformer =====

/// forward の出力
#[derive(Debug, Clone)]
pub struct ModelOutput<B: Backend> {
    /// [batch, target_len, target_vocab_size]
    pub logits: Tensor<B, 3>,
    pub attention_weights: AttentionWeights<B>,
}

/// 入力列とDecoder入力列からロジットを計算するモデル
pub trait Seq2Seq<B: Backend> {
    fn forward(
        &self,
        input: Tensor<B, 2, Int>,
        decoder_input: Tensor<B, 2, Int>,
        masks: Masks<B>,
    ) -> Result<ModelOutput<B>>;
}

#[derive(Module, Debug)]
pub struct Transformer<B: Backend> {
    encoder: Encoder<B>,
    decoder: Decoder<B>,
    final_layer: Linear<B>,
    max_position: usize,
}

impl TransformerConfig {
    /// 検証してからモデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Transformer<B>> {
        self.validate()?;

        Ok(Transformer {
            encoder: Encoder::new(self, device)?,
            decoder: Decoder::new(self, device)?,
            final_layer: LinearConfig::new(self.d_model, self.target_vocab_size).init(device),
            max_position: self.max_position,
        })
    }
}

impl<B: Backend> Transformer<B> {
    pub fn max_position(&self) -> usize {
        self.max_position
    }

    fn check_length(&self, len: usize) -> Result<()> {
        if len > self.max_position {
            return Err(PolisherError::SequenceTooLong {
                len,
                max: self.max_position,
            });
        }
        Ok(())
    }
}

impl<B: Backend> Seq2Seq<B> for Transformer<B> {
    fn forward(
        &self,
        input: Tensor<B, 2, Int>,
        decoder_input: Tensor<B, 2, Int>,
        masks: Masks<B>,
    ) -> Result<ModelOutput<B>> {
        self.check_length(input.dims()[1])?;
        self.check_length(decoder_input.dims()[1])?;

        let encoder_output = self.encoder.forward(input, Some(masks.encoder_padding));
        let (decoder_output, attention_weights) = self.decoder.forward(
            decoder_input,
            encoder_output,
            Some(masks.look_ahead),
            Some(masks.decoder_padding),
        );

        Ok(ModelOutput {
            logits: self.final_layer.forward(decoder_output),
            attention_weights,
        })
    }
}
