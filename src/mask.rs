use crate::config::PAD_ID;
use burn::prelude::*;

/// 1 の位置を Attention から除外するマスク群
#[derive(Debug, Clone)]
pub struct Masks<B: Backend> {
    /// Encoder self-attention 用 [batch, 1, 1, input_len]
    pub encoder_padding: Tensor<B, 4>,
    /// Decoder cross-attention 用（入力側のパディング）[batch, 1, 1, input_len]
    pub decoder_padding: Tensor<B, 4>,
    /// Decoder self-attention 用（look-ahead とパディングの合成）[batch, 1, tgt_len, tgt_len]
    pub look_ahead: Tensor<B, 4>,
}

/// パディングマスク: PAD の位置が 1、それ以外が 0
///
/// ヘッドとクエリ方向にブロードキャストできるよう [batch, 1, 1, seq_len] で返す。
pub fn create_padding_mask<B: Backend>(ids: &Tensor<B, 2, Int>) -> Tensor<B, 4> {
    let [batch_size, seq_len] = ids.dims();

    ids.clone()
        .equal_elem(PAD_ID)
        .float()
        .reshape([batch_size, 1, 1, seq_len])
}

/// Look-ahead マスク: 位置 i から j > i を参照できないようにする狭義上三角行列
pub fn create_look_ahead_mask<B: Backend>(size: usize, device: &B::Device) -> Tensor<B, 2> {
    let mut values = Vec::with_capacity(size * size);
    for i in 0..size {
        for j in 0..size {
            values.push(if j > i { 1.0_f32 } else { 0.0 });
        }
    }

    Tensor::from_data(TensorData::new(values, [size, size]), device)
}

/// Encoder/Decoder 用の3種類のマスクを作成
pub fn create_masks<B: Backend>(
    input: &Tensor<B, 2, Int>,
    decoder_input: &Tensor<B, 2, Int>,
) -> Masks<B> {
    let device = input.device();
    let [_, target_len] = decoder_input.dims();

    let encoder_padding = create_padding_mask(input);
    let decoder_padding = create_padding_mask(input);

    let look_ahead = create_look_ahead_mask::<B>(target_len, &device)
        .reshape([1, 1, target_len, target_len]);
    let target_padding = create_padding_mask(decoder_input);
    // {0,1} 同士の要素ごとの最大値
    let combined = (target_padding + look_ahead).clamp_max(1.0);

    Masks {
        encoder_padding,
        decoder_padding,
        look_ahead: combined,
    }
}
