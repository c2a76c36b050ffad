use crate::checkpoint::CheckpointStore;
use crate::config::{END_ID, START_ID};
use crate::data::ids_to_tensor;
use crate::error::{PolisherError, Result};
use crate::export::export_attention_to_csv;
use crate::mask::create_masks;
use crate::model::{AttentionWeights, Seq2Seq, Transformer};
use crate::tokenizer::Tokenizer;
use burn::backend::ndarray::NdArray;
use burn::backend::wgpu::{Wgpu, WgpuDevice};
use burn::prelude::*;
use burn::tensor::ElementConversion;
use std::fs;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::str::FromStr;

/// 貪欲法の生成結果
#[derive(Debug, Clone)]
pub struct Decoded<B: Backend> {
    /// START/END を含まない生成トークン列
    pub ids: Vec<i32>,
    pub text: String,
    /// 最後の Decoder 呼び出しの Attention 重み
    pub attention_weights: Option<AttentionWeights<B>>,
}

/// 1文を貪欲法で生成
///
/// Decoder 入力は `[START_ID]` から始まり、各ステップで最後の位置の argmax を追加する。
/// END_ID が出たらそこで終了し、END_ID 自体は結果に含めない。
pub fn greedy_decode<B, M, T>(
    model: &M,
    tokenizer: &T,
    sentence: &str,
    max_decode_length: usize,
    device: &B::Device,
) -> Result<Decoded<B>>
where
    B: Backend,
    M: Seq2Seq<B>,
    T: Tokenizer,
{
    let input_ids = tokenizer.encode(sentence)?;
    if input_ids.is_empty() {
        return Err(PolisherError::InvalidBatch(format!(
            "入力をエンコードできません: {}",
            sentence
        )));
    }
    let input = ids_to_tensor::<B>(&[input_ids], device)?;

    let mut output_ids = vec![START_ID];
    let mut attention_weights = None;

    for _ in 0..max_decode_length {
        let decoder_input = ids_to_tensor::<B>(&[output_ids.clone()], device)?;
        let masks = create_masks(&input, &decoder_input);

        let output = model.forward(input.clone(), decoder_input, masks)?;
        attention_weights = Some(output.attention_weights);

        // 最後の位置のロジットから次トークンを選択
        let [_, seq_len, vocab_size] = output.logits.dims();
        let next_id = output
            .logits
            .slice([0..1, seq_len - 1..seq_len, 0..vocab_size])
            .argmax(2)
            .into_scalar()
            .elem::<i64>() as i32;

        if next_id == END_ID {
            break;
        }
        output_ids.push(next_id);
    }

    let ids = output_ids[1..].to_vec();
    let text = tokenizer.decode(&ids)?;

    Ok(Decoded {
        ids,
        text,
        attention_weights,
    })
}

/// 学習済みモデルによる文の校正
pub struct Polisher<B: Backend, M: Seq2Seq<B>, T: Tokenizer> {
    model: M,
    tokenizer: T,
    max_decode_length: usize,
    device: B::Device,
    _backend: PhantomData<B>,
}

impl<B: Backend, M: Seq2Seq<B>, T: Tokenizer> Polisher<B, M, T> {
    /// model には推論モード（`valid()` 済み、または Autodiff なしのバックエンド）のモデルを渡す
    pub fn new(model: M, tokenizer: T, max_decode_length: usize, device: B::Device) -> Self {
        Self {
            model,
            tokenizer,
            max_decode_length,
            device,
            _backend: PhantomData,
        }
    }

    /// 1文を校正
    ///
    /// max_decode_length 以内に END_ID が出なかった場合は、そこまでの生成結果を
    /// そのまま返す（打ち切りは通知しない）。
    pub fn predict(&self, sentence: &str) -> Result<String> {
        Ok(self.decode(sentence)?.text)
    }

    /// 校正結果と最後のステップの Attention 重み
    pub fn predict_with_attention(&self, sentence: &str) -> Result<Decoded<B>> {
        self.decode(sentence)
    }

    fn decode(&self, sentence: &str) -> Result<Decoded<B>> {
        greedy_decode(
            &self.model,
            &self.tokenizer,
            sentence,
            self.max_decode_length,
            &self.device,
        )
    }

    /// demo.txt の各行を表示し、続けて校正結果を表示
    ///
    /// 空行は飛ばし、それ以外の行はそのまま校正する。
    /// 読み込み・推論の失敗はログに出して続行する。成功した行数を返す。
    pub fn run_demo(&self, path: &Path) -> usize {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                eprintln!("デモエラー: {} ({})", e, path.display());
                return 0;
            }
        };

        let mut polished = 0;
        for line in content.lines() {
            if line.is_empty() {
                continue;
            }

            println!("{}", line);
            match self.predict(line) {
                Ok(output) => {
                    println!("{}", output);
                    polished += 1;
                }
                Err(e) => eprintln!("デモエラー: {}", e),
            }
        }

        polished
    }
}

/// 推論バックエンドの選択
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendChoice {
    Wgpu,
    NdArray,
    /// WGPU を試し、使えなければ NdArray
    Auto,
}

impl FromStr for BackendChoice {
    type Err = PolisherError;

    fn from_str(name: &str) -> Result<Self> {
        match name {
            "wgpu" => Ok(Self::Wgpu),
            "ndarray" => Ok(Self::NdArray),
            "auto" => Ok(Self::Auto),
            _ => Err(PolisherError::InvalidConfig(format!(
                "未対応のバックエンド: {}",
                name
            ))),
        }
    }
}

/// 選択されたバックエンドの Polisher で行う処理
pub trait InferenceTask {
    type Output;

    fn run<B: Backend, T: Tokenizer>(
        self,
        polisher: &Polisher<B, Transformer<B>, T>,
    ) -> Result<Self::Output>;
}

/// 1文を校正（指定があれば Attention 重みを CSV 出力）
pub struct PolishText<'a> {
    pub text: &'a str,
    pub export_dir: Option<&'a Path>,
}

impl InferenceTask for PolishText<'_> {
    type Output = String;

    fn run<B: Backend, T: Tokenizer>(
        self,
        polisher: &Polisher<B, Transformer<B>, T>,
    ) -> Result<String> {
        polish_and_export(polisher, self.text, self.export_dir)
    }
}

/// demo.txt を校正（成功した行数を返す）
pub struct RunDemo<'a> {
    pub demo_file: &'a Path,
}

impl InferenceTask for RunDemo<'_> {
    type Output = usize;

    fn run<B: Backend, T: Tokenizer>(
        self,
        polisher: &Polisher<B, Transformer<B>, T>,
    ) -> Result<usize> {
        Ok(polisher.run_demo(self.demo_file))
    }
}

/// チェックポイントディレクトリの設定と最新の重みから Polisher を作成
pub fn load_polisher<B: Backend, T: Tokenizer>(
    checkpoint_dir: &Path,
    tokenizer: T,
    device: B::Device,
) -> Result<Polisher<B, Transformer<B>, T>> {
    let store = CheckpointStore::new(checkpoint_dir);
    let config = store.load_config()?;
    let model = store.load_latest_model::<B>(&config.model, &device)?;

    Ok(Polisher::new(model, tokenizer, config.max_decode_length, device))
}

/// 校正し、指定があれば Attention 重みを CSV 出力
pub fn polish_and_export<B: Backend, M: Seq2Seq<B>, T: Tokenizer>(
    polisher: &Polisher<B, M, T>,
    text: &str,
    export_dir: Option<&Path>,
) -> Result<String> {
    let decoded = polisher.predict_with_attention(text)?;

    if let (Some(export_dir), Some(weights)) = (export_dir, &decoded.attention_weights) {
        export_attention_to_csv(weights, export_dir)?;
    }

    Ok(decoded.text)
}

/// 最新チェックポイントを読み込んで処理を実行（ジェネリックBackend）
fn run_with_backend<B: Backend, T: Tokenizer, K: InferenceTask>(
    checkpoint_dir: &Path,
    tokenizer: &T,
    device: B::Device,
    task: K,
) -> Result<K::Output> {
    let polisher = load_polisher::<B, &T>(checkpoint_dir, tokenizer, device)?;
    task.run(&polisher)
}

/// バックエンドを選択し、保存済みチェックポイントで推論処理を実行
///
/// 未対応のバックエンド名は読み込み前に `InvalidConfig` になる。
pub fn run_inference<T: Tokenizer, K: InferenceTask>(
    backend_name: &str,
    checkpoint_dir: &Path,
    tokenizer: &T,
    task: K,
) -> Result<K::Output> {
    match backend_name.parse::<BackendChoice>()? {
        BackendChoice::Wgpu => {
            run_with_backend::<Wgpu, T, K>(checkpoint_dir, tokenizer, WgpuDevice::default(), task)
        }
        BackendChoice::NdArray => {
            run_with_backend::<NdArray, T, K>(checkpoint_dir, tokenizer, Default::default(), task)
        }
        BackendChoice::Auto => {
            // WGPUを試し、失敗したらNdArrayにフォールバック
            println!("バックエンド: 自動選択中...");
            let wgpu_result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                load_polisher::<Wgpu, &T>(checkpoint_dir, tokenizer, WgpuDevice::default())
            }));

            match wgpu_result {
                Ok(Ok(polisher)) => {
                    println!("バックエンド: WGPU（自動選択）");
                    task.run(&polisher)
                }
                _ => {
                    println!("バックエンド: NdArray（WGPU利用不可のためフォールバック）");
                    run_with_backend::<NdArray, T, K>(
                        checkpoint_dir,
                        tokenizer,
                        Default::default(),
                        task,
                    )
                }
            }
        }
    }
}
