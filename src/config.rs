use crate::error::PolisherError;
use burn::config::Config;
use burn::optim::AdamConfig;

// 特殊トークン（固定、設定不可）
pub const PAD_ID: i32 = 0; // パディング
pub const START_ID: i32 = 2; // 文頭 [CLS]
pub const END_ID: i32 = 3; // 文末 [SEP]

// チェックポイントの保持数
pub const MAX_CHECKPOINTS_TO_KEEP: usize = 5;

// 付随ファイル名
pub const LATEST_EPOCH_FILE: &str = "latest_epoch.txt";
pub const LATEST_BATCH_ITER_FILE: &str = "latest_batch_iter.txt";
pub const HISTORY_FILE: &str = "history.txt";
pub const DEMO_FILE: &str = "demo.txt";

/// モデルハイパーパラメーター
#[derive(Config, Debug)]
pub struct TransformerConfig {
    /// Encoder/Decoder それぞれのレイヤー数
    #[config(default = 4)]
    pub num_layers: usize,
    /// 埋め込み次元
    #[config(default = 256)]
    pub d_model: usize,
    /// Multi-head Attention のヘッド数
    #[config(default = 8)]
    pub num_heads: usize,
    /// Feed-forward 中間層の次元数
    #[config(default = 1024)]
    pub dff: usize,
    #[config(default = 0.1)]
    pub dropout_rate: f64,
    #[config(default = 32000)]
    pub input_vocab_size: usize,
    #[config(default = 32000)]
    pub target_vocab_size: usize,
    /// 位置エンコーディング表の行数
    #[config(default = 512)]
    pub max_position: usize,
}

impl TransformerConfig {
    /// 各ヘッドの次元数
    pub fn head_depth(&self) -> usize {
        self.d_model / self.num_heads
    }

    /// 構築前の検証（ヘッド数の整合性など）
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.num_heads == 0 || self.d_model % self.num_heads != 0 {
            return Err(PolisherError::HeadsMismatch {
                d_model: self.d_model,
                num_heads: self.num_heads,
            });
        }
        if self.num_layers == 0 {
            return Err(PolisherError::InvalidConfig(
                "num_layers は 1 以上である必要があります".to_string(),
            ));
        }
        if self.input_vocab_size == 0 || self.target_vocab_size == 0 {
            return Err(PolisherError::InvalidConfig(
                "語彙サイズは 1 以上である必要があります".to_string(),
            ));
        }
        if self.max_position == 0 {
            return Err(PolisherError::InvalidConfig(
                "max_position は 1 以上である必要があります".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(PolisherError::InvalidConfig(format!(
                "dropout_rate は [0, 1) の範囲で指定してください: {}",
                self.dropout_rate
            )));
        }
        Ok(())
    }
}

/// 訓練設定
#[derive(Config)]
pub struct TrainingConfig {
    pub model: TransformerConfig,
    pub optimizer: AdamConfig,
    #[config(default = 64)]
    pub batch_size: usize,
    #[config(default = 20)]
    pub epochs: usize,
    /// 学習率スケジュールのウォームアップステップ数
    #[config(default = 4000)]
    pub warmup_steps: usize,
    /// 推論時の最大生成トークン数
    #[config(default = 64)]
    pub max_decode_length: usize,
    /// 進捗表示の間隔（バッチ数）
    #[config(default = 100)]
    pub log_every: usize,
    /// チェックポイント保存の間隔（バッチ数）
    #[config(default = 1000)]
    pub checkpoint_every: usize,
    #[config(default = 42)]
    pub seed: u64,
}

impl TrainingConfig {
    /// 原論文と同じ Adam 設定（β1=0.9, β2=0.98, ε=1e-9）で作成
    pub fn with_model(model: TransformerConfig) -> Self {
        let optimizer = AdamConfig::new()
            .with_beta_1(0.9)
            .with_beta_2(0.98)
            .with_epsilon(1e-9);
        Self::new(model, optimizer)
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        self.model.validate()?;
        if self.batch_size == 0 {
            return Err(PolisherError::InvalidConfig(
                "batch_size は 1 以上である必要があります".to_string(),
            ));
        }
        if self.warmup_steps == 0 {
            return Err(PolisherError::InvalidConfig(
                "warmup_steps は 1 以上である必要があります".to_string(),
            ));
        }
        if self.max_decode_length > self.model.max_position {
            return Err(PolisherError::InvalidConfig(format!(
                "max_decode_length ({}) が max_position ({}) を超えています",
                self.max_decode_length, self.model.max_position
            )));
        }
        Ok(())
    }
}
