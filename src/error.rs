use std::path::PathBuf;
use thiserror::Error;

/// ポリッシャー全体で使うエラー型
#[derive(Debug, Error)]
pub enum PolisherError {
    #[error("d_model ({d_model}) は num_heads ({num_heads}) で割り切れる必要があります")]
    HeadsMismatch { d_model: usize, num_heads: usize },

    #[error("設定が不正です: {0}")]
    InvalidConfig(String),

    #[error("シーケンス長 {len} が位置エンコーディングの上限 {max} を超えています")]
    SequenceTooLong { len: usize, max: usize },

    #[error("バッチの形状が不正です: {0}")]
    InvalidBatch(String),

    #[error("トークナイザーエラー: {0}")]
    Tokenizer(String),

    #[error("チェックポイントが壊れています ({path}): {reason}")]
    MalformedCheckpoint { path: PathBuf, reason: String },

    #[error("レコードの保存/読み込みエラー: {0}")]
    Record(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PolisherError>;
