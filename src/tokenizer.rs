use crate::error::{PolisherError, Result};
use std::path::Path;

/// テキストとトークン ID 列の相互変換
pub trait Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<i32>>;
    fn decode(&self, ids: &[i32]) -> Result<String>;
}

impl<T: Tokenizer + ?Sized> Tokenizer for &T {
    fn encode(&self, text: &str) -> Result<Vec<i32>> {
        (**self).encode(text)
    }

    fn decode(&self, ids: &[i32]) -> Result<String> {
        (**self).decode(ids)
    }
}

/// 学習済みトークナイザー（Hugging Face `tokenizer.json`）
pub struct PolisherTokenizer {
    tokenizer: tokenizers::Tokenizer,
}

impl PolisherTokenizer {
    /// 読み込みに失敗した場合はエラー（呼び出し側で致命的エラーとして扱う）
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let tokenizer = tokenizers::Tokenizer::from_file(path).map_err(|e| {
            PolisherError::Tokenizer(format!("{} を読み込めません: {}", path.display(), e))
        })?;
        println!("トークナイザーを読み込み: {}", path.display());

        Ok(Self { tokenizer })
    }

    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }
}

impl Tokenizer for PolisherTokenizer {
    /// 特殊トークン（[CLS] / [SEP]）付きでエンコード
    fn encode(&self, text: &str) -> Result<Vec<i32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| PolisherError::Tokenizer(e.to_string()))?;

        Ok(encoding.get_ids().iter().map(|&id| id as i32).collect())
    }

    /// 特殊トークンは出力に含めない
    fn decode(&self, ids: &[i32]) -> Result<String> {
        let ids: Vec<u32> = ids.iter().map(|&id| id as u32).collect();

        self.tokenizer
            .decode(&ids, true)
            .map_err(|e| PolisherError::Tokenizer(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const WORD_LEVEL_JSON: &str = r#"{
  "version": "1.0",
  "truncation": null,
  "padding": null,
  "added_tokens": [],
  "normalizer": null,
  "pre_tokenizer": {
    "type": "Whitespace"
  },
  "post_processor": null,
  "decoder": null,
  "model": {
    "type": "WordLevel",
    "vocab": {
      "[PAD]": 0,
      "[UNK]": 1,
      "안녕": 4,
      "하세요": 5
    },
    "unk_token": "[UNK]"
  }
}"#;

    #[test]
    fn loads_word_level_tokenizer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokenizer.json");
        fs::write(&path, WORD_LEVEL_JSON).unwrap();

        let tokenizer = PolisherTokenizer::from_file(&path).unwrap();

        assert_eq!(tokenizer.encode("안녕 하세요").unwrap(), vec![4, 5]);
        assert_eq!(tokenizer.decode(&[5]).unwrap(), "하세요");
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = PolisherTokenizer::from_file(dir.path().join("missing.json"));

        assert!(matches!(result, Err(PolisherError::Tokenizer(_))));
    }
}
