use crate::config::{
    TrainingConfig, TransformerConfig, LATEST_BATCH_ITER_FILE, LATEST_EPOCH_FILE,
    MAX_CHECKPOINTS_TO_KEEP,
};
use crate::error::{PolisherError, Result};
use crate::model::Transformer;
use burn::module::AutodiffModule;
use burn::optim::Optimizer;
use burn::prelude::*;
use burn::record::{BinFileRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const CHECKPOINT_VERSION: u32 = 1;
const INDEX_FILE: &str = "checkpoint.json";
const STATE_FILE: &str = "state.json";
const CONFIG_FILE: &str = "config.json";
const MODEL_FILE: &str = "model";
const OPTIMIZER_FILE: &str = "optim";

/// スナップショットごとの訓練位置
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRecord {
    pub version: u32,
    /// 最後に完了したエポック（0始まり）
    pub epoch: usize,
    /// 最後に完了したバッチ（エポック内、0始まり）
    pub batch_iter: usize,
    /// 次の更新で使う学習率スケジュールのステップ
    pub step: usize,
    pub saved_at: String,
}

/// 保持中のスナップショット一覧（古い順）
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
struct CheckpointIndex {
    counter: usize,
    checkpoints: Vec<String>,
}

/// 保存済みスナップショット
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub path: PathBuf,
    pub record: CheckpointRecord,
}

/// チェックポイントディレクトリ
///
/// ```text
/// <dir>/checkpoint.json        保持中スナップショットの一覧
/// <dir>/config.json            訓練設定
/// <dir>/latest_epoch.txt
/// <dir>/latest_batch_iter.txt
/// <dir>/ckpt-<n>/model.bin
/// <dir>/ckpt-<n>/optim.bin
/// <dir>/ckpt-<n>/state.json
/// ```
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    max_to_keep: usize,
}

impl CheckpointStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir: dir.into(),
            max_to_keep: MAX_CHECKPOINTS_TO_KEEP,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_to_keep(&self) -> usize {
        self.max_to_keep
    }

    /// 重み・オプティマイザー状態・訓練位置を保存し、古いスナップショットを削除
    pub fn save<B, M, O>(
        &self,
        model: &M,
        optimizer: &O,
        epoch: usize,
        batch_iter: usize,
        step: usize,
    ) -> Result<PathBuf>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        fs::create_dir_all(&self.dir)?;

        let mut index = self.read_index()?.unwrap_or_default();
        index.counter += 1;
        let name = format!("ckpt-{}", index.counter);
        let snapshot_dir = self.dir.join(&name);
        fs::create_dir_all(&snapshot_dir)?;

        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        model
            .clone()
            .save_file(snapshot_dir.join(MODEL_FILE), &recorder)
            .map_err(|e| PolisherError::Record(format!("モデル保存エラー: {:?}", e)))?;
        let optimizer_path = snapshot_dir.join(OPTIMIZER_FILE);
        Recorder::<B>::record(&recorder, optimizer.to_record(), optimizer_path)
            .map_err(|e| PolisherError::Record(format!("オプティマイザー保存エラー: {:?}", e)))?;

        let record = CheckpointRecord {
            version: CHECKPOINT_VERSION,
            epoch,
            batch_iter,
            step,
            saved_at: chrono::Local::now().to_rfc3339(),
        };
        fs::write(
            snapshot_dir.join(STATE_FILE),
            serde_json::to_string_pretty(&record)?,
        )?;

        index.checkpoints.push(name);
        self.evict(&mut index)?;
        self.write_index(&index)?;

        fs::write(self.dir.join(LATEST_EPOCH_FILE), epoch.to_string())?;
        fs::write(self.dir.join(LATEST_BATCH_ITER_FILE), batch_iter.to_string())?;

        println!(
            "チェックポイントを保存: {} (epoch {}, batch {})",
            snapshot_dir.display(),
            epoch,
            batch_iter
        );
        Ok(snapshot_dir)
    }

    /// 保持数を超えた古いスナップショットを削除
    fn evict(&self, index: &mut CheckpointIndex) -> Result<()> {
        while index.checkpoints.len() > self.max_to_keep {
            let oldest = index.checkpoints.remove(0);
            let path = self.dir.join(&oldest);
            if path.exists() {
                fs::remove_dir_all(&path)?;
            }
        }
        Ok(())
    }

    /// 保持中のスナップショット（古い順）
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        Ok(self
            .read_index()?
            .unwrap_or_default()
            .checkpoints
            .iter()
            .map(|name| self.dir.join(name))
            .collect())
    }

    /// 最新のスナップショット。何も保存されていなければ None
    ///
    /// 一覧・状態ファイル・付随ファイルの不整合は `MalformedCheckpoint`。
    pub fn latest(&self) -> Result<Option<Snapshot>> {
        let index = match self.read_index()? {
            Some(index) => index,
            None => {
                if self.dir.join(LATEST_EPOCH_FILE).exists() {
                    return Err(self.malformed(&self.dir, "checkpoint.json がありません"));
                }
                return Ok(None);
            }
        };

        let name = match index.checkpoints.last() {
            Some(name) => name,
            None => return Ok(None),
        };
        let path = self.dir.join(name);

        let state = fs::read_to_string(path.join(STATE_FILE))
            .map_err(|e| self.malformed(&path, &format!("state.json を読めません: {}", e)))?;
        let record: CheckpointRecord = serde_json::from_str(&state)
            .map_err(|e| self.malformed(&path, &format!("state.json が不正です: {}", e)))?;

        if record.version != CHECKPOINT_VERSION {
            return Err(self.malformed(
                &path,
                &format!("未対応のバージョン: {}", record.version),
            ));
        }

        let epoch = self.read_sidecar(LATEST_EPOCH_FILE)?;
        let batch_iter = self.read_sidecar(LATEST_BATCH_ITER_FILE)?;
        if epoch != record.epoch || batch_iter != record.batch_iter {
            return Err(self.malformed(
                &path,
                "latest_epoch.txt / latest_batch_iter.txt がスナップショットと一致しません",
            ));
        }

        Ok(Some(Snapshot { path, record }))
    }

    /// スナップショットの重みをモデルに読み込む
    pub fn load_model<B: Backend, M: Module<B>>(
        &self,
        snapshot: &Path,
        model: M,
        device: &B::Device,
    ) -> Result<M> {
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();

        let model = model
            .load_file(snapshot.join(MODEL_FILE), &recorder, device)
            .map_err(|e| self.malformed(snapshot, &format!("モデル読み込みエラー: {:?}", e)))?;

        println!(
            "モデルを読み込み（{}バックエンド）: {}",
            std::any::type_name::<B>(),
            snapshot.display()
        );
        Ok(model)
    }

    /// スナップショットのオプティマイザー状態を読み込む
    pub fn load_optimizer<B, M, O>(
        &self,
        snapshot: &Path,
        optimizer: O,
        device: &B::Device,
    ) -> Result<O>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();

        let optimizer_path = snapshot.join(OPTIMIZER_FILE);
        let record: O::Record = Recorder::<B>::load(&recorder, optimizer_path, device)
            .map_err(|e| {
                self.malformed(snapshot, &format!("オプティマイザー読み込みエラー: {:?}", e))
            })?;

        Ok(optimizer.load_record(record))
    }

    /// 最新スナップショットから推論用モデルを作成
    pub fn load_latest_model<B: Backend>(
        &self,
        config: &TransformerConfig,
        device: &B::Device,
    ) -> Result<Transformer<B>> {
        let snapshot = self
            .latest()?
            .ok_or_else(|| self.malformed(&self.dir, "スナップショットがありません"))?;

        let model = config.init::<B>(device)?;
        self.load_model(&snapshot.path, model, device)
    }

    /// 訓練設定を保存（推論時のモデル再構築用）
    pub fn save_config(&self, config: &TrainingConfig) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        config.save(self.dir.join(CONFIG_FILE))?;
        Ok(())
    }

    pub fn load_config(&self) -> Result<TrainingConfig> {
        let path = self.dir.join(CONFIG_FILE);
        TrainingConfig::load(&path)
            .map_err(|e| self.malformed(&path, &format!("設定を読めません: {:?}", e)))
    }

    fn read_index(&self) -> Result<Option<CheckpointIndex>> {
        let path = self.dir.join(INDEX_FILE);
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)?;
        let index = serde_json::from_str(&content)
            .map_err(|e| self.malformed(&path, &format!("一覧が不正です: {}", e)))?;
        Ok(Some(index))
    }

    fn write_index(&self, index: &CheckpointIndex) -> Result<()> {
        fs::write(
            self.dir.join(INDEX_FILE),
            serde_json::to_string_pretty(index)?,
        )?;
        Ok(())
    }

    /// 10進整数1つだけを含む付随ファイル
    fn read_sidecar(&self, name: &str) -> Result<usize> {
        let path = self.dir.join(name);
        let content = fs::read_to_string(&path)
            .map_err(|e| self.malformed(&path, &format!("読み込めません: {}", e)))?;

        content
            .trim()
            .parse()
            .map_err(|e| self.malformed(&path, &format!("整数ではありません: {}", e)))
    }

    fn malformed(&self, path: &Path, reason: &str) -> PolisherError {
        PolisherError::MalformedCheckpoint {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}
