use crate::checkpoint::CheckpointStore;
use crate::config::{TrainingConfig, HISTORY_FILE};
use crate::data::PolishData;
use crate::error::{PolisherError, Result};
use crate::inference::Polisher;
use crate::mask::create_masks;
use crate::metrics::{
    append_history, masked_accuracy, masked_loss, EvaluationResult, MetricTracker,
    TrainingMetrics,
};
use crate::model::{Seq2Seq, Transformer};
use crate::schedule::WarmupSchedule;
use crate::tokenizer::Tokenizer;
use burn::backend::wgpu::Wgpu;
use burn::backend::Autodiff;
use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use burn::LearningRate;
use std::path::Path;

pub type TrainingBackend = Autodiff<Wgpu>;

/// 1回の更新の結果
#[derive(Debug, Clone, Copy)]
pub struct StepOutput {
    pub loss: f32,
    pub accuracy: f32,
    pub learning_rate: LearningRate,
    /// この更新で使ったステップ番号
    pub step: usize,
}

/// 再開位置（最後に完了したエポックとバッチ）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumePoint {
    pub epoch: usize,
    pub batch_iter: usize,
}

/// Teacher Forcing 用に (Decoder入力, 正解ラベル) に分ける
///
/// Decoder入力は `target[:, :-1]`、ラベルは `target[:, 1:]`
fn shift_target<B: Backend>(
    target: Tensor<B, 2, Int>,
) -> Result<(Tensor<B, 2, Int>, Tensor<B, 2, Int>)> {
    let [batch_size, target_len] = target.dims();
    if target_len < 2 {
        return Err(PolisherError::InvalidBatch(format!(
            "ターゲット長は 2 以上必要です: {}",
            target_len
        )));
    }

    let decoder_input = target.clone().slice([0..batch_size, 0..target_len - 1]);
    let labels = target.slice([0..batch_size, 1..target_len]);
    Ok((decoder_input, labels))
}

fn check_batch_sizes<B: Backend>(
    input: &Tensor<B, 2, Int>,
    target: &Tensor<B, 2, Int>,
) -> Result<()> {
    let input_batch = input.dims()[0];
    let target_batch = target.dims()[0];
    if input_batch != target_batch {
        return Err(PolisherError::InvalidBatch(format!(
            "入力とターゲットのバッチサイズが異なります: {} != {}",
            input_batch, target_batch
        )));
    }
    Ok(())
}

/// モデル・オプティマイザー・学習率スケジュール・訓練メトリクスをまとめて保持
pub struct Trainer<B: AutodiffBackend, O: Optimizer<Transformer<B>, B>> {
    model: Transformer<B>,
    optimizer: O,
    schedule: WarmupSchedule,
    metrics: MetricTracker,
    device: B::Device,
}

/// 設定からモデルと Adam を初期化
pub fn build_trainer<B: AutodiffBackend>(
    config: &TrainingConfig,
    device: &B::Device,
) -> Result<Trainer<B, impl Optimizer<Transformer<B>, B>>> {
    config.validate()?;

    let model = config.model.init::<B>(device)?;
    let optimizer = config.optimizer.init::<B, Transformer<B>>();
    let schedule = WarmupSchedule::new(config.model.d_model, config.warmup_steps);

    Ok(Trainer::new(model, optimizer, schedule, device.clone()))
}

impl<B: AutodiffBackend, O: Optimizer<Transformer<B>, B>> Trainer<B, O> {
    pub fn new(
        model: Transformer<B>,
        optimizer: O,
        schedule: WarmupSchedule,
        device: B::Device,
    ) -> Self {
        Self {
            model,
            optimizer,
            schedule,
            metrics: MetricTracker::new(),
            device,
        }
    }

    /// 1バッチ分の Teacher Forcing 更新
    ///
    /// input: [batch, input_len], target: [batch, target_len]（START..END, PAD 詰め）
    pub fn train_step(
        &mut self,
        input: Tensor<B, 2, Int>,
        target: Tensor<B, 2, Int>,
    ) -> Result<StepOutput> {
        check_batch_sizes(&input, &target)?;
        let (decoder_input, labels) = shift_target(target)?;

        let masks = create_masks(&input, &decoder_input);
        let output = self.model.forward(input, decoder_input, masks)?;

        let loss = masked_loss(output.logits.clone(), labels.clone());
        let (accuracy, token_count) = masked_accuracy(output.logits.detach(), labels);

        // バックプロパゲーション
        let grads = loss.backward();
        let grads = GradientsParams::from_grads(grads, &self.model);

        // パラメータ更新
        let step = self.schedule.current_step();
        let learning_rate = self.schedule.next_learning_rate();
        self.model = self
            .optimizer
            .step(learning_rate, self.model.clone(), grads);

        let loss = loss.into_scalar().elem::<f32>();
        self.metrics.update(loss, accuracy, token_count);

        Ok(StepOutput {
            loss,
            accuracy,
            learning_rate,
            step,
        })
    }

    /// Dropout を無効にしたモデルで評価
    pub fn evaluate(
        &self,
        input: Tensor<B::InnerBackend, 2, Int>,
        target: Tensor<B::InnerBackend, 2, Int>,
        batch_size: usize,
    ) -> Result<EvaluationResult> {
        evaluate(&self.model.valid(), input, target, batch_size)
    }

    pub fn evaluate_data(&self, data: &PolishData, batch_size: usize) -> Result<EvaluationResult> {
        let (input, target) = data.to_tensors::<B::InnerBackend>(&self.device)?;
        self.evaluate(input, target, batch_size)
    }

    /// 現在の状態をチェックポイントとして保存
    pub fn save_checkpoint(
        &self,
        store: &CheckpointStore,
        epoch: usize,
        batch_iter: usize,
    ) -> Result<()> {
        store.save::<B, Transformer<B>, O>(
            &self.model,
            &self.optimizer,
            epoch,
            batch_iter,
            self.schedule.current_step(),
        )?;
        Ok(())
    }

    /// 最新のチェックポイントから重み・オプティマイザー状態・ステップを復元
    ///
    /// チェックポイントがなければそのまま返す。
    pub fn resume(mut self, store: &CheckpointStore) -> Result<(Self, Option<ResumePoint>)> {
        let snapshot = match store.latest()? {
            Some(snapshot) => snapshot,
            None => {
                println!("チェックポイントがないため最初から訓練します");
                return Ok((self, None));
            }
        };

        self.model =
            store.load_model::<B, Transformer<B>>(&snapshot.path, self.model, &self.device)?;
        self.optimizer = store.load_optimizer::<B, Transformer<B>, O>(
            &snapshot.path,
            self.optimizer,
            &self.device,
        )?;
        self.schedule.resume_at(snapshot.record.step);

        println!(
            "再開: epoch {}, batch {} の次から (step {})",
            snapshot.record.epoch, snapshot.record.batch_iter, snapshot.record.step
        );

        Ok((
            self,
            Some(ResumePoint {
                epoch: snapshot.record.epoch,
                batch_iter: snapshot.record.batch_iter,
            }),
        ))
    }

    pub fn model(&self) -> &Transformer<B> {
        &self.model
    }

    pub fn into_model(self) -> Transformer<B> {
        self.model
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// 次の更新で使うステップ番号
    pub fn step(&self) -> usize {
        self.schedule.current_step()
    }

    pub fn metrics(&self) -> &MetricTracker {
        &self.metrics
    }

    pub fn reset_metrics(&mut self) {
        self.metrics.reset();
    }
}

/// 固定サイズのバッチ（最後は小さくてもよい）で損失と正解率を計算
///
/// model は推論モードで渡すこと。
pub fn evaluate<B: Backend, M: Seq2Seq<B>>(
    model: &M,
    input: Tensor<B, 2, Int>,
    target: Tensor<B, 2, Int>,
    batch_size: usize,
) -> Result<EvaluationResult> {
    check_batch_sizes(&input, &target)?;
    if batch_size == 0 {
        return Err(PolisherError::InvalidBatch(
            "batch_size は 1 以上である必要があります".to_string(),
        ));
    }

    let [num_samples, input_len] = input.dims();
    let target_len = target.dims()[1];
    let mut tracker = MetricTracker::new();

    for start in (0..num_samples).step_by(batch_size) {
        let end = (start + batch_size).min(num_samples);

        let batch_input = input.clone().slice([start..end, 0..input_len]);
        let batch_target = target.clone().slice([start..end, 0..target_len]);
        let (decoder_input, labels) = shift_target(batch_target)?;

        let masks = create_masks(&batch_input, &decoder_input);
        let output = model.forward(batch_input, decoder_input, masks)?;

        let loss = masked_loss(output.logits.clone(), labels.clone());
        let (accuracy, token_count) = masked_accuracy(output.logits, labels);
        tracker.update(loss.into_scalar().elem::<f32>(), accuracy, token_count);
    }

    Ok(EvaluationResult {
        loss: tracker.loss(),
        accuracy: tracker.accuracy(),
    })
}

/// 訓練の入力
pub struct TrainingInputs<'a, T: Tokenizer> {
    pub train_data: &'a PolishData,
    pub valid_data: Option<&'a PolishData>,
    /// エポック終了ごとのデモに使う
    pub tokenizer: &'a T,
    pub demo_file: Option<&'a Path>,
}

/// 再開位置の次のバッチ
fn first_position(resume_from: Option<ResumePoint>, num_batches: usize) -> (usize, usize) {
    match resume_from {
        None => (0, 0),
        Some(point) if point.batch_iter + 1 >= num_batches => (point.epoch + 1, 0),
        Some(point) => (point.epoch, point.batch_iter + 1),
    }
}

/// 韓国語校正モデルの訓練実行
///
/// エポックごとに訓練メトリクスをリセットし、終了時にチェックポイント保存・検証・
/// history.txt への追記・デモを行う。
pub fn train_polisher<B, O, T>(
    mut trainer: Trainer<B, O>,
    config: &TrainingConfig,
    inputs: &TrainingInputs<'_, T>,
    store: &CheckpointStore,
    resume_from: Option<ResumePoint>,
) -> Result<(Trainer<B, O>, TrainingMetrics)>
where
    B: AutodiffBackend,
    O: Optimizer<Transformer<B>, B>,
    T: Tokenizer,
{
    let batches = inputs.train_data.batches(config.batch_size);
    if batches.is_empty() {
        return Err(PolisherError::InvalidBatch("訓練データが空です".to_string()));
    }

    let (start_epoch, start_batch) = first_position(resume_from, batches.len());
    let mut training_metrics = TrainingMetrics::default();
    let log_every = config.log_every.max(1);
    let checkpoint_every = config.checkpoint_every.max(1);

    println!(
        "訓練開始: {}エポック, {}バッチ/エポック",
        config.epochs,
        batches.len()
    );

    for epoch in start_epoch..config.epochs {
        trainer.reset_metrics();
        let first_batch = if epoch == start_epoch { start_batch } else { 0 };

        for (batch_iter, batch) in batches.iter().enumerate().skip(first_batch) {
            let (input, target) = batch.to_tensors::<B>(trainer.device())?;
            let output = trainer.train_step(input, target)?;

            if (batch_iter + 1) % log_every == 0 {
                println!(
                    "Epoch {} Batch {}: Loss = {:.4}, Accuracy = {:.4}, lr = {:.3e}",
                    epoch + 1,
                    batch_iter + 1,
                    trainer.metrics().loss(),
                    trainer.metrics().accuracy(),
                    output.learning_rate
                );
            }

            if (batch_iter + 1) % checkpoint_every == 0 && batch_iter + 1 < batches.len() {
                trainer.save_checkpoint(store, epoch, batch_iter)?;
            }
        }

        let loss = trainer.metrics().loss();
        let accuracy = trainer.metrics().accuracy();
        training_metrics.loss_history.push(loss);
        training_metrics.accuracy_history.push(accuracy);
        println!(
            "Epoch {}/{}: Loss = {:.6}, Accuracy = {:.4}",
            epoch + 1,
            config.epochs,
            loss,
            accuracy
        );

        trainer.save_checkpoint(store, epoch, batches.len() - 1)?;

        if let Some(valid_data) = inputs.valid_data {
            let result = trainer.evaluate_data(valid_data, config.batch_size)?;
            println!(
                "検証: Loss = {:.6}, Accuracy = {:.4}",
                result.loss, result.accuracy
            );
            append_history(&store.dir().join(HISTORY_FILE), result.loss, result.accuracy)?;
            training_metrics.evaluation_history.push(result);
        }

        if let Some(demo_file) = inputs.demo_file {
            let polisher = Polisher::<B::InnerBackend, _, _>::new(
                trainer.model().valid(),
                inputs.tokenizer,
                config.max_decode_length,
                trainer.device().clone(),
            );
            polisher.run_demo(demo_file);
        }
    }

    training_metrics.final_loss = training_metrics.loss_history.last().copied().unwrap_or(0.0);
    training_metrics.steps = trainer.step() - 1;

    Ok((trainer, training_metrics))
}
