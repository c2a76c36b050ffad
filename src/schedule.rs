use burn::LearningRate;

/// ウォームアップ後に減衰する学習率スケジュール
///
/// `lr(s) = d_model^-0.5 * min(s^-0.5, s * warmup_steps^-1.5)`
///
/// 最初の `warmup_steps` ステップは線形に増加し、その後は `s^-0.5` に比例して減衰する。
/// ステップ番号は 1 から始まり、0 で評価されることはない。
#[derive(Debug, Clone)]
pub struct WarmupSchedule {
    d_model: usize,
    warmup_steps: usize,
    step: usize,
}

impl WarmupSchedule {
    pub fn new(d_model: usize, warmup_steps: usize) -> Self {
        Self {
            d_model,
            warmup_steps,
            step: 1,
        }
    }

    /// 任意のステップ s (>= 1) での学習率
    pub fn value_at(&self, step: usize) -> LearningRate {
        debug_assert!(step >= 1, "学習率スケジュールはステップ 1 から評価する");

        let step = step as f64;
        let arg1 = step.powf(-0.5);
        let arg2 = step * (self.warmup_steps as f64).powf(-1.5);

        (self.d_model as f64).powf(-0.5) * arg1.min(arg2)
    }

    /// 次の更新で使うステップ番号
    pub fn current_step(&self) -> usize {
        self.step
    }

    /// 現在の学習率を返してステップを進める
    pub fn next_learning_rate(&mut self) -> LearningRate {
        let lr = self.value_at(self.step);
        self.step += 1;
        lr
    }

    /// 再開時にステップを復元（1未満は1に丸める）
    pub fn resume_at(&mut self, step: usize) {
        self.step = step.max(1);
    }

    pub fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }
}
