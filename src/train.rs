use std::io::Write;

use anyhow::{Context, Result};
use log::{debug, info};
use rand::Rng;
use tch::{
    Device, Tensor,
    nn::{AdamW, Optimizer, OptimizerConfig, VarStore},
};

use crate::{
    config::{GptConfig, TrainConfig},
    dataset::Batcher,
    interrupt::StopFlag,
    model::Gpt,
};

/// Outcome of [`GptTrainer::train`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainReport {
    pub steps_run: usize,
    pub last_loss: Option<f64>,
    pub interrupted: bool,
}

/// Owns the parameters, the model over them and the optimizer updating them.
pub struct GptTrainer {
    var_store: VarStore,
    model: Gpt,
    optimizer: Optimizer,
    config: TrainConfig,
}

impl GptTrainer {
    pub fn new(device: Device, model_config: GptConfig, config: TrainConfig) -> Result<GptTrainer> {
        config.validate()?;
        let var_store = VarStore::new(device);
        let model = Gpt::new(&var_store.root(), model_config)?;
        let optimizer = AdamW::default()
            .build(&var_store, config.learning_rate)
            .context("failed to create AdamW optimizer")?;
        Ok(GptTrainer {
            var_store,
            model,
            optimizer,
            config,
        })
    }

    pub fn into_model(self) -> (VarStore, Gpt) {
        (self.var_store, self.model)
    }

    pub fn parameter_count(&self) -> i64 {
        self.var_store
            .trainable_variables()
            .iter()
            .map(|t| t.numel() as i64)
            .sum()
    }

    /// Runs the configured number of steps over `tokens`, printing the step
    /// and loss on a single, continually overwritten status line. Leaves the
    /// loop early only if `stop` is raised; `stop` is armed for the duration.
    pub fn train<R: Rng>(&mut self, tokens: &[i64], rng: &mut R, stop: &StopFlag) -> Result<TrainReport> {
        let batcher = Batcher::new(tokens, self.model.config().block_size, self.config.batch_size)?;
        let _armed = stop.arm();
        let mut report = TrainReport {
            steps_run: 0,
            last_loss: None,
            interrupted: false,
        };
        let mut stdout = std::io::stdout();
        for step in 0..self.config.steps {
            if stop.is_raised() {
                report.interrupted = true;
                break;
            }
            let (input, target) = batcher.sample(rng);
            let loss = self.train_step(&input, &target)?;
            print!("\rstep: {} loss: {:.4}", step, loss);
            stdout.flush()?;
            report.steps_run += 1;
            report.last_loss = Some(loss);
        }
        println!();
        Ok(report)
    }

    /// One sample-forward-backward-update cycle.
    pub fn train_step(&mut self, input: &Tensor, target: &Tensor) -> Result<f64> {
        let device = self.var_store.device();
        let (_, loss) = self
            .model
            .forward(&input.to_device(device), Some(&target.to_device(device)))?;
        let loss = loss.context("forward pass with targets returned no loss")?;
        self.optimizer.zero_grad();
        loss.backward();
        self.optimizer.step();
        Ok(f64::try_from(&loss)?)
    }

    /// Mean loss over `iters` randomly sampled batches, without tracking gradients.
    pub fn estimate_loss<R: Rng>(&self, tokens: &[i64], iters: usize, rng: &mut R) -> Result<f64> {
        anyhow::ensure!(iters > 0, "estimate_loss needs at least one batch");
        let batcher = Batcher::new(tokens, self.model.config().block_size, self.config.batch_size)?;
        let device = self.var_store.device();
        let _guard = tch::no_grad_guard();
        let mut total = 0.0;
        for _ in 0..iters {
            let (input, target) = batcher.sample(rng);
            let (_, loss) = self
                .model
                .forward(&input.to_device(device), Some(&target.to_device(device)))?;
            let loss = f64::try_from(&loss.context("forward pass with targets returned no loss")?)?;
            debug!("eval batch loss: {loss:.4}");
            total += loss;
        }
        Ok(total / iters as f64)
    }

    pub fn log_summary(&self) {
        let config = self.model.config();
        info!(
            "Model: vocab {}, block {}, {} blocks x {} heads x {} head size (width {}), {} parameters",
            config.vocab_size,
            config.block_size,
            config.n_blocks,
            config.n_heads,
            config.head_size,
            config.n_embd(),
            self.parameter_count()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupt::SignalAction;
    use rand::{SeedableRng, rngs::StdRng};

    fn setup_trainer(steps: usize) -> GptTrainer {
        tch::manual_seed(42);
        let model_config = GptConfig {
            vocab_size: 8,
            block_size: 6,
            n_blocks: 1,
            head_size: 8,
            n_heads: 2,
            causal: true,
        };
        let config = TrainConfig {
            batch_size: 4,
            steps,
            learning_rate: 1e-2,
            ..TrainConfig::default()
        };
        GptTrainer::new(Device::Cpu, model_config, config).unwrap()
    }

    fn repeating_tokens() -> Vec<i64> {
        (0..200).map(|i| i % 8).collect()
    }

    #[test]
    fn test_train_step_loss_is_finite() {
        let mut trainer = setup_trainer(1);
        let input = Tensor::from_slice2(&[&[0i64, 1, 2, 3, 4, 5]]);
        let target = Tensor::from_slice2(&[&[1i64, 2, 3, 4, 5, 6]]);
        let loss = trainer.train_step(&input, &target).unwrap();
        assert!(loss.is_finite(), "Loss should be a finite number, got {}", loss);
        assert!(loss > 0.0, "Cross-entropy loss should be positive, got {}", loss);
    }

    #[test]
    fn test_train_step_loss_decreases() {
        let mut trainer = setup_trainer(1);
        // Train on the same input repeatedly, loss should decrease
        let input = Tensor::from_slice2(&[&[0i64, 1, 2, 3, 4, 5]]);
        let target = Tensor::from_slice2(&[&[1i64, 2, 3, 4, 5, 6]]);

        let first_loss = trainer.train_step(&input, &target).unwrap();
        let mut last_loss = first_loss;
        for _ in 0..50 {
            last_loss = trainer.train_step(&input, &target).unwrap();
        }
        assert!(
            last_loss < first_loss,
            "Loss should decrease after repeated training on same input: first={}, last={}",
            first_loss,
            last_loss
        );
    }

    #[test]
    fn test_train_runs_every_step() {
        let mut trainer = setup_trainer(12);
        let tokens = repeating_tokens();
        let mut rng = StdRng::seed_from_u64(1);
        let stop = StopFlag::new();
        let report = trainer.train(&tokens, &mut rng, &stop).unwrap();
        assert_eq!(report.steps_run, 12);
        assert!(!report.interrupted);
        assert!(report.last_loss.unwrap().is_finite());
        // Once the loop is over a Ctrl-C has nothing to stop.
        assert_eq!(stop.on_signal(), SignalAction::Exit);
    }

    #[test]
    fn test_raised_flag_stops_training() {
        let mut trainer = setup_trainer(100);
        let tokens = repeating_tokens();
        let stop = StopFlag::new();
        stop.raise();
        let report = trainer.train(&tokens, &mut StdRng::seed_from_u64(1), &stop).unwrap();
        assert_eq!(report.steps_run, 0);
        assert!(report.interrupted);
        assert_eq!(report.last_loss, None);
    }

    #[test]
    fn test_train_rejects_short_corpus() {
        let mut trainer = setup_trainer(1);
        let tokens = [0i64, 1, 2];
        assert!(trainer.train(&tokens, &mut StdRng::seed_from_u64(1), &StopFlag::new()).is_err());
    }

    #[test]
    fn test_training_lowers_estimated_loss() {
        let mut trainer = setup_trainer(150);
        let tokens = repeating_tokens();
        let before = trainer.estimate_loss(&tokens, 5, &mut StdRng::seed_from_u64(9)).unwrap();
        trainer.train(&tokens, &mut StdRng::seed_from_u64(2), &StopFlag::new()).unwrap();
        let after = trainer.estimate_loss(&tokens, 5, &mut StdRng::seed_from_u64(9)).unwrap();
        assert!(after < before, "before={}, after={}", before, after);
    }

    #[test]
    fn test_parameter_count() {
        let trainer = setup_trainer(1);
        // token 8*16 + position 6*16
        // per head 3*16*8, two heads
        // ln1 + ln2 2*(16+16), feed-forward 16*64+64 + 64*16+16
        // ln_f 16+16, lm_head 16*8+8
        let expected = 128 + 96 + 768 + 64 + (1088 + 1040) + 32 + 136;
        assert_eq!(trainer.parameter_count(), expected);
    }
}
