use anyhow::Result;

use crate::{
    constants::{BATCH_SIZE, BLOCK_SIZE, BLOCKS, HEAD_SIZE, HEADS, LEARNING_RATE, TRAIN_STEPS},
    interrupt::InterruptPolicy,
};

/// Shape of a [`crate::model::Gpt`].
///
/// The channel width flowing through the residual stream is not a free
/// parameter: it is always `head_size * n_heads`, so concatenated head outputs
/// line up with the embeddings, the layer norms and the feed-forward input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GptConfig {
    pub vocab_size: i64,
    pub block_size: i64,
    pub n_blocks: i64,
    pub head_size: i64,
    pub n_heads: i64,
    /// Mask out future positions in every attention head.
    pub causal: bool,
}

impl GptConfig {
    pub fn new(vocab_size: i64) -> Self {
        GptConfig {
            vocab_size,
            block_size: BLOCK_SIZE,
            n_blocks: BLOCKS,
            head_size: HEAD_SIZE,
            n_heads: HEADS,
            causal: true,
        }
    }

    /// Width of the residual stream.
    pub fn n_embd(&self) -> i64 {
        self.head_size * self.n_heads
    }

    pub fn validate(&self) -> Result<()> {
        let dimensions = [
            ("vocab_size", self.vocab_size),
            ("block_size", self.block_size),
            ("n_blocks", self.n_blocks),
            ("head_size", self.head_size),
            ("n_heads", self.n_heads),
        ];
        for (name, value) in dimensions {
            if value <= 0 {
                anyhow::bail!("Invalid {}: must be positive, got {}", name, value);
            }
        }
        Ok(())
    }
}

/// Knobs for the transformer training loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainConfig {
    pub batch_size: i64,
    pub steps: usize,
    pub learning_rate: f64,
    pub on_interrupt: InterruptPolicy,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            batch_size: BATCH_SIZE,
            steps: TRAIN_STEPS,
            learning_rate: LEARNING_RATE,
            on_interrupt: InterruptPolicy::Abort,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.batch_size > 0,
            "Invalid batch_size: must be positive, got {}",
            self.batch_size
        );
        anyhow::ensure!(
            self.learning_rate > 0.0 && self.learning_rate.is_finite(),
            "Invalid learning_rate: {}",
            self.learning_rate
        );
        Ok(())
    }
}
