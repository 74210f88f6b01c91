use anyhow::Result;
use rand::{
    Rng,
    distributions::{Distribution, WeightedIndex},
};
use tch::{
    Device,
    Kind::{Bool, Float, Int64},
    Tensor,
    nn::{self, Embedding, LayerNorm, Linear, Module, Path, embedding, layer_norm, linear},
};

use crate::config::GptConfig;

/// Scaled dot-product self-attention producing a head-sized projection.
/// Takes an input of shape [batch, seq_len, n_embd] and produces
/// [batch, seq_len, head_size].
#[derive(Debug)]
pub struct AttentionHead {
    key: Linear,
    query: Linear,
    value: Linear,
    // [block_size, block_size], true above the diagonal (future positions).
    future: Tensor,
    head_size: i64,
    causal: bool,
}

impl AttentionHead {
    pub fn new(vs: &Path, block_size: i64, n_embd: i64, head_size: i64, causal: bool) -> Self {
        let no_bias = nn::LinearConfig {
            bias: false,
            ..Default::default()
        };
        let key = linear(vs / "key", n_embd, head_size, no_bias);
        let query = linear(vs / "query", n_embd, head_size, no_bias);
        let value = linear(vs / "value", n_embd, head_size, no_bias);
        let future = Tensor::ones([block_size, block_size], (Float, vs.device()))
            .triu(1)
            .to_kind(Bool);
        AttentionHead {
            key,
            query,
            value,
            future,
            head_size,
            causal,
        }
    }

    /// Post-softmax affinities, [batch, seq_len, seq_len]. Row `t` is a
    /// distribution over key positions for query position `t`.
    ///
    /// `seq_len` must not exceed the block size the head was built with.
    pub fn attention_weights(&self, xs: &Tensor) -> Tensor {
        let seq_len = xs.size()[1];
        let k = xs.apply(&self.key);
        let q = xs.apply(&self.query);
        // [batch, seq_len, head] @ [batch, head, seq_len] -> [batch, seq_len, seq_len]
        let scores = q.matmul(&k.transpose(-2, -1)) * (self.head_size as f64).powf(-0.5);
        let scores = if self.causal {
            let future = self.future.narrow(0, 0, seq_len).narrow(1, 0, seq_len);
            scores.masked_fill(&future, f64::NEG_INFINITY)
        } else {
            scores
        };
        scores.softmax(-1, Float)
    }
}

impl Module for AttentionHead {
    fn forward(&self, xs: &Tensor) -> Tensor {
        self.attention_weights(xs).matmul(&xs.apply(&self.value))
    }
}

/// Independent heads over the same input, concatenated along the channel axis:
/// [batch, seq_len, head_size * heads].
#[derive(Debug)]
pub struct MultiHeadAttention {
    heads: Vec<AttentionHead>,
}

impl MultiHeadAttention {
    pub fn new(vs: &Path, config: &GptConfig) -> Self {
        let heads = (0..config.n_heads)
            .map(|i| {
                AttentionHead::new(
                    &(vs / i),
                    config.block_size,
                    config.n_embd(),
                    config.head_size,
                    config.causal,
                )
            })
            .collect();
        MultiHeadAttention { heads }
    }
}

impl Module for MultiHeadAttention {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let outputs: Vec<Tensor> = self.heads.iter().map(|head| head.forward(xs)).collect();
        Tensor::cat(&outputs, -1)
    }
}

/// Position-wise `C -> 4C -> ReLU -> C`.
#[derive(Debug)]
pub struct FeedForward {
    net: nn::Sequential,
}

impl FeedForward {
    pub fn new(vs: &Path, n_embd: i64) -> Self {
        let net = nn::seq()
            .add(linear(vs / "expand", n_embd, 4 * n_embd, Default::default()))
            .add_fn(|xs| xs.relu())
            .add(linear(vs / "contract", 4 * n_embd, n_embd, Default::default()));
        FeedForward { net }
    }
}

impl Module for FeedForward {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.apply(&self.net)
    }
}

/// Pre-norm transformer block:
/// `x + attn(ln1(x))`, then `x + ff(ln2(x))`.
#[derive(Debug)]
pub struct Block {
    ln1: LayerNorm,
    attention: MultiHeadAttention,
    ln2: LayerNorm,
    feed_forward: FeedForward,
}

impl Block {
    pub fn new(vs: &Path, config: &GptConfig) -> Self {
        let n_embd = config.n_embd();
        Block {
            ln1: layer_norm(vs / "ln1", vec![n_embd], Default::default()),
            attention: MultiHeadAttention::new(&(vs / "attention"), config),
            ln2: layer_norm(vs / "ln2", vec![n_embd], Default::default()),
            feed_forward: FeedForward::new(&(vs / "feed_forward"), n_embd),
        }
    }
}

impl Module for Block {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let xs = xs + self.attention.forward(&xs.apply(&self.ln1));
        &xs + self.feed_forward.forward(&xs.apply(&self.ln2))
    }
}

/// Character-level GPT: token + position embeddings, a stack of [`Block`]s,
/// a final layer norm and a projection to vocabulary logits.
#[derive(Debug)]
pub struct Gpt {
    config: GptConfig,
    device: Device,
    token_embedding: Embedding,
    position_embedding: Embedding,
    blocks: nn::Sequential,
    ln_f: LayerNorm,
    lm_head: Linear,
}

impl Gpt {
    pub fn new(vs: &Path, config: GptConfig) -> Result<Self> {
        config.validate()?;
        let n_embd = config.n_embd();
        let token_embedding = embedding(vs / "token", config.vocab_size, n_embd, Default::default());
        let position_embedding =
            embedding(vs / "position", config.block_size, n_embd, Default::default());
        let blocks_vs = vs / "blocks";
        let blocks = (0..config.n_blocks).fold(nn::seq(), |seq, i| {
            seq.add(Block::new(&(&blocks_vs / i), &config))
        });
        let ln_f = layer_norm(vs / "ln_f", vec![n_embd], Default::default());
        let lm_head = linear(vs / "lm_head", n_embd, config.vocab_size, Default::default());
        Ok(Gpt {
            config,
            device: vs.device(),
            token_embedding,
            position_embedding,
            blocks,
            ln_f,
            lm_head,
        })
    }

    pub fn config(&self) -> &GptConfig {
        &self.config
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Takes token ids `[batch, seq_len]` and returns logits
    /// `[batch, seq_len, vocab_size]`. When `targets` (same shape as the
    /// input) are given, also returns the mean cross-entropy over all
    /// `batch * seq_len` positions.
    pub fn forward(&self, idx: &Tensor, targets: Option<&Tensor>) -> Result<(Tensor, Option<Tensor>)> {
        let (batch, seq_len) = idx.size2()?;
        anyhow::ensure!(
            seq_len <= self.config.block_size,
            "Sequence length {} exceeds the context window of {}",
            seq_len,
            self.config.block_size
        );
        if let Some(targets) = targets {
            anyhow::ensure!(
                targets.size() == idx.size(),
                "Targets of shape {:?} do not match inputs of shape {:?}",
                targets.size(),
                idx.size()
            );
        }
        let token_embeds = idx.apply(&self.token_embedding);
        // [seq_len, n_embd], broadcast over the batch.
        let position_embeds =
            Tensor::arange(seq_len, (Int64, idx.device())).apply(&self.position_embedding);
        let logits = (token_embeds + position_embeds)
            .apply(&self.blocks)
            .apply(&self.ln_f)
            .apply(&self.lm_head);
        let loss = targets.map(|targets| {
            logits
                .view([batch * seq_len, self.config.vocab_size])
                .cross_entropy_for_logits(&targets.view([batch * seq_len]))
        });
        Ok((logits, loss))
    }

    /// The trailing `block_size` columns of `idx`; older context is dropped.
    pub fn context_window(&self, idx: &Tensor) -> Tensor {
        let len = idx.size()[1];
        if len > self.config.block_size {
            idx.narrow(1, len - self.config.block_size, self.config.block_size)
        } else {
            idx.shallow_clone()
        }
    }

    /// Samples one token per row from the distribution at the last position of
    /// the trailing window and returns `idx` with it appended, `[batch, len + 1]`.
    pub fn generate_step<R: Rng>(&self, idx: &Tensor, temperature: f64, rng: &mut R) -> Result<Tensor> {
        let _guard = tch::no_grad_guard();
        let (logits, _) = self.forward(&self.context_window(idx), None)?;
        let probs = (logits.select(1, -1) / temperature)
            .softmax(-1, Float)
            .to_device(Device::Cpu);
        let batch = probs.size()[0];
        let mut next = Vec::with_capacity(batch as usize);
        for row in 0..batch {
            let weights = Vec::<f32>::try_from(&probs.get(row))?;
            let dist = WeightedIndex::new(&weights)?;
            next.push(dist.sample(rng) as i64);
        }
        let next = Tensor::from_slice(&next).view([batch, 1]).to_device(idx.device());
        Ok(Tensor::cat(&[idx, &next], 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::StdRng};
    use tch::nn::VarStore;

    fn small_config() -> GptConfig {
        GptConfig {
            vocab_size: 11,
            block_size: 8,
            n_blocks: 2,
            head_size: 4,
            n_heads: 2,
            causal: true,
        }
    }

    fn random_input(batch: i64, seq_len: i64, n_embd: i64) -> Tensor {
        Tensor::randn([batch, seq_len, n_embd], (Float, Device::Cpu))
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f64 {
        f64::try_from(&(a - b).abs().max()).unwrap()
    }

    // -- AttentionHead tests --

    #[test]
    fn test_head_output_shape() {
        let vs = VarStore::new(Device::Cpu);
        let head = AttentionHead::new(&vs.root(), 8, 16, 4, true);
        let output = head.forward(&random_input(2, 5, 16));
        assert_eq!(output.size(), &[2, 5, 4]);
    }

    #[test]
    fn test_head_causal_masking() {
        // Changing a future token must not affect earlier positions' outputs.
        let vs = VarStore::new(Device::Cpu);
        let head = AttentionHead::new(&vs.root(), 8, 16, 4, true);

        let input_a = random_input(1, 6, 16);
        let output_a = head.forward(&input_a);
        let input_b = input_a.copy();
        input_b.narrow(1, 4, 2).copy_(&random_input(1, 2, 16));
        let output_b = head.forward(&input_b);

        for pos in 0..4 {
            let diff = max_abs_diff(&output_a.get(0).get(pos), &output_b.get(0).get(pos));
            assert!(diff < 1e-5, "Position {} changed when only a future token was modified", pos);
        }
        let diff = max_abs_diff(&output_a.get(0).get(5), &output_b.get(0).get(5));
        assert!(diff > 1e-5, "Position 5 should have changed");
    }

    #[test]
    fn test_head_unmasked_sees_future() {
        let vs = VarStore::new(Device::Cpu);
        let head = AttentionHead::new(&vs.root(), 8, 16, 4, false);

        let input_a = random_input(1, 4, 16);
        let output_a = head.forward(&input_a);
        let input_b = input_a.copy();
        input_b.narrow(1, 3, 1).copy_(&random_input(1, 1, 16));
        let output_b = head.forward(&input_b);

        let diff = max_abs_diff(&output_a.get(0).get(0), &output_b.get(0).get(0));
        assert!(diff > 1e-6, "Position 0 should depend on position 3 without a mask");
    }

    #[test]
    fn test_attention_rows_sum_to_one() {
        let vs = VarStore::new(Device::Cpu);
        for causal in [true, false] {
            let head = AttentionHead::new(&(vs.root() / causal.to_string()), 8, 16, 4, causal);
            let weights = head.attention_weights(&random_input(3, 7, 16));
            assert_eq!(weights.size(), &[3, 7, 7]);
            let row_sums = weights.sum_dim_intlist(&[-1i64][..], false, Float);
            let ones = Tensor::ones([3, 7], (Float, Device::Cpu));
            assert!(max_abs_diff(&row_sums, &ones) < 1e-5);
        }
    }

    #[test]
    fn test_first_position_attends_only_to_itself() {
        let vs = VarStore::new(Device::Cpu);
        let head = AttentionHead::new(&vs.root(), 8, 16, 4, true);
        let weights = head.attention_weights(&random_input(1, 3, 16)).get(0);
        let row0 = Vec::<f32>::try_from(&weights.get(0)).unwrap();
        assert!((row0[0] - 1.0).abs() < 1e-6);
        assert_eq!(&row0[1..], &[0.0, 0.0]);
        // Upper triangle is fully masked.
        let row1 = Vec::<f32>::try_from(&weights.get(1)).unwrap();
        assert_eq!(row1[2], 0.0);
    }

    // -- MultiHeadAttention tests --

    #[test]
    fn test_multi_head_output_shape() {
        let vs = VarStore::new(Device::Cpu);
        let config = GptConfig {
            head_size: 4,
            n_heads: 3,
            ..small_config()
        };
        let mha = MultiHeadAttention::new(&vs.root(), &config);
        let output = mha.forward(&random_input(2, 8, config.n_embd()));
        assert_eq!(output.size(), &[2, 8, 12]);
    }

    #[test]
    fn test_multi_head_causal_masking() {
        let vs = VarStore::new(Device::Cpu);
        let config = small_config();
        let mha = MultiHeadAttention::new(&vs.root(), &config);

        let input_a = random_input(1, 4, config.n_embd());
        let output_a = mha.forward(&input_a);
        let input_b = input_a.copy();
        input_b.narrow(1, 3, 1).copy_(&random_input(1, 1, config.n_embd()));
        let output_b = mha.forward(&input_b);

        for pos in 0..3 {
            let diff = max_abs_diff(&output_a.get(0).get(pos), &output_b.get(0).get(pos));
            assert!(diff < 1e-5, "Position {} changed when only a future token was modified", pos);
        }
    }

    // -- FeedForward / Block tests --

    #[test]
    fn test_feed_forward_keeps_width() {
        let vs = VarStore::new(Device::Cpu);
        let ff = FeedForward::new(&vs.root(), 8);
        assert_eq!(ff.forward(&random_input(2, 3, 8)).size(), &[2, 3, 8]);
    }

    #[test]
    fn test_block_is_identity_plus_correction() {
        let vs = VarStore::new(Device::Cpu);
        let config = small_config();
        let block = Block::new(&vs.root(), &config);
        let input = random_input(2, 5, config.n_embd());
        assert_eq!(block.forward(&input).size(), input.size());

        // With every sublayer silenced, only the residual path remains.
        tch::no_grad(|| {
            for (_, mut var) in vs.variables() {
                let _ = var.zero_();
            }
        });
        assert!(max_abs_diff(&block.forward(&input), &input) < 1e-6);
    }

    // -- Gpt tests --

    #[test]
    fn test_forward_without_targets() {
        let vs = VarStore::new(Device::Cpu);
        let model = Gpt::new(&vs.root(), small_config()).unwrap();
        let idx = Tensor::from_slice2(&[&[1i64, 2, 3, 4], &[5, 6, 7, 8]]);
        let (logits, loss) = model.forward(&idx, None).unwrap();
        assert_eq!(logits.size(), &[2, 4, 11]);
        assert!(loss.is_none());
    }

    #[test]
    fn test_forward_with_targets() {
        let vs = VarStore::new(Device::Cpu);
        let model = Gpt::new(&vs.root(), small_config()).unwrap();
        let idx = Tensor::from_slice2(&[&[1i64, 2, 3, 4], &[5, 6, 7, 8]]);
        let targets = Tensor::from_slice2(&[&[2i64, 3, 4, 5], &[6, 7, 8, 9]]);
        let (logits, loss) = model.forward(&idx, Some(&targets)).unwrap();
        assert_eq!(logits.size(), &[2, 4, 11]);
        let loss = loss.expect("targets were given");
        assert!(loss.size().is_empty(), "loss should be a scalar");
        let loss = f64::try_from(&loss).unwrap();
        assert!(loss.is_finite() && loss >= 0.0, "got {}", loss);
    }

    #[test]
    fn test_same_token_different_positions() {
        let vs = VarStore::new(Device::Cpu);
        let model = Gpt::new(&vs.root(), small_config()).unwrap();
        let idx = Tensor::ones([1, 4], (Int64, Device::Cpu)) * 3;
        let (logits, _) = model.forward(&idx, None).unwrap();
        let diff = max_abs_diff(&logits.get(0).get(0), &logits.get(0).get(1));
        assert!(diff > 0.0, "position embeddings should separate identical tokens");
    }

    #[test]
    fn test_forward_rejects_overlong_sequence() {
        let vs = VarStore::new(Device::Cpu);
        let model = Gpt::new(&vs.root(), small_config()).unwrap();
        let idx = Tensor::zeros([1, 9], (Int64, Device::Cpu));
        assert!(model.forward(&idx, None).is_err());
    }

    #[test]
    fn test_forward_rejects_mismatched_targets() {
        let vs = VarStore::new(Device::Cpu);
        let model = Gpt::new(&vs.root(), small_config()).unwrap();
        let idx = Tensor::zeros([2, 4], (Int64, Device::Cpu));
        // Same element count, different layout.
        let transposed = Tensor::zeros([4, 2], (Int64, Device::Cpu));
        assert!(model.forward(&idx, Some(&transposed)).is_err());
        let short = Tensor::zeros([2, 3], (Int64, Device::Cpu));
        assert!(model.forward(&idx, Some(&short)).is_err());
    }

    #[test]
    fn test_rejects_invalid_config() {
        let vs = VarStore::new(Device::Cpu);
        let config = GptConfig {
            n_blocks: 0,
            ..small_config()
        };
        assert!(Gpt::new(&vs.root(), config).is_err());
    }

    #[test]
    fn test_context_window_is_trailing_block() {
        let vs = VarStore::new(Device::Cpu);
        let model = Gpt::new(&vs.root(), small_config()).unwrap();
        let idx = Tensor::arange(20, (Int64, Device::Cpu)).unsqueeze(0);
        let window = model.context_window(&idx);
        assert_eq!(window.size(), &[1, 8]);
        assert_eq!(Vec::<i64>::try_from(&window.get(0)).unwrap(), (12..20).collect::<Vec<_>>());
        let short = Tensor::arange(3, (Int64, Device::Cpu)).unsqueeze(0);
        assert_eq!(model.context_window(&short).size(), &[1, 3]);
    }

    #[test]
    fn test_generation_past_block_size() {
        // forward() rejects anything wider than the block, so hundreds of steps
        // only succeed if every step crops to the trailing window.
        let vs = VarStore::new(Device::Cpu);
        let model = Gpt::new(&vs.root(), small_config()).unwrap();
        let mut rng = StdRng::seed_from_u64(1337);
        let mut idx = Tensor::zeros([2, 1], (Int64, Device::Cpu));
        for _ in 0..300 {
            idx = model.generate_step(&idx, 1.0, &mut rng).unwrap();
        }
        assert_eq!(idx.size(), &[2, 301]);
        let max = i64::try_from(&idx.max()).unwrap();
        let min = i64::try_from(&idx.min()).unwrap();
        assert!(min >= 0 && max < 11);
    }

    #[test]
    fn test_generation_keeps_prefix() {
        let vs = VarStore::new(Device::Cpu);
        let model = Gpt::new(&vs.root(), small_config()).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let idx = Tensor::from_slice2(&[&[4i64, 5, 6]]);
        let next = model.generate_step(&idx, 1.0, &mut rng).unwrap();
        assert_eq!(next.size(), &[1, 4]);
        assert!(next.narrow(1, 0, 3).equal(&idx));
    }
}
