use anyhow::Result;
use rand::Rng;
use tch::{Device, IndexOp, Kind::Int64, Tensor};

use crate::model::Gpt;

/// Autoregressive sampler over a trained [`Gpt`].
pub struct Generator<'a, R: Rng> {
    model: &'a Gpt,
    rng: R,
    temperature: f64,
}

impl<'a, R: Rng> Generator<'a, R> {
    pub fn new(model: &'a Gpt, rng: R) -> Self {
        Generator {
            model,
            rng,
            temperature: 1.0,
        }
    }

    /// Divides the final-step logits before softmax; 1.0 samples the model's distribution as is.
    pub fn with_temperature(mut self, temperature: f64) -> Result<Self> {
        anyhow::ensure!(
            temperature > 0.0 && temperature.is_finite(),
            "Temperature must be positive, got {}",
            temperature
        );
        self.temperature = temperature;
        Ok(self)
    }

    /// A `[1, block_size]` context of token 0, the conventional starting point.
    pub fn empty_context(&self) -> Tensor {
        let block_size = self.model.config().block_size;
        Tensor::zeros([1, block_size], (Int64, self.model.device()))
    }

    /// Extends `context` by `tokens` sampled ids, returning the full first row.
    pub fn generate(&mut self, context: &Tensor, tokens: usize) -> Result<Vec<i64>> {
        let idx = self.completion(context.shallow_clone()).take(tokens).try_fold(
            context.shallow_clone(),
            |_, step| step,
        )?;
        Ok(Vec::<i64>::try_from(&idx.i(0).to_device(Device::Cpu))?)
    }

    /// Endless stream of growing sequences, one more sampled id per item.
    pub fn completion(&mut self, context: Tensor) -> Completion<'_, 'a, R> {
        Completion {
            generator: self,
            idx: context,
        }
    }
}

pub struct Completion<'g, 'a, R: Rng> {
    generator: &'g mut Generator<'a, R>,
    idx: Tensor,
}

impl<R: Rng> Iterator for Completion<'_, '_, R> {
    type Item = Result<Tensor>;

    fn next(&mut self) -> Option<Self::Item> {
        let generator = &mut *self.generator;
        match generator
            .model
            .generate_step(&self.idx, generator.temperature, &mut generator.rng)
        {
            Ok(idx) => {
                self.idx = idx.shallow_clone();
                Some(Ok(idx))
            }
            Err(e) => Some(Err(e)),
        }
    }
}
