use std::{fs, io::Write, path::Path};

use anyhow::{Context, Result};
use log::info;
use rand::Rng;
use tch::Tensor;
use tempfile::NamedTempFile;

/// Reads the corpus at `path`, downloading it from `url` first if there is no
/// local copy yet. A non-success HTTP status is fatal; nothing is retried.
pub fn fetch_cached(url: &str, path: &Path) -> Result<String> {
    if !path.exists() {
        info!("Downloading {} to {}", url, path.display());
        write_atomic(path, &download(url)?)?;
    }
    fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

/// GETs `url` and returns the body of a successful response.
pub fn download(url: &str) -> Result<Vec<u8>> {
    let response =
        reqwest::blocking::get(url).with_context(|| format!("Failed to request {url}"))?;
    if !response.status().is_success() {
        anyhow::bail!("Failed to download {}: server returned {}", url, response.status());
    }
    let body = response
        .bytes()
        .with_context(|| format!("Failed to read body of {url}"))?;
    Ok(body.to_vec())
}

/// Writes `bytes` to a temporary file next to `path` and renames it into
/// place, so `path` either holds the whole content or does not exist.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut file = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create a temporary file in {}", dir.display()))?;
    file.write_all(bytes)
        .with_context(|| format!("Failed to write {}", file.path().display()))?;
    file.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to move download into {}", path.display()))?;
    Ok(())
}

/// Splits an encoded corpus into a leading training part and a trailing validation part.
pub fn train_val_split(tokens: Vec<i64>, train_fraction: f64) -> (Vec<i64>, Vec<i64>) {
    let n = ((tokens.len() as f64) * train_fraction) as usize;
    let mut training = tokens;
    let validation = training.split_off(n.min(training.len()));
    (training, validation)
}

/// Draws random `(input, target)` windows from a token sequence, the target
/// being the input shifted one position to the right.
#[derive(Debug, Clone)]
pub struct Batcher<'a> {
    tokens: &'a [i64],
    block_size: usize,
    batch_size: usize,
}

impl<'a> Batcher<'a> {
    pub fn new(tokens: &'a [i64], block_size: i64, batch_size: i64) -> Result<Self> {
        anyhow::ensure!(block_size > 0 && batch_size > 0, "Window and batch size must be positive");
        let block_size = block_size as usize;
        anyhow::ensure!(
            tokens.len() > block_size,
            "Sequence of {} tokens is too short for a window of {}",
            tokens.len(),
            block_size
        );
        Ok(Batcher {
            tokens,
            block_size,
            batch_size: batch_size as usize,
        })
    }

    /// The window starting at `offset`: `[offset, offset+T)` and `[offset+1, offset+T+1)`.
    fn window(&self, offset: usize) -> (&'a [i64], &'a [i64]) {
        let end = offset + self.block_size;
        (&self.tokens[offset..end], &self.tokens[offset + 1..end + 1])
    }

    /// Samples `batch_size` offsets uniformly from `[0, N - T)` with replacement
    /// and returns `[batch_size, block_size]` Int64 tensors.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> (Tensor, Tensor) {
        let span = self.tokens.len() - self.block_size;
        let mut inputs = Vec::with_capacity(self.batch_size * self.block_size);
        let mut targets = Vec::with_capacity(self.batch_size * self.block_size);
        for _ in 0..self.batch_size {
            let (x, y) = self.window(rng.gen_range(0..span));
            inputs.extend_from_slice(x);
            targets.extend_from_slice(y);
        }
        let shape = [self.batch_size as i64, self.block_size as i64];
        (
            Tensor::from_slice(&inputs).view(shape),
            Tensor::from_slice(&targets).view(shape),
        )
    }
}
