use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use log::{debug, info, warn};
use tch::{
    CModule, Device,
    Kind::{Float, Int64},
    Tensor,
    data::Iter2,
    nn::{self, Adam, Conv2D, Linear, Module, OptimizerConfig, VarStore},
};

use crate::{
    constants::{
        MNIST_BATCH_SIZE, MNIST_DATA_DIR, MNIST_EPOCHS, MNIST_LEARNING_RATE, MNIST_LOG_EVERY,
        MNIST_MEAN, MNIST_MODEL_STEM, MNIST_STD, MNIST_URL,
    },
    dataset,
    interrupt::{InterruptPolicy, StopFlag},
};

const IMAGE_SIDE: i64 = 28;
const IDX_FILES: [&str; 4] = [
    "train-images-idx3-ubyte",
    "train-labels-idx1-ubyte",
    "t10k-images-idx3-ubyte",
    "t10k-labels-idx1-ubyte",
];
const EVAL_BATCH_SIZE: i64 = 1024;

/// Two 3x3 convolutions, a 2x2 max-pool and two fully connected layers,
/// emitting log-probabilities over the ten digits.
#[derive(Debug)]
pub struct Net {
    conv1: Conv2D,
    conv2: Conv2D,
    fc1: Linear,
    fc2: Linear,
}

impl Net {
    pub fn new(vs: &nn::Path) -> Net {
        let conv1 = nn::conv2d(vs / "conv1", 1, 32, 3, Default::default());
        let conv2 = nn::conv2d(vs / "conv2", 32, 64, 3, Default::default());
        // 64 channels x 12 x 12 after two valid 3x3 convolutions and one 2x2 pool.
        let fc1 = nn::linear(vs / "fc1", 9216, 128, Default::default());
        let fc2 = nn::linear(vs / "fc2", 128, 10, Default::default());
        Net {
            conv1,
            conv2,
            fc1,
            fc2,
        }
    }
}

impl Module for Net {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.view([-1, 1, IMAGE_SIDE, IMAGE_SIDE])
            .apply(&self.conv1)
            .relu()
            .apply(&self.conv2)
            .relu()
            .max_pool2d_default(2)
            .flat_view()
            .apply(&self.fc1)
            .relu()
            .apply(&self.fc2)
            .log_softmax(-1, Float)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MnistConfig {
    pub data_dir: PathBuf,
    /// Base URL of the gzipped IDX files, used for any missing from `data_dir`.
    pub base_url: String,
    pub epochs: usize,
    pub batch_size: i64,
    pub learning_rate: f64,
    /// Output path without extension; `.safetensors` and `.pt` are appended.
    pub model_filename: String,
    pub on_interrupt: InterruptPolicy,
}

impl Default for MnistConfig {
    fn default() -> Self {
        MnistConfig {
            data_dir: PathBuf::from(MNIST_DATA_DIR),
            base_url: MNIST_URL.to_string(),
            epochs: MNIST_EPOCHS,
            batch_size: MNIST_BATCH_SIZE,
            learning_rate: MNIST_LEARNING_RATE,
            model_filename: MNIST_MODEL_STEM.to_string(),
            on_interrupt: InterruptPolicy::Stop,
        }
    }
}

/// Normalised images `[N, 1, 28, 28]` and Int64 labels `[N]`.
pub struct MnistData {
    pub train_images: Tensor,
    pub train_labels: Tensor,
    pub test_images: Tensor,
    pub test_labels: Tensor,
}

pub fn normalize(images: &Tensor) -> Tensor {
    (images.view([-1, 1, IMAGE_SIDE, IMAGE_SIDE]) - MNIST_MEAN) / MNIST_STD
}

/// Makes sure the four IDX files are in `dir`, downloading `<base_url>/<name>.gz`
/// and decompressing it for each one that is missing. Files already present
/// are used as they are.
pub fn fetch(dir: &Path, base_url: &str) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    for name in IDX_FILES {
        let path = dir.join(name);
        if path.exists() {
            debug!("Using cached {}", path.display());
            continue;
        }
        let url = format!("{}/{name}.gz", base_url.trim_end_matches('/'));
        info!("Downloading {} to {}", url, path.display());
        let compressed = dataset::download(&url)?;
        let mut raw = Vec::new();
        GzDecoder::new(compressed.as_slice())
            .read_to_end(&mut raw)
            .with_context(|| format!("Failed to decompress {url}"))?;
        dataset::write_atomic(&path, &raw)?;
    }
    Ok(())
}

/// Loads the four uncompressed IDX files from `dir`.
pub fn load(dir: &Path) -> Result<MnistData> {
    let dataset = tch::vision::mnist::load_dir(dir).with_context(|| {
        format!(
            "Failed to load MNIST from {} (expected train-images-idx3-ubyte, \
             train-labels-idx1-ubyte, t10k-images-idx3-ubyte, t10k-labels-idx1-ubyte)",
            dir.display()
        )
    })?;
    Ok(MnistData {
        train_images: normalize(&dataset.train_images),
        train_labels: dataset.train_labels.to_kind(Int64),
        test_images: normalize(&dataset.test_images),
        test_labels: dataset.test_labels.to_kind(Int64),
    })
}

/// How a call to [`train`] ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainOutcome {
    pub epochs_completed: usize,
    pub batches_run: usize,
    pub interrupted: bool,
}

/// Adam over shuffled mini-batches for `config.epochs` epochs, logging the
/// mean loss every few batches. A raised `stop` ends training early.
pub fn train(
    vs: &VarStore,
    net: &Net,
    images: &Tensor,
    labels: &Tensor,
    config: &MnistConfig,
    stop: &StopFlag,
) -> Result<TrainOutcome> {
    let mut optimizer = Adam::default()
        .build(vs, config.learning_rate)
        .context("failed to create Adam optimizer")?;
    let _armed = stop.arm();
    let mut outcome = TrainOutcome {
        epochs_completed: 0,
        batches_run: 0,
        interrupted: false,
    };
    'epochs: for epoch in 0..config.epochs {
        let mut running_loss = 0.0;
        let mut batches = Iter2::new(images, labels, config.batch_size);
        batches.shuffle().return_smaller_last_batch().to_device(vs.device());
        for (i, (inputs, targets)) in batches.enumerate() {
            if stop.is_raised() {
                outcome.interrupted = true;
                break 'epochs;
            }
            let loss = net.forward(&inputs).nll_loss(&targets);
            optimizer.zero_grad();
            loss.backward();
            optimizer.step();
            outcome.batches_run += 1;

            running_loss += f64::try_from(&loss)?;
            if i % MNIST_LOG_EVERY == MNIST_LOG_EVERY - 1 {
                info!(
                    "[{}, {:5}] loss: {:.3}",
                    epoch + 1,
                    i + 1,
                    running_loss / MNIST_LOG_EVERY as f64
                );
                running_loss = 0.0;
            }
        }
        outcome.epochs_completed += 1;
        debug!("epoch {} done", epoch + 1);
    }
    if outcome.interrupted {
        warn!("[!] Aborted training!");
    } else {
        info!("[*] Finished Training");
    }
    Ok(outcome)
}

/// Number of top-1 correct predictions and the number of samples.
pub fn accuracy<M: Module>(model: &M, images: &Tensor, labels: &Tensor, device: Device) -> Result<(i64, i64)> {
    let _guard = tch::no_grad_guard();
    let mut correct = 0;
    let mut total = 0;
    let mut batches = Iter2::new(images, labels, EVAL_BATCH_SIZE);
    batches.return_smaller_last_batch().to_device(device);
    for (inputs, targets) in batches {
        let predicted = model.forward(&inputs).argmax(-1, false);
        correct += i64::try_from(&predicted.eq_tensor(&targets).sum(Int64))?;
        total += targets.size()[0];
    }
    Ok((correct, total))
}

/// Writes `<stem>.safetensors` (weights) and `<stem>.pt` (traced TorchScript),
/// then runs the traced module once on the trace input as a smoke check.
pub fn export(vs: &VarStore, net: &Net, stem: &str) -> Result<(PathBuf, PathBuf)> {
    let weights_path = PathBuf::from(format!("{stem}.safetensors"));
    vs.save(&weights_path)
        .with_context(|| format!("Failed to save weights to {}", weights_path.display()))?;

    let script_path = PathBuf::from(format!("{stem}.pt"));
    let trace = Tensor::zeros([1, 1, IMAGE_SIDE, IMAGE_SIDE], (Float, vs.device()));
    let _guard = tch::no_grad_guard();
    let mut forward = |inputs: &[Tensor]| vec![net.forward(&inputs[0])];
    let module = CModule::create_by_tracing("MnistNet", "forward", &[trace.shallow_clone()], &mut forward)
        .context("Failed to trace model")?;
    module.forward_ts(&[trace]).context("Traced module failed on the trace input")?;
    module
        .save(&script_path)
        .with_context(|| format!("Failed to save TorchScript to {}", script_path.display()))?;
    Ok((weights_path, script_path))
}

/// Load, train, evaluate, export.
pub fn run(config: &MnistConfig, device: Device, stop: &StopFlag) -> Result<()> {
    info!("[*] Load MNIST dataset");
    fetch(&config.data_dir, &config.base_url)?;
    let data = load(&config.data_dir)?;

    let vs = VarStore::new(device);
    let net = Net::new(&vs.root());

    info!("[*] Train model");
    train(&vs, &net, &data.train_images, &data.train_labels, config, stop)?;

    let (correct, total) = accuracy(&net, &data.test_images, &data.test_labels, device)?;
    anyhow::ensure!(total > 0, "MNIST test set is empty");
    info!(
        "Model accuracy on {} test images: {} %",
        total,
        100 * correct / total
    );

    info!("[*] Export model");
    let (weights, script) = export(&vs, &net, &config.model_filename)?;
    info!("Weights written to {}", weights.display());
    info!("TorchScript written to {}", script.display());
    info!("[*] done");
    Ok(())
}
