/// Where the Tiny Shakespeare corpus is fetched from when no local copy exists.
pub const DATASET_URL: &str =
    "https://raw.githubusercontent.com/karpathy/char-rnn/master/data/tinyshakespeare/input.txt";
/// Local cache path for the corpus.
pub const DATASET_PATH: &str = "input.txt";
/// The fraction of the encoded corpus used for training; the tail is kept for validation.
pub const TRAIN_VALIDATION_SPLIT: f64 = 0.9;

/// Context window: how many preceding tokens the model conditions on.
pub const BLOCK_SIZE: i64 = 64;
/// Number of stacked transformer blocks.
pub const BLOCKS: i64 = 4;
/// Width of a single attention head.
pub const HEAD_SIZE: i64 = 64;
/// Number of attention heads per block.
pub const HEADS: i64 = 4;

pub const BATCH_SIZE: i64 = 32;
pub const TRAIN_STEPS: usize = 5000;
pub const LEARNING_RATE: f64 = 1e-4;
/// Batches averaged when reporting train/validation loss after training.
pub const EVAL_ITERS: usize = 50;
/// Number of characters sampled after training.
pub const GENERATE_TOKENS: usize = 1000;
pub const SEED: u64 = 1337;

pub const MNIST_EPOCHS: usize = 10;
pub const MNIST_BATCH_SIZE: i64 = 64;
pub const MNIST_LEARNING_RATE: f64 = 1e-3;
pub const MNIST_DATA_DIR: &str = "data";
/// Mirror serving the gzipped IDX files.
pub const MNIST_URL: &str = "https://ossci-datasets.s3.amazonaws.com/mnist";
pub const MNIST_MODEL_STEM: &str = "model";
/// Per-pixel normalisation used for MNIST inputs.
pub const MNIST_MEAN: f64 = 0.1307;
pub const MNIST_STD: f64 = 0.3081;
/// Print the running loss every this many mini-batches.
pub const MNIST_LOG_EVERY: usize = 100;
