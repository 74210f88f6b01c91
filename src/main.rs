use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use log::{error, info};
use rand::{SeedableRng, rngs::StdRng};
use tch::Device;

mod config;
mod constants;
mod dataset;
mod generate;
mod interrupt;
mod mnist;
mod model;
mod tokenizer;
mod train;

use config::{GptConfig, TrainConfig};
use constants::{
    BATCH_SIZE, BLOCK_SIZE, BLOCKS, DATASET_PATH, DATASET_URL, EVAL_ITERS, GENERATE_TOKENS, HEAD_SIZE,
    HEADS, LEARNING_RATE, MNIST_BATCH_SIZE, MNIST_DATA_DIR, MNIST_EPOCHS, MNIST_LEARNING_RATE,
    MNIST_MODEL_STEM, MNIST_URL, SEED, TRAIN_STEPS, TRAIN_VALIDATION_SPLIT,
};
use generate::Generator;
use interrupt::InterruptPolicy;
use mnist::MnistConfig;
use tokenizer::Tokenizer;
use train::GptTrainer;

fn interrupt_arg(default: &'static str) -> Arg {
    Arg::new("on-interrupt")
        .long("on-interrupt")
        .value_name("POLICY")
        .help("What Ctrl-C does during training: abort|stop")
        .default_value(default)
        .value_parser(clap::value_parser!(String))
}

/// Define the transformer subcommand.
fn gpt_subcommand() -> Command {
    Command::new("gpt")
        .about("Train a character-level GPT on Tiny Shakespeare and sample from it")
        .arg(
            Arg::new("data")
                .long("data")
                .value_name("PATH")
                .help("Local copy of the corpus, downloaded if absent")
                .default_value(DATASET_PATH),
        )
        .arg(
            Arg::new("url")
                .long("url")
                .value_name("URL")
                .help("Where to fetch the corpus from")
                .default_value(DATASET_URL),
        )
        .arg(
            Arg::new("block-size")
                .long("block-size")
                .value_name("INT")
                .help("Context window length")
                .default_value(BLOCK_SIZE.to_string())
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("blocks")
                .long("blocks")
                .value_name("INT")
                .help("Number of stacked transformer blocks")
                .default_value(BLOCKS.to_string())
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("head-size")
                .long("head-size")
                .value_name("INT")
                .help("Width of each attention head")
                .default_value(HEAD_SIZE.to_string())
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("heads")
                .long("heads")
                .value_name("INT")
                .help("Attention heads per block")
                .default_value(HEADS.to_string())
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("batch-size")
                .short('b')
                .long("batch-size")
                .value_name("INT")
                .default_value(BATCH_SIZE.to_string())
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("steps")
                .short('n')
                .long("steps")
                .value_name("INT")
                .help("Number of optimizer steps")
                .default_value(TRAIN_STEPS.to_string())
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("lr")
                .long("lr")
                .value_name("FLOAT")
                .default_value(LEARNING_RATE.to_string())
                .value_parser(clap::value_parser!(f64)),
        )
        .arg(
            Arg::new("tokens")
                .long("tokens")
                .value_name("INT")
                .help("Characters to generate after training")
                .default_value(GENERATE_TOKENS.to_string())
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("temperature")
                .short('t')
                .long("temperature")
                .value_name("FLOAT")
                .default_value("1.0")
                .value_parser(clap::value_parser!(f64)),
        )
        .arg(
            Arg::new("seed")
                .short('s')
                .long("seed")
                .value_name("INT")
                .default_value(SEED.to_string())
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(interrupt_arg("abort"))
}

/// Define the classifier subcommand.
fn mnist_subcommand() -> Command {
    Command::new("mnist")
        .about("Train a convolutional MNIST classifier, report accuracy and export it")
        .arg(
            Arg::new("data-dir")
                .long("data-dir")
                .value_name("DIR")
                .help("Directory holding the MNIST IDX files, filled in from --url if incomplete")
                .default_value(MNIST_DATA_DIR),
        )
        .arg(
            Arg::new("url")
                .long("url")
                .value_name("URL")
                .help("Base URL of the gzipped MNIST IDX files")
                .default_value(MNIST_URL),
        )
        .arg(
            Arg::new("epochs")
                .long("epochs")
                .value_name("INT")
                .default_value(MNIST_EPOCHS.to_string())
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("batch-size")
                .long("batch-size")
                .value_name("INT")
                .default_value(MNIST_BATCH_SIZE.to_string())
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new("learning-rate")
                .long("learning-rate")
                .value_name("FLOAT")
                .default_value(MNIST_LEARNING_RATE.to_string())
                .value_parser(clap::value_parser!(f64)),
        )
        .arg(
            Arg::new("model-filename")
                .long("model-filename")
                .value_name("STEM")
                .help("Output path for the exported model (without extension)")
                .default_value(MNIST_MODEL_STEM),
        )
        .arg(interrupt_arg("stop"))
}

fn get<T: Clone + Send + Sync + 'static>(matches: &ArgMatches, id: &str) -> Result<T> {
    matches
        .get_one::<T>(id)
        .cloned()
        .with_context(|| format!("Missing value for --{id}"))
}

fn interrupt_policy(matches: &ArgMatches) -> Result<InterruptPolicy> {
    get::<String>(matches, "on-interrupt")?.parse()
}

/// Run the transformer pipeline: fetch, tokenize, train, report, sample.
fn run_gpt_command(matches: &ArgMatches) -> Result<()> {
    let seed = get::<u64>(matches, "seed")?;
    // Parameter initialisation draws from libtorch's own generator.
    tch::manual_seed(seed as i64);
    let mut rng = StdRng::seed_from_u64(seed);
    let device = Device::cuda_if_available();

    let data_path = PathBuf::from(get::<String>(matches, "data")?);
    let text = dataset::fetch_cached(&get::<String>(matches, "url")?, &data_path)?;
    info!("Corpus: {} characters from {}", text.chars().count(), data_path.display());

    let tokenizer = Tokenizer::from_corpus(&text);
    info!(
        "Vocabulary ({} characters): {:?}",
        tokenizer.vocab_size(),
        tokenizer.vocab().iter().collect::<String>()
    );
    let (training, validation) =
        dataset::train_val_split(tokenizer.encode(&text)?, TRAIN_VALIDATION_SPLIT);

    let model_config = GptConfig {
        block_size: get(matches, "block-size")?,
        n_blocks: get(matches, "blocks")?,
        head_size: get(matches, "head-size")?,
        n_heads: get(matches, "heads")?,
        ..GptConfig::new(tokenizer.vocab_size() as i64)
    };
    let train_config = TrainConfig {
        batch_size: get(matches, "batch-size")?,
        steps: get(matches, "steps")?,
        learning_rate: get(matches, "lr")?,
        on_interrupt: interrupt_policy(matches)?,
    };
    let stop = interrupt::install(train_config.on_interrupt)?;

    let mut trainer = GptTrainer::new(device, model_config, train_config)?;
    trainer.log_summary();
    let report = trainer.train(&training, &mut rng, &stop)?;
    info!(
        "Trained {} steps{}, last batch loss {:.4}",
        report.steps_run,
        if report.interrupted { " (interrupted)" } else { "" },
        report.last_loss.unwrap_or(f64::NAN)
    );
    info!("train loss {:.4}", trainer.estimate_loss(&training, EVAL_ITERS, &mut rng)?);
    if validation.len() as i64 > model_config.block_size {
        info!("val loss {:.4}", trainer.estimate_loss(&validation, EVAL_ITERS, &mut rng)?);
    }

    let (_var_store, model) = trainer.into_model();
    let mut generator =
        Generator::new(&model, rng).with_temperature(get(matches, "temperature")?)?;
    let context = generator.empty_context();
    let ids = generator.generate(&context, get(matches, "tokens")?)?;
    println!("{}", tokenizer.decode(&ids)?);
    Ok(())
}

/// Run the classifier pipeline.
fn run_mnist_command(matches: &ArgMatches) -> Result<()> {
    let config = MnistConfig {
        data_dir: PathBuf::from(get::<String>(matches, "data-dir")?),
        base_url: get(matches, "url")?,
        epochs: get(matches, "epochs")?,
        batch_size: get(matches, "batch-size")?,
        learning_rate: get(matches, "learning-rate")?,
        model_filename: get(matches, "model-filename")?,
        on_interrupt: interrupt_policy(matches)?,
    };
    let stop = interrupt::install(config.on_interrupt)?;
    mnist::run(&config, Device::cuda_if_available(), &stop)
}

fn execute_commands() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(buf, "{}", record.args())
        })
        .init();

    let matches = Command::new("shakespeare-gpt")
        .about("Train a character-level GPT or an MNIST classifier on libtorch")
        .subcommand(gpt_subcommand())
        .subcommand(mnist_subcommand())
        .get_matches();

    match matches.subcommand() {
        Some(("gpt", matches)) => run_gpt_command(matches),
        Some(("mnist", matches)) => run_mnist_command(matches),
        _ => anyhow::bail!("No subcommand specified. Use -h to print help information."),
    }
}

fn main() {
    if let Err(e) = execute_commands() {
        error!("Error: {e:#}");
        std::process::exit(1);
    }
}
