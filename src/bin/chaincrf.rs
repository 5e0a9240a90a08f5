use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};

use chaincrf::{ConfidenceMode, Model, Regularizer, TrainOptions, Trainer};

#[derive(Parser)]
#[command(name = "chaincrf", version, about = "Linear-chain CRF trainer and tagger")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RegArg {
    None,
    L1,
    L2,
}

impl From<RegArg> for Regularizer {
    fn from(arg: RegArg) -> Self {
        match arg {
            RegArg::None => Regularizer::None,
            RegArg::L1 => Regularizer::L1,
            RegArg::L2 => Regularizer::L2,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Train a model by penalized maximum likelihood
    Train {
        /// Training data file
        data: PathBuf,
        /// Output model file
        #[arg(short, long)]
        model: PathBuf,
        /// Held-out data evaluated once per iteration
        #[arg(long)]
        dev: Option<PathBuf>,
        #[arg(long, default_value_t = 100)]
        max_iterations: usize,
        /// Penalty scale: variance for L2, inverse strength for L1
        #[arg(long, default_value_t = 10.0)]
        sigma: f64,
        #[arg(long, value_enum, default_value = "l2")]
        regularizer: RegArg,
        /// Convergence tolerance on the relative objective change
        #[arg(long, default_value_t = 1e-4)]
        eta: f64,
        /// Pseudo-likelihood warm-start iterations before full training
        #[arg(long, default_value_t = 0)]
        pretrain: usize,
    },
    /// Train a model by pseudo-likelihood only
    Pretrain {
        /// Training data file
        data: PathBuf,
        /// Output model file
        #[arg(short, long)]
        model: PathBuf,
        #[arg(long, default_value_t = 100)]
        max_iterations: usize,
        #[arg(long, default_value_t = 10.0)]
        sigma: f64,
        #[arg(long, value_enum, default_value = "l2")]
        regularizer: RegArg,
        #[arg(long, default_value_t = 1e-4)]
        eta: f64,
    },
    /// Tag a labeled test file and report accuracy
    Test {
        /// Model file
        model: PathBuf,
        /// Test data file
        data: PathBuf,
        /// Write one predicted label per line, blank line between
        /// sequences
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Append a normalized local confidence to each output line
        #[arg(long)]
        confidence: bool,
        /// Append the true posterior marginal instead of the local
        /// confidence
        #[arg(long)]
        marginals: bool,
    },
    /// Print a model in readable form
    Dump {
        /// Model file
        model: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Train {
            data,
            model,
            dev,
            max_iterations,
            sigma,
            regularizer,
            eta,
            pretrain,
        } => {
            let mut trainer = Trainer::with_options(TrainOptions {
                max_iterations,
                sigma,
                regularizer: regularizer.into(),
                eta,
                ..TrainOptions::default()
            });
            trainer
                .read_train(&data)
                .with_context(|| format!("reading training data {}", data.display()))?;
            if let Some(dev) = dev {
                trainer
                    .read_dev(&dev)
                    .with_context(|| format!("reading dev data {}", dev.display()))?;
            }
            if pretrain > 0 {
                trainer.options_mut().max_iterations = pretrain;
                trainer.pretrain().context("pseudo-likelihood warm-start")?;
                trainer.options_mut().max_iterations = max_iterations;
            }
            trainer.train().context("training")?;
            if trainer.numeric_warnings() > 0 {
                eprintln!("numeric warnings: {}", trainer.numeric_warnings());
            }
            trainer
                .save_model(&model)
                .with_context(|| format!("saving model {}", model.display()))?;
        }
        Command::Pretrain {
            data,
            model,
            max_iterations,
            sigma,
            regularizer,
            eta,
        } => {
            let mut trainer = Trainer::with_options(TrainOptions {
                max_iterations,
                sigma,
                regularizer: regularizer.into(),
                eta,
                ..TrainOptions::default()
            });
            trainer
                .read_train(&data)
                .with_context(|| format!("reading training data {}", data.display()))?;
            trainer.pretrain().context("pseudo-likelihood training")?;
            trainer
                .save_model(&model)
                .with_context(|| format!("saving model {}", model.display()))?;
        }
        Command::Test {
            model,
            data,
            output,
            confidence,
            marginals,
        } => {
            let model = Model::load(&model)
                .with_context(|| format!("loading model {}", model.display()))?;
            let mode = if marginals {
                Some(ConfidenceMode::Marginal)
            } else if confidence {
                Some(ConfidenceMode::Local)
            } else {
                None
            };
            let mut tagger = model.tagger();
            let report = tagger
                .tag_file(&data, output.as_deref(), mode)
                .with_context(|| format!("tagging {}", data.display()))?;
            println!("sequences = {}", report.sequences);
            println!("accuracy  = {:.3}", report.accuracy);
            println!("micro-f1  = {:.3}", report.micro_f1.2);
            println!("macro-f1  = {:.3}", report.macro_f1.2);
        }
        Command::Dump { model } => {
            let model = Model::load(&model)
                .with_context(|| format!("loading model {}", model.display()))?;
            let params = model.params();
            println!("labels ({}):", params.num_labels());
            for (name, id) in params.labels().iter() {
                println!("  {id} {name}");
            }
            println!("observations: {}", params.num_obs());
            println!("features ({}):", params.num_features());
            for (obs, label, weight) in params.feature_entries() {
                let obs = params.observations().get_name(obs).unwrap_or("?");
                let label = params.label_str(label).unwrap_or("?");
                println!("  {obs} -> {label} = {weight:.6}");
            }
        }
    }
    Ok(())
}
