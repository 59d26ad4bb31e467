use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use rand::Rng;
use seq2seq_transformer::{build_transformer, decoder_mask, padding_mask, ModelConfig};
use tch::{nn, Device, Kind, Tensor};
use tracing::info;

/// Builds the encoder-decoder Transformer and pushes one random batch through it.
#[derive(Parser, Debug)]
#[command(name = "seq2seq-transformer", version)]
struct Cli {
    /// JSON model config; a small demo model is used when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u32).range(1..))]
    batch_size: u32,

    /// Overrides the config's seed
    #[arg(long)]
    seed: Option<u64>,

    /// Run with dropout enabled
    #[arg(long)]
    train: bool,

    /// Id treated as padding when building masks
    #[arg(long, default_value_t = 0)]
    pad_id: i64,
}

fn demo_config() -> ModelConfig {
    ModelConfig::new(50, 60, 10, 8)
        .with_d_model(32)
        .with_num_heads(4)
        .with_num_layers(2)
        .with_d_ff(64)
}

/// Random ids in `1..vocab_size`, with the last position of every row padded.
fn random_ids(batch_size: u32, seq_len: i64, vocab_size: i64, pad_id: i64) -> Result<Tensor> {
    if vocab_size < 2 {
        bail!("vocabulary of size {vocab_size} leaves no id besides padding");
    }
    let batch_size = i64::from(batch_size);
    let mut rng = rand::thread_rng();
    let ids: Vec<i64> = (0..batch_size * seq_len)
        .map(|i| {
            if seq_len > 1 && i % seq_len == seq_len - 1 {
                pad_id
            } else {
                rng.gen_range(1..vocab_size)
            }
        })
        .collect();
    Ok(Tensor::from_slice(&ids).view([batch_size, seq_len]))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("seq2seq_transformer=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let mut cfg = match &cli.config {
        Some(path) => ModelConfig::from_json_file(path)
            .with_context(|| format!("Cannot load model config from '{}'", path.display()))?,
        None => demo_config(),
    };
    if let Some(seed) = cli.seed {
        cfg = cfg.with_seed(seed);
    }

    let device = Device::cuda_if_available();
    let vs = nn::VarStore::new(device);
    let model = build_transformer(&vs, &cfg).context("Failed to build the transformer")?;
    info!(?device, params = vs.trainable_variables().len(), "model ready");

    let src = random_ids(cli.batch_size, cfg.src_seq_len, cfg.src_vocab_size, cli.pad_id)?.to(device);
    let tgt = random_ids(cli.batch_size, cfg.tgt_seq_len, cfg.tgt_vocab_size, cli.pad_id)?.to(device);
    let src_mask = padding_mask(&src, cli.pad_id)?;
    let tgt_mask = decoder_mask(&tgt, cli.pad_id)?;

    let log_probs = tch::no_grad(|| -> Result<Tensor> {
        let memory = model.encode(&src, Some(&src_mask), cli.train)?;
        info!(shape = ?memory.size(), "encoded");
        let decoded = model.decode(&memory, Some(&src_mask), &tgt, Some(&tgt_mask), cli.train)?;
        info!(shape = ?decoded.size(), "decoded");
        Ok(model.project(&decoded)?)
    })?;

    let mass = log_probs.exp().sum_dim_intlist([-1i64].as_slice(), false, Kind::Float);
    info!(
        shape = ?log_probs.size(),
        min_mass = mass.min().double_value(&[]),
        max_mass = mass.max().double_value(&[]),
        "projected"
    );
    Ok(())
}
