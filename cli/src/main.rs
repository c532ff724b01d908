use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use attention::masks::{combine_masks, non_pad_mask, subsequent_mask};
use attention::standard::weight_row_sums;
use attention::{Attention, AttentionConfig, AttentionLayer, ForwardMode};
use candle_core::{Device, Tensor};
use clap::Parser;
use rand::{rngs::StdRng, Rng, SeedableRng};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        eprintln!("attention probe failed: {err:#}");
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Run one attention forward pass on synthetic input", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Attention config file (.toml or .json)"
    )]
    config: PathBuf,

    #[arg(long, default_value_t = 2, help = "Number of utterances")]
    batch: usize,

    #[arg(long, default_value_t = 64, help = "Frames per utterance")]
    time: usize,

    #[arg(
        long,
        value_delimiter = ',',
        value_name = "N,N,..",
        help = "Valid frames per utterance; builds a padding mask"
    )]
    lengths: Vec<usize>,

    #[arg(long, help = "Also apply a subsequent (decoder) mask")]
    causal: bool,

    #[arg(long, help = "Run in training mode so dropout is active")]
    train: bool,

    #[arg(long, default_value_t = 0, help = "Seed for input and dropout sampling")]
    seed: u64,
}

fn run() -> Result<()> {
    let args = Args::parse();
    let device = Device::Cpu;

    let mut config = AttentionConfig::from_path(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    config.apply_env_overrides();
    let layer = AttentionLayer::from_config(&config, &device).context("building attention")?;
    log::info!(
        "built {} attention n_head={} n_feat={} n_attn={}",
        layer.kind_name(),
        config.n_head,
        config.n_feat,
        config.n_attn
    );

    let mut rng = StdRng::seed_from_u64(args.seed);
    let input = synthetic_input(&mut rng, args.batch, args.time, config.n_feat, &device)?;
    let mask = build_mask(&args, &device)?;

    let mut mode = if args.train {
        ForwardMode::training(&mut rng)
    } else {
        ForwardMode::Inference
    };

    let out = layer.forward(&input, &input, &input, mask.as_ref(), &mut mode)?;
    log::info!(
        "output {:?} weights {:?}",
        out.output.dims(),
        out.weights.dims()
    );

    let sums = weight_row_sums(&out.weights)?.flatten_all()?;
    log::info!(
        "weight row sums min={:.6} max={:.6}",
        sums.min(0)?.to_vec0::<f32>()?,
        sums.max(0)?.to_vec0::<f32>()?
    );

    if let AttentionLayer::Nystrom(nystrom) = &layer {
        let (_, trace) = nystrom.forward_traced(&input, &input, &input)?;
        for (step, residual) in trace.residuals.iter().enumerate() {
            log::info!("pinv residual step {step}: {residual:.3e}");
        }
    }
    Ok(())
}

fn synthetic_input(
    rng: &mut StdRng,
    batch: usize,
    time: usize,
    n_feat: usize,
    device: &Device,
) -> Result<Tensor> {
    let values: Vec<f32> = (0..batch * time * n_feat)
        .map(|_| rng.gen_range(-1.0..1.0))
        .collect();
    Ok(Tensor::from_vec(values, (batch, time, n_feat), device)?)
}

fn build_mask(args: &Args, device: &Device) -> Result<Option<Tensor>> {
    if args.lengths.is_empty() && !args.causal {
        return Ok(None);
    }
    let lengths = if args.lengths.is_empty() {
        vec![args.time; args.batch]
    } else {
        args.lengths.clone()
    };
    if lengths.len() != args.batch {
        bail!(
            "--lengths has {} entries but --batch is {}",
            lengths.len(),
            args.batch
        );
    }
    let padding = non_pad_mask(device, &lengths, args.time)?;
    if args.causal {
        let subsequent = subsequent_mask(device, args.time)?;
        return Ok(Some(combine_masks(&padding, &subsequent)?));
    }
    Ok(Some(padding))
}
