use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use clap::{Parser, ValueEnum};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

use tcfg::device::select_device;
use tcfg::{process_before_every_sampling, CfgDenoiser, GenerationRequest, Settings};

// =============================================================================
// CLI ARGUMENTS
// =============================================================================
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML settings file (missing file = defaults)
    #[arg(long, default_value = "tcfg.toml")]
    config: PathBuf,

    /// Override the TCFG scale (enables TCFG)
    #[arg(long)]
    scale: Option<f32>,

    #[arg(long)]
    cfg_scale: Option<f64>,

    /// Run plain CFG only
    #[arg(long, default_value_t = false)]
    disable: bool,

    /// safetensors file with `cond_denoised`, `uncond_denoised` and `input`
    #[arg(long)]
    input: Option<PathBuf>,

    /// Shape of the synthetic step when no --input is given
    #[arg(long, default_value = "1,4,64,64")]
    shape: String,

    #[arg(long, value_enum, default_value_t = Precision::F32)]
    dtype: Precision,

    /// Random seed for the synthetic step
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Where to write the guided output (key `guided`)
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum Precision {
    F16,
    Bf16,
    F32,
    F64,
}

impl From<Precision> for DType {
    fn from(p: Precision) -> Self {
        match p {
            Precision::F16 => DType::F16,
            Precision::Bf16 => DType::BF16,
            Precision::F32 => DType::F32,
            Precision::F64 => DType::F64,
        }
    }
}

struct Step {
    cond_denoised: Tensor,
    uncond_denoised: Tensor,
    input: Tensor,
}

fn parse_shape(shape: &str) -> Result<Vec<usize>> {
    let dims = shape
        .split(',')
        .map(|d| d.trim().parse::<usize>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("bad shape {shape:?}"))?;
    if dims.len() < 2 || dims.contains(&0) {
        bail!("shape needs a batch dim and at least one non-empty spatial dim, got {shape:?}");
    }
    Ok(dims)
}

fn load_step(path: &Path, device: &Device, dtype: DType) -> Result<Step> {
    let mut tensors = candle_core::safetensors::load(path, device)
        .with_context(|| format!("loading {}", path.display()))?;
    let mut take = |key: &str| -> Result<Tensor> {
        let t = tensors
            .remove(key)
            .with_context(|| format!("{} has no `{key}` tensor", path.display()))?;
        Ok(t.to_dtype(dtype)?)
    };
    let step = Step {
        cond_denoised: take("cond_denoised")?,
        uncond_denoised: take("uncond_denoised")?,
        input: take("input")?,
    };
    if step.cond_denoised.dims() != step.input.dims()
        || step.uncond_denoised.dims() != step.input.dims()
    {
        bail!(
            "shape mismatch: cond {:?}, uncond {:?}, input {:?}",
            step.cond_denoised.dims(),
            step.uncond_denoised.dims(),
            step.input.dims()
        );
    }
    Ok(step)
}

fn synthetic_step(dims: &[usize], seed: u64, device: &Device, dtype: DType) -> Result<Step> {
    let mut rng = StdRng::seed_from_u64(seed);
    let numel: usize = dims.iter().product();
    let mut sample = |spread: f32| -> Result<Tensor> {
        let data: Vec<f32> = (0..numel).map(|_| rng.gen_range(-spread..spread)).collect();
        Ok(Tensor::from_vec(data, dims, device)?.to_dtype(dtype)?)
    };

    let input = sample(1.0)?;
    // predictions = input minus a noise estimate; cond and uncond share part of it
    let shared = sample(0.5)?;
    let cond_denoised = ((&input - &shared)? - sample(0.25)?)?;
    let uncond_denoised = ((&input - &shared)? - sample(0.25)?)?;
    Ok(Step {
        cond_denoised,
        uncond_denoised,
        input,
    })
}

fn l2(t: &Tensor) -> Result<f32> {
    Ok(t
        .to_dtype(DType::F32)?
        .sqr()?
        .sum_all()?
        .sqrt()?
        .to_scalar::<f32>()?)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut settings = Settings::load(&args.config)?;
    if let Some(scale) = args.scale {
        settings.tcfg.enabled = true;
        settings.tcfg.scale = scale;
    }
    if let Some(cfg_scale) = args.cfg_scale {
        settings.cfg_scale = cfg_scale;
    }
    if args.disable {
        settings.tcfg.enabled = false;
    }
    settings.validate()?;

    let device = select_device(settings.device, settings.cuda_ordinal)?;
    let dtype = DType::from(args.dtype);
    info!(?device, ?dtype, "device ready");

    let step = match &args.input {
        Some(path) => load_step(path, &device, dtype)?,
        None => synthetic_step(&parse_shape(&args.shape)?, args.seed, &device, dtype)?,
    };

    let base = CfgDenoiser::new();
    let mut request = GenerationRequest::new(settings.cfg_scale, settings.tcfg);
    let unet = process_before_every_sampling(&mut request, &base).unwrap_or_else(|| base.clone());

    let plain = base.combine(
        &step.cond_denoised,
        &step.uncond_denoised,
        &step.input,
        request.cfg_scale,
    )?;
    let guided = unet.combine(
        &step.cond_denoised,
        &step.uncond_denoised,
        &step.input,
        request.cfg_scale,
    )?;

    let delta = l2(&(&guided - &plain)?)?;
    let norm = l2(&plain)?;
    println!("shape          : {:?}", guided.dims());
    println!("cfg_scale      : {}", request.cfg_scale);
    println!("post-cfg hooks : {}", unet.post_cfg_hooks());
    println!("|plain cfg|    : {norm:.6}");
    println!("|tcfg - plain| : {delta:.6}");
    println!(
        "params         : {}",
        serde_json::to_string(&request.extra_generation_params)?
    );

    if let Some(path) = &args.output {
        let tensors = HashMap::from([("guided".to_string(), guided)]);
        candle_core::safetensors::save(&tensors, path)
            .with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "guided output written");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_shape() -> Result<()> {
        assert_eq!(parse_shape("1,4,64,64")?, vec![1, 4, 64, 64]);
        assert_eq!(parse_shape(" 2, 3 ")?, vec![2, 3]);
        assert!(parse_shape("4").is_err());
        assert!(parse_shape("1,0,8").is_err());
        assert!(parse_shape("1,x").is_err());
        Ok(())
    }

    #[test]
    fn test_synthetic_step_is_seeded() -> Result<()> {
        let device = Device::Cpu;
        let a = synthetic_step(&[1, 2, 4, 4], 7, &device, DType::F32)?;
        let b = synthetic_step(&[1, 2, 4, 4], 7, &device, DType::F32)?;
        assert_eq!(
            a.input.flatten_all()?.to_vec1::<f32>()?,
            b.input.flatten_all()?.to_vec1::<f32>()?
        );
        assert_eq!(a.cond_denoised.dims(), &[1, 2, 4, 4]);
        Ok(())
    }
}
