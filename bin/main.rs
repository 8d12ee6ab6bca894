use anyhow::{bail, Context as _};
use clap::Parser;
use inpaint::data_loader::{FsBlobCache, HttpFetcher, MemoryBlobCache};
use inpaint::worker::{spawn_worker, WorkerPayload};
use inpaint::{InferenceEngine, Orchestrator, WorkerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Remove objects from an image with a locally cached LaMa model.
///
/// Configuration is read from `INPAINT_*` environment variables, e.g.
/// `INPAINT_MODEL_URL`, `INPAINT_CACHE_DIR` or `INPAINT_EXECUTION_TARGETS`.
/// Set `INPAINT_DOWNLOAD_PROGRESS=true` to log byte counts while downloading.
#[derive(Parser)]
#[command(name = "inpaint", version)]
struct Cli {
    /// Image to edit
    image: PathBuf,

    /// Where to write the result
    output: PathBuf,

    /// Mask image; non-black pixels are removed
    #[arg(long)]
    mask: Option<PathBuf>,

    /// Circular brush stroke `x,y,radius` in image coordinates, repeatable
    #[arg(long = "brush", value_parser = parse_brush)]
    brushes: Vec<Brush>,

    /// Keep the square padding instead of cropping back to the input size
    #[arg(long)]
    keep_padding: bool,
}

#[derive(Clone, Copy, Debug)]
struct Brush {
    x: u32,
    y: u32,
    radius: u32,
}

fn parse_brush(value: &str) -> Result<Brush, String> {
    let parts = value
        .split(',')
        .map(|part| part.trim().parse::<u32>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid brush '{}': {}", value, e))?;

    match parts.as_slice() {
        [x, y, radius] => Ok(Brush {
            x: *x,
            y: *y,
            radius: *radius,
        }),
        _ => Err(format!("brush '{}' is not of the form x,y,radius", value)),
    }
}

fn init_logging() -> anyhow::Result<()> {
    tracing_log::LogTracer::init()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging()?;

    let cli = Cli::parse();
    if cli.mask.is_none() && cli.brushes.is_empty() {
        bail!("nothing to remove: pass --mask or at least one --brush");
    }

    let config = WorkerConfig::from_env().context("invalid INPAINT_* configuration")?;
    let engine = Arc::new(InferenceEngine::with_tract(config.image_size));
    let fetcher = HttpFetcher::new(config.origin.clone(), config.timeouts.connect)?;

    let handle = match &config.cache_dir {
        Some(dir) => {
            let cache = FsBlobCache::open(dir).await?;
            spawn_worker(config.clone(), Arc::new(cache), fetcher, engine)
        }
        None => spawn_worker(config.clone(), Arc::new(MemoryBlobCache::new()), fetcher, engine),
    };
    let orchestrator = Orchestrator::new(handle, &config);

    let device = orchestrator
        .init_with_progress(&|payload| match payload {
            WorkerPayload::DownloadProgress {
                received,
                total: Some(total),
            } => info!("downloading model: {} / {} bytes", received, total),
            WorkerPayload::DownloadProgress { received, .. } => {
                info!("downloading model: {} bytes", received)
            }
            other => info!("{}", other.name()),
        })
        .await?;
    info!("running on '{}'", device);

    let image = image::open(&cli.image)
        .with_context(|| format!("cannot read image '{}'", cli.image.display()))?
        .to_rgb8();
    orchestrator.set_image(image)?;

    if let Some(path) = &cli.mask {
        let mask = image::open(path)
            .with_context(|| format!("cannot read mask '{}'", path.display()))?
            .to_luma8();
        orchestrator.set_mask(mask)?;
    }

    // brush coordinates refer to the input image, the mask to its padded square
    let offset = match (orchestrator.source_size(), orchestrator.image()) {
        (Some(source), Some(square)) => (
            (square.width() - source.w) / 2,
            (square.height() - source.h) / 2,
        ),
        _ => (0, 0),
    };
    for brush in &cli.brushes {
        orchestrator.paint_mask(brush.x + offset.0, brush.y + offset.1, brush.radius)?;
    }

    let padded = orchestrator.remove().await?;
    let result = if cli.keep_padding {
        padded
    } else {
        orchestrator.unpadded_image()?
    };

    result
        .save(&cli.output)
        .with_context(|| format!("cannot write '{}'", cli.output.display()))?;
    info!("wrote '{}'", cli.output.display());

    orchestrator.shutdown().await;
    Ok(())
}
