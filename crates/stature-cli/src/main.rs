use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use image::RgbImage;
use stature_core::config::PipelineConfig;
use stature_core::correction::HeightCorrector;
use stature_core::detector::YoloBoxDetector;
use stature_core::height::HeightInput;
use stature_core::pose::JsonPoseSource;
use stature_core::scale::ReferenceScaleDetector;
use stature_core::{HeightCalculator, HeightPipeline, PipelineRequest};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

mod sink;

use sink::JsonLinesSink;

/// Image file extensions picked up by `batch`.
const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

#[derive(Parser)]
#[command(name = "stature", about = "Estimate human height from a photo and a reference object")]
struct Cli {
    /// TOML configuration file (STATURE_* environment variables still apply)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect the reference object and report the pixel-per-cm scale
    Detect {
        image: PathBuf,
    },
    /// Compute heights from landmarks and a known scale
    Calculate {
        /// Landmark JSON (pose_landmarks envelope or bare list)
        landmarks: PathBuf,
        #[arg(long)]
        pixel_per_cm: f64,
        /// Frame width; defaults to img_width from the landmark file
        #[arg(long)]
        width: Option<f64>,
        /// Frame height; defaults to img_height from the landmark file
        #[arg(long)]
        height: Option<f64>,
    },
    /// Run the correction model on feature rows (JSON array of arrays)
    Predict {
        features: PathBuf,
    },
    /// Run the full pipeline on one image
    Estimate {
        image: PathBuf,
        /// Landmark JSON for this image; defaults to <image stem>.json
        #[arg(short, long)]
        landmarks: Option<PathBuf>,
        /// Append per-person rows to this JSON Lines file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Run the full pipeline on every image in a directory
    Batch {
        dir: PathBuf,
        /// Concurrent images in flight
        #[arg(short, long, default_value_t = 4)]
        jobs: usize,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the resolved configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Commands::Detect { image } => {
            let frame = load_image(&image)?;
            let r = &config.reference;
            let scale = ReferenceScaleDetector::new(
                YoloBoxDetector::new(&r.model_path, r.input_size, r.class_id),
                r.height_cm,
                r.confidence,
            )?;
            let reading = scale.process(&frame)?;
            print_json(&reading)?;
        }
        Commands::Calculate {
            landmarks,
            pixel_per_cm,
            width,
            height,
        } => {
            let source = JsonPoseSource::from_file(&landmarks)?;
            let recorded = source.dimensions();
            let (Some(img_width), Some(img_height)) = (
                width.or(recorded.map(|d| d.0)),
                height.or(recorded.map(|d| d.1)),
            ) else {
                bail!("frame size unknown: pass --width and --height or include img_width/img_height");
            };

            let calculator = HeightCalculator::new(config.geometry_mode()?, config.malformed_pose_policy()?);
            let report = calculator.process(&HeightInput {
                poses: source.poses(),
                img_width,
                img_height,
                pixel_per_cm,
            })?;
            print_json(&report)?;
        }
        Commands::Predict { features } => {
            let raw = std::fs::read_to_string(&features)
                .with_context(|| format!("failed to read {}", features.display()))?;
            let rows: Vec<Vec<f64>> = serde_json::from_str(&raw).context("features must be an array of number arrays")?;
            let corrector = HeightCorrector::from_config(&config.correction)?;
            let predictions = corrector.process(&rows)?;
            print_json(&predictions)?;
        }
        Commands::Estimate {
            image,
            landmarks,
            output,
        } => {
            let mut pipeline = HeightPipeline::from_config(&config)?;
            if let Some(path) = output {
                pipeline = pipeline.with_sink(JsonLinesSink::create(&path)?);
            }
            let landmarks = landmarks.unwrap_or_else(|| sidecar(&image));
            let result = estimate_one(&pipeline, &image, &landmarks);
            print_json(&result?)?;
        }
        Commands::Batch { dir, jobs, output } => {
            let mut pipeline = HeightPipeline::from_config(&config)?;
            if let Some(path) = output {
                pipeline = pipeline.with_sink(JsonLinesSink::create(&path)?);
            }
            run_batch(Arc::new(pipeline), &dir, jobs.max(1)).await?;
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn load_image(path: &Path) -> Result<RgbImage> {
    Ok(image::open(path)
        .with_context(|| format!("failed to decode {}", path.display()))?
        .to_rgb8())
}

/// `photo.jpg` -> `photo.json`
fn sidecar(image: &Path) -> PathBuf {
    image.with_extension("json")
}

fn estimate_one(
    pipeline: &HeightPipeline<YoloBoxDetector>,
    image: &Path,
    landmarks: &Path,
) -> Result<stature_core::PipelineOutput> {
    let request = PipelineRequest::new(load_image(image)?, image.display().to_string());
    let poses = JsonPoseSource::from_file(landmarks)?;
    pipeline.process(&request, &poses).map_err(|e| {
        let kind = e.kind();
        anyhow::Error::new(e).context(format!("{kind:?}: {}", image.display()))
    })
}

async fn run_batch(pipeline: Arc<HeightPipeline<YoloBoxDetector>>, dir: &Path, jobs: usize) -> Result<()> {
    let mut images: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("failed to list {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        })
        .collect();
    images.sort();

    tracing::info!(dir = %dir.display(), images = images.len(), jobs, "batch started");

    let permits = Arc::new(Semaphore::new(jobs));
    let mut tasks = JoinSet::new();

    for image in images {
        let pipeline = Arc::clone(&pipeline);
        let permit = Arc::clone(&permits).acquire_owned().await?;
        tasks.spawn_blocking(move || {
            let landmarks = sidecar(&image);
            let result = estimate_one(&pipeline, &image, &landmarks);
            drop(permit);
            (image, result)
        });
    }

    let (mut ok, mut failed) = (0usize, 0usize);
    while let Some(joined) = tasks.join_next().await {
        let (image, result) = joined?;
        match result {
            Ok(output) => {
                ok += 1;
                println!("{}", serde_json::to_string(&output)?);
            }
            Err(e) => {
                failed += 1;
                tracing::error!(image = %image.display(), error = %format!("{e:#}"), "estimate failed");
            }
        }
    }

    tracing::info!(ok, failed, "batch finished");
    if failed > 0 {
        bail!("{failed} of {} images failed", ok + failed);
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
