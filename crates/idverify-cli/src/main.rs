use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use idverify_core::geometry::{display_orientation, negotiate_size};
use idverify_core::{
    CaptureGeometry, CaptureSource, Facing, Orchestrator, ReaderLoop, Size, VerifyConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod demo;

#[derive(Parser)]
#[command(name = "idverify")]
#[command(about = "Live face-to-ID-card verification")]
#[command(version)]
struct Cli {
    /// TOML configuration file (IDVERIFY_* environment variables override it)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run verification sessions against the synthetic camera
    Run {
        /// Card photo to verify against (default: the synthetic card)
        #[arg(short, long)]
        reference: Option<PathBuf>,

        /// Card holder name shown with the result
        #[arg(short, long, default_value = "Demo Holder")]
        name: String,

        /// Read the card only once instead of after every session
        #[arg(long)]
        once: bool,

        /// Stop after this many seconds (default: until Ctrl-C)
        #[arg(short, long)]
        duration: Option<u64>,

        /// Synthetic camera frame rate
        #[arg(long, default_value_t = 15)]
        fps: u32,
    },

    /// Print the capture geometry negotiated for a device
    Negotiate {
        /// Supported sizes, e.g. 640x480,1280x720
        #[arg(long, value_delimiter = ',', required = true)]
        sizes: Vec<Size>,

        /// Preview view size
        #[arg(long)]
        view: Option<Size>,

        /// Explicitly requested capture size
        #[arg(long)]
        requested: Option<Size>,

        #[arg(long, value_enum, default_value_t = FacingArg::Front)]
        facing: FacingArg,

        /// Sensor mounting angle in degrees
        #[arg(long, default_value_t = 270)]
        sensor: u32,

        /// Display rotation in quarter turns
        #[arg(long, default_value_t = 0)]
        device_rotation: u32,

        /// Extra rotation in degrees
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        additional_rotation: i32,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum FacingArg {
    Front,
    Back,
}

impl From<FacingArg> for Facing {
    fn from(arg: FacingArg) -> Self {
        match arg {
            FacingArg::Front => Facing::Front,
            FacingArg::Back => Facing::Back,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = VerifyConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Commands::Run {
            reference,
            name,
            once,
            duration,
            fps,
        } => run(config, reference, name, once, duration, fps).await,
        Commands::Negotiate {
            sizes,
            view,
            requested,
            facing,
            sensor,
            device_rotation,
            additional_rotation,
        } => {
            let fallback = sizes.first().copied().unwrap_or(Size::new(640, 480));
            let size = negotiate_size(&sizes, view, requested, additional_rotation, fallback);
            let facing = Facing::from(facing);
            let geometry = CaptureGeometry {
                camera_id: config.capture.camera_id.unwrap_or(0),
                facing,
                size,
                orientation: display_orientation(facing, sensor, device_rotation, additional_rotation),
                mirror: config.capture.mirror,
                mirror_horizontal: config.capture.mirror_horizontal,
                mirror_vertical: config.capture.mirror_vertical,
            };
            println!("{}", serde_json::to_string_pretty(&geometry)?);
            Ok(())
        }
    }
}

async fn run(
    config: VerifyConfig,
    reference: Option<PathBuf>,
    name: String,
    once: bool,
    duration: Option<u64>,
    fps: u32,
) -> Result<()> {
    tracing::info!(
        threshold = config.similarity_threshold,
        read_timeout_ms = config.read_timeout_ms,
        "idverify starting"
    );

    let recognizer = Arc::new(demo::DemoRecognizer::new());
    let (handle, task) = Orchestrator::spawn(&config, recognizer, demo::ConsoleSink)
        .context("failed to start the orchestrator")?;

    let source = CaptureSource::new(
        Arc::new(demo::SyntheticCamera::new(fps)),
        config.capture.clone(),
        handle.capture_listener(),
    );
    source.start().context("failed to start capture")?;

    let submit = handle.clone();
    let reader = ReaderLoop::spawn(
        demo::DemoCardReader::new(name, reference, once),
        handle.reference_gate(),
        config.reader_poll(),
        move |subject| {
            submit.submit_reference(subject);
        },
    )
    .context("failed to start the card reader")?;

    tracing::info!("idverify ready");

    match duration {
        Some(secs) => {
            tokio::select! {
                result = tokio::signal::ctrl_c() => result?,
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
            }
        }
        None => tokio::signal::ctrl_c().await?,
    }
    tracing::info!("idverify shutting down");

    reader.stop();
    source.release();
    handle.shutdown();
    task.await.context("orchestrator task failed")?;

    Ok(())
}
