use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::sync::Arc;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use vcam::{TestPatternSource, VcamConfig, VirtualCamera};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SourceKind {
    /// Built-in moving colour bars
    Pattern,
    /// No frames; streams stay idle until an external source attaches
    #[value(name = "none")]
    Disabled,
}

#[derive(Parser, Debug)]
#[command(name = "vcam")]
#[command(about = "Virtual ONVIF network camera")]
#[command(version)]
#[command(long_about = "Presents a video frame source as an ONVIF network camera: \
discoverable over WS-Discovery, controllable over SOAP including digital PTZ, and \
viewable through an RTSP relay, an in-process RTSP server or multipart JPEG.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "vcam.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without starting the camera")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Dry run mode - build the camera but don't start it
    #[arg(long, help = "Perform dry run - build every component but don't start them")]
    dry_run: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,

    /// Write logs to a daily rolling file in this directory
    #[arg(long, value_name = "DIR", help = "Directory for daily rolling log files")]
    log_dir: Option<String>,

    /// Frame source driving the camera
    #[arg(long, value_enum, default_value_t = SourceKind::Pattern)]
    source: SourceKind,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle special modes that don't require full initialization
    if args.print_config {
        print_default_config()?;
        return Ok(());
    }

    // Held until exit so buffered file logs are flushed
    let _log_guard = init_logging(&args)?;

    info!("Starting vcam v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let config = match VcamConfig::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        if args.validate_config {
            eprintln!("✗ Configuration validation failed: {}", e);
            std::process::exit(1);
        }
        return Err(e.into());
    }

    if args.validate_config {
        info!("Configuration validation successful");
        println!("✓ Configuration is valid");
        return Ok(());
    }

    let camera = Arc::new(VirtualCamera::new(config).map_err(|e| {
        error!("Failed to create camera: {}", e);
        e
    })?);

    if args.dry_run {
        info!("Dry run mode - components built but not started");
        println!(
            "✓ Dry run completed successfully - camera would be served at {}",
            camera.onvif().device_service_url()
        );
        return Ok(());
    }

    camera.start().await.map_err(|e| {
        error!("Failed to start camera: {}", e);
        e
    })?;

    let source = match args.source {
        SourceKind::Pattern => {
            let source = TestPatternSource::for_camera(&camera);
            Some(tokio::spawn(source.run(Arc::clone(&camera))))
        }
        SourceKind::Disabled => {
            info!("No frame source attached");
            None
        }
    };

    let exit_code = camera.run().await.map_err(|e| {
        error!("Camera error during execution: {}", e);
        e
    })?;

    if let Some(source) = source {
        let _ = source.await;
    }

    info!("vcam exited with code: {}", exit_code);

    // Exit with appropriate code for systemd
    std::process::exit(exit_code);
}

fn init_logging(args: &Args) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    // Determine log level based on flags
    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("vcam={}", log_level)));

    let (writer, guard) = match &args.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("cannot create log directory '{}'", dir))?;
            let appender = tracing_appender::rolling::daily(dir, "vcam.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stdout), None),
    };
    let to_file = guard.is_some();

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_writer(writer)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_writer(writer)
            .with_ansi(!to_file)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        Some("pretty") | None => fmt::layer()
            .pretty()
            .with_writer(writer)
            .with_ansi(!to_file)
            .with_target(true)
            .with_thread_ids(args.debug)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer()
                .with_writer(writer)
                .with_ansi(!to_file)
                .with_target(true)
                .with_thread_ids(args.debug)
                .with_file(args.debug)
                .with_line_number(args.debug)
                .boxed()
        }
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();

    Ok(guard)
}

/// Print default configuration in TOML format
fn print_default_config() -> Result<()> {
    let rendered = toml::to_string_pretty(&VcamConfig::default())
        .context("failed to render default configuration")?;

    println!("# vcam configuration file");
    println!("# Every option with its default value; VCAM_SECTION__KEY environment");
    println!("# variables override the file (e.g. VCAM_NETWORK__ONVIF_PORT=8000)");
    println!();
    println!("{}", rendered);
    Ok(())
}
