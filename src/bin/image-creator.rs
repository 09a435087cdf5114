use std::io::IsTerminal;
use std::path::PathBuf;

use clap::{CommandFactory, Parser};
use image_creator::{run, CacheLocation, OutputTarget, RunConfig};
use image_creator_oci::{DockerCredentials, RegistryClient, RegistryTransport};
use tokio_util::sync::CancellationToken;
use tracing::warn;

const EXAMPLES: &str = "\
Examples:
  image-creator nginx:latest alpine:latest > archive.tar
  image-creator nginx:latest | gzip > archive.tar.gz
  image-creator -o myimages.tar redis:7 postgres:15
  image-creator -f -o existing.tar app:latest
  image-creator -q registry.example.com/app:v1.0.0 | pigz > archive.tar.gz";

/// Create a docker-archive containing one or more container images.
#[derive(Debug, Parser)]
#[command(name = "image-creator", version, about, after_help = EXAMPLES)]
struct Cli {
    /// Output archive file name (default: stdout)
    #[arg(short, long, value_name = "FILE", env = "IMAGE_CREATOR_OUTPUT")]
    output: Option<PathBuf>,

    /// Cache directory for layer deduplication (default: temp directory)
    #[arg(short, long, value_name = "DIR", env = "IMAGE_CREATOR_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Overwrite output file if it already exists
    #[arg(short, long, env = "IMAGE_CREATOR_FORCE")]
    force: bool,

    /// Disable layer download progress output (quiet mode)
    #[arg(short, long, env = "IMAGE_CREATOR_QUIET")]
    quiet: bool,

    /// Images to include, in archive order
    #[arg(value_name = "IMAGE")]
    images: Vec<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => match e.kind() {
            clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => e.exit(),
            _ => {
                let _ = e.print();
                std::process::exit(1);
            }
        },
    };

    if cli.images.is_empty() {
        eprintln!("Error: No images specified\n");
        eprintln!("{}", Cli::command().render_help());
        std::process::exit(1);
    }

    let output = OutputTarget::from_arg(cli.output);
    let config = RunConfig::new(cli.images, output.clone())
        .with_cache(CacheLocation::from_arg(cli.cache_dir))
        .with_force(cli.force)
        .with_quiet(cli.quiet)
        .with_stdout_is_terminal(std::io::stdout().is_terminal());

    let credentials = DockerCredentials::load_default().unwrap_or_else(|e| {
        warn!(error = %e, "ignoring unreadable docker config");
        DockerCredentials::anonymous()
    });
    let transport = match RegistryClient::new(credentials) {
        Ok(client) => RegistryTransport::new(client),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    if let Err(e) = run(&config, &transport, &cancel).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    if let OutputTarget::File(path) = &output {
        eprintln!(
            "Successfully created docker-archive: {} (compatible with both 'docker load -i' and 'podman load -i')",
            path.display()
        );
    }
}
