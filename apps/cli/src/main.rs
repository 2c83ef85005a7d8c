use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use odin_core::client::{ClientConfig, OdinClient};
use odin_core::transport::NusbTransport;
use odin_core::TracingObserver;
use tracing::error;

#[derive(Parser, Debug)]
#[command(author, version, about = "Download-mode flashing tool", long_about = None)]
struct Args {
    /// Path to the external flashing tool (resolved from PATH when omitted)
    #[arg(long)]
    tool_path: Option<String>,

    /// Load client configuration from a TOML file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Detect a connected download-mode device
    Detect,
    /// List all partitions from the PIT
    Partitions {
        /// Parse an on-disk PIT file instead of downloading one
        #[arg(long)]
        pit: Option<PathBuf>,
    },
    /// Download the PIT to a file
    DownloadPit {
        /// Path for the downloaded PIT
        output: PathBuf,
    },
    /// Read a partition into a file
    Read {
        /// Name of the partition to read
        partition: String,
        /// Path to the output file
        output: PathBuf,
    },
    /// Flash a file to a partition
    Write {
        /// Name of the partition to write to
        partition: String,
        /// Path to the file to flash
        input: PathBuf,
        /// Allow the unverified raw-protocol path when the external tool
        /// is unavailable
        #[arg(long)]
        force: bool,
    },
    /// Erase a partition (irreversible)
    Erase {
        /// Name of the partition to erase
        partition: String,
        /// Required: erase is destructive
        #[arg(long)]
        force: bool,
    },
    /// Reboot the device out of download mode
    Reboot,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => ClientConfig::load_from_file(path)?,
        None => ClientConfig::default(),
    };
    if args.tool_path.is_some() {
        config.tool_path = args.tool_path.clone();
    }

    let mut client = OdinClient::discover(&config)?;
    client.connect()?;

    let result = dispatch(&mut client, &args.command);
    client.disconnect();
    result
}

fn dispatch(client: &mut OdinClient<NusbTransport, TracingObserver>, command: &Command) -> Result<()> {
    match command {
        Command::Detect => {
            println!("device found and session established");
        }
        Command::Partitions { pit } => {
            let layout = client.detect_partition_layout(pit.as_deref());
            for (name, part) in layout {
                let size = part
                    .length
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "-".into());
                let id = part
                    .id
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "-".into());
                println!("{name:<20} size={size:<12} id={id}");
            }
        }
        Command::DownloadPit { output } => {
            client.download_pit(output)?;
            println!("PIT written to {}", output.display());
        }
        Command::Read { partition, output } => {
            let bytes = client.read_partition(partition, output)?;
            println!("read {bytes} bytes into {}", output.display());
        }
        Command::Write {
            partition,
            input,
            force,
        } => {
            let bytes = client.write_partition(partition, input, *force)?;
            println!("wrote {bytes} bytes to {partition}");
        }
        Command::Erase { partition, force } => {
            client.erase_partition(partition, *force)?;
            println!("erased {partition}");
        }
        Command::Reboot => {
            client.reboot_device()?;
            println!("reboot requested");
        }
    }
    Ok(())
}
