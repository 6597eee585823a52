use clap::Parser;
use gust::{Receiver, ReceiverOptions};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "gust")]
#[command(about = "Warp-speed multi-connection file transfer receiver")]
struct Cli {
    /// First port to listen on; workers take consecutive ports from here
    #[arg(short = 'p', long, default_value_t = 22356)]
    start_port: u16,

    /// Number of listening ports (one worker thread per port)
    #[arg(short = 'n', long, default_value_t = 8)]
    num_ports: usize,

    /// Destination directory for received files
    #[arg(short, long, default_value = ".")]
    directory: PathBuf,

    /// Configuration file path
    #[arg(short, long, default_value = "gust.toml")]
    config: PathBuf,

    /// Accept a single transfer session, print the report and exit
    #[arg(long)]
    once: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Info level by default; RUST_LOG overrides.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .init();

    let cli = Cli::parse();
    let options = ReceiverOptions::load_or_create(&cli.config)?;

    std::fs::create_dir_all(&cli.directory)?;
    let mut receiver = Receiver::new(cli.start_port, cli.num_ports, options);
    receiver.set_dir(cli.directory.clone());

    info!(
        start_port = cli.start_port,
        ports = cli.num_ports,
        dir = %cli.directory.display(),
        "gust receiver starting"
    );

    if cli.once {
        receiver.transfer_async()?;
        let report = receiver.finish();
        println!("{}", report);
    } else {
        receiver.run_forever()?;
    }
    Ok(())
}
