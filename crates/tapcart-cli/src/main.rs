use clap::{Parser, Subcommand, ValueEnum};
use tapcart_card::RecoveryMode;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "tapcart")]
#[command(about = "Tapcart terminal toolbox - offline carts on contactless cards")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Decode a sector's three access-control bytes
    Decode {
        /// Hex-encoded access bytes, e.g. FF0780 or 787788
        bits: String,
    },
    /// Brute-force sector keys on the built-in demo card
    Recover {
        /// Candidate groups to try beyond owned keys
        #[arg(long, value_enum, default_value_t = ModeArg::MostLikely)]
        mode: ModeArg,
        /// Owned keys (12 hex digits), tried first; repeatable
        #[arg(long = "key")]
        keys: Vec<String>,
    },
    /// Exercise the cart storage protocol on the demo card
    Cart {
        /// Show the legacy 3-byte price-naive format instead
        #[arg(long)]
        legacy: bool,
    },
    /// Run the demo processing queue: payments plus card operations
    Queue,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    None,
    MostLikely,
    Full,
}

impl std::fmt::Display for ModeArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModeArg::None => "none",
            ModeArg::MostLikely => "most-likely",
            ModeArg::Full => "full",
        };
        f.write_str(name)
    }
}

impl From<ModeArg> for RecoveryMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::None => RecoveryMode::None,
            ModeArg::MostLikely => RecoveryMode::MostLikely,
            ModeArg::Full => RecoveryMode::Full,
        }
    }
}

#[tokio::main]
async fn main() {
    // RUST_LOG=debug for detailed logs; default: info.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let result = match args.command {
        Command::Decode { bits } => commands::decode::run(&bits),
        Command::Recover { mode, keys } => commands::recover::run(mode.into(), &keys).await,
        Command::Cart { legacy } => commands::cart::run(legacy).await,
        Command::Queue => commands::queue::run().await,
    };

    if let Err(err) = result {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
