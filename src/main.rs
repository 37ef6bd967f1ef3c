//! Binary entrypoint for the binlink container tool.
//!
//! Commands:
//! - `init` - write a starter `config.toml`
//! - `pack -o <out.binpack> <file:address[:region]>...` - build a binpack container
//! - `list <in.binpack>` - print a container's catalog
//! - `unpack <in.binpack> [-d <dir>]` - extract and verify every file
//!
//! Device transfers are driven through the library (`binlink::transfer`).
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::path::{Path, PathBuf};

use binlink::binpack::{self, PackOptions, PackedFile};
use binlink::config::Config;

#[derive(Parser)]
#[command(name = "binlink")]
#[command(about = "Build and inspect binpack firmware containers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init,
    /// Pack files into a binpack container
    Pack {
        /// Output container path
        #[arg(short, long)]
        output: PathBuf,
        /// Host tag for the header (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Snapshot tag for the header (overrides config)
        #[arg(long)]
        snapshot: Option<String>,
        /// Files as PATH:ADDRESS[:REGION], address/region in hex (0x...) or decimal
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Print the catalog of a container
    List { input: PathBuf },
    /// Extract every file from a container
    Unpack {
        input: PathBuf,
        /// Destination directory
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match cli.command {
        Commands::Init => None,
        _ => match Config::load(&cli.config).await {
            Ok(config) => Some(config),
            Err(e) if Path::new(&cli.config).exists() => return Err(e),
            Err(_) => None,
        },
    };
    init_logging(&config, cli.verbose);
    let config = config.unwrap_or_default();

    match cli.command {
        Commands::Init => {
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Pack {
            output,
            host,
            snapshot,
            files,
        } => {
            let mut packed = Vec::with_capacity(files.len());
            for arg in &files {
                packed.push(load_file(arg).await?);
            }
            let opts = PackOptions {
                host: host.unwrap_or(config.pack.host),
                snapshot: snapshot.unwrap_or(config.pack.snapshot),
                ..PackOptions::default()
            };
            let container = binpack::pack_with(&packed, &opts)?;
            let output = if output.extension().is_none() {
                output.with_extension(binpack::EXTENSION)
            } else {
                output
            };
            tokio::fs::write(&output, &container)
                .await
                .with_context(|| format!("writing {}", output.display()))?;
            info!(
                "Wrote {} ({} files, {} bytes)",
                output.display(),
                packed.len(),
                container.len()
            );
        }
        Commands::List { input } => {
            let bytes = tokio::fs::read(&input)
                .await
                .with_context(|| format!("reading {}", input.display()))?;
            let (catalog, _) = binpack::read_catalog(&bytes)?;
            if let Some(when) = catalog.when {
                println!("when:     {}", when.to_rfc3339());
            }
            println!("host:     {}", catalog.host);
            println!("snapshot: {}", catalog.snapshot);
            for e in &catalog.entries {
                println!(
                    "{:<24} 0x{:08x} 0x{:08x} {:>10} {:>10} {}",
                    e.name, e.address, e.region, e.raw_len, e.compressed_len, e.md5
                );
            }
        }
        Commands::Unpack { input, dir } => {
            let bytes = tokio::fs::read(&input)
                .await
                .with_context(|| format!("reading {}", input.display()))?;
            let files = binpack::unpack(&bytes)?;
            tokio::fs::create_dir_all(&dir).await?;
            for file in files {
                // Catalog names are display names; never let them escape `dir`.
                let Some(name) = Path::new(&file.name).file_name() else {
                    warn!("Skipping entry with unusable name {:?}", file.name);
                    continue;
                };
                let path = dir.join(name);
                tokio::fs::write(&path, &file.data)
                    .await
                    .with_context(|| format!("writing {}", path.display()))?;
                info!(
                    "Extracted {} (load 0x{:08x}, {} bytes)",
                    path.display(),
                    file.address,
                    file.data.len()
                );
            }
        }
    }

    Ok(())
}

/// Split `PATH:ADDRESS[:REGION]` from the right.
///
/// The path may itself contain ':'; the last field is taken as a region only
/// when the field before it is also a number.
fn split_file_arg(arg: &str) -> Result<(&str, u32, u32)> {
    let (rest, last) = arg
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("expected PATH:ADDRESS[:REGION], got {:?}", arg))?;
    let last = binpack::parse_number(last)
        .ok_or_else(|| anyhow!("bad address or region in {:?}", arg))?;
    let (path, address, region) = match rest.rsplit_once(':') {
        Some((path, address)) => match binpack::parse_number(address) {
            Some(address) => (path, address, last),
            None => (rest, last, 0),
        },
        None => (rest, last, 0),
    };
    if path.is_empty() {
        return Err(anyhow!("missing path in {:?}", arg));
    }
    Ok((path, address, region))
}

/// Parse `PATH:ADDRESS[:REGION]` and read the file.
async fn load_file(arg: &str) -> Result<PackedFile> {
    let (path, address, region) = split_file_arg(arg)?;
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path))?;
    let name = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string());
    Ok(PackedFile {
        address,
        region,
        name,
        data,
    })
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides config
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .map(|c| c.logging.level_filter())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });
    match file {
        Some(f) => {
            let sink = std::sync::Mutex::new(f);
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = sink.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                writeln!(fmt, "{}", line)
            });
        }
        None => {
            builder.format(|fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
            });
        }
    }
    let _ = builder.try_init();
}
