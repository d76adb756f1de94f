//! Harp persistent compilation cache CLI

use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;

use harp_compile_cache::cache::{CacheKeyDeriver, DiskStore, KeyScheme, default_cache_dir};
use harp_compile_cache::config::CompilerConfig;
use harp_compile_cache::device::{Device, DeviceId, Platform};
use harp_compile_cache::module::TextModule;
use harp_compile_cache::options::{
    CompileOptionsBuilder, CompileOptionsRequest, DeviceAssignmentInput,
};
use ndarray::{ArrayD, IxDyn};

#[derive(Parser)]
#[command(name = "harp-cache")]
#[command(about = "Inspect and manage the persistent compilation cache")]
#[command(version)]
struct Cli {
    /// Cache directory (default: $HARP_COMPILATION_CACHE_DIR or the user cache dir)
    #[arg(long, global = true, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the cache location and totals
    Info,

    /// List cached entries, oldest first
    List,

    /// Remove every cached entry
    Clear,

    /// Print the cache key of a module
    Key {
        /// Module text file
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Target platform (tpu, gpu, cpu, ...)
        #[arg(short, long, default_value = "gpu")]
        platform: String,

        /// Backend version string
        #[arg(long, default_value = "")]
        platform_version: String,

        /// Device kind reported for every device
        #[arg(long, default_value = "default")]
        device_kind: String,

        #[arg(long, default_value_t = 1)]
        replicas: usize,

        #[arg(long, default_value_t = 1)]
        partitions: usize,

        /// Use the original key derivation scheme
        #[arg(long)]
        original_scheme: bool,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn open_store(cache_dir: Option<PathBuf>) -> Result<DiskStore, Box<dyn std::error::Error>> {
    let root = cache_dir
        .or_else(default_cache_dir)
        .ok_or("could not determine a cache directory; pass --cache-dir")?;
    log::debug!("Using cache directory {}", root.display());
    Ok(DiskStore::open(root)?)
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Info => {
            let store = open_store(cli.cache_dir)?;
            let entries = store.entries()?;
            println!("directory: {}", store.root().display());
            println!("entries:   {}", entries.len());
            println!("size:      {} bytes", store.total_size()?);
            Ok(())
        }

        Commands::List => {
            let store = open_store(cli.cache_dir)?;
            for entry in store.entries()? {
                let meta = &entry.metadata;
                println!(
                    "{}\t{}\t{}s\t{} bytes",
                    entry.key, meta.module_name, meta.compile_time_secs, meta.size
                );
            }
            Ok(())
        }

        Commands::Clear => {
            let store = open_store(cli.cache_dir)?;
            let removed = store.clear()?;
            eprintln!("Removed {} entries from {}", removed, store.root().display());
            Ok(())
        }

        Commands::Key {
            input,
            platform,
            platform_version,
            device_kind,
            replicas,
            partitions,
            original_scheme,
        } => {
            let text = fs::read_to_string(&input)?;
            let fallback = input
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("module");
            let module = TextModule::parse(text, fallback);

            let platform = Platform::from(platform.as_str());
            let count = replicas
                .checked_mul(partitions)
                .ok_or("replicas * partitions overflows")?;
            let devices: Vec<Device> = (0..count)
                .map(|i| Device::new(i as DeviceId, platform.clone(), device_kind.as_str()))
                .collect();
            let devices = ArrayD::from_shape_vec(IxDyn(&[count]), devices)?;

            let rows: Vec<Vec<DeviceId>> = (0..replicas)
                .map(|r| (0..partitions).map(|p| (r * partitions + p) as DeviceId).collect())
                .collect();
            let request = CompileOptionsRequest::builder()
                .num_replicas(replicas)
                .num_partitions(partitions)
                .device_assignment(DeviceAssignmentInput::from_rows(&rows)?)
                .build();
            let config = CompilerConfig::from_env()?;
            let options = CompileOptionsBuilder::new(&config).build(request)?;

            let key = CacheKeyDeriver::new(KeyScheme::from_flag(original_scheme)).derive(
                &module,
                &devices,
                &options,
                platform.name(),
                &platform_version,
            );
            println!("{}", key);
            Ok(())
        }
    }
}
