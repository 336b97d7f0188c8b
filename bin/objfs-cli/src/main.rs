//! objfs CLI - Admin Command Line Interface
//!
//! Formats and inspects objfs images, and moves objects in and out of them.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use objfs_common::Config;
use objfs_storage::{BLOCK_SIZE, FileDevice, MAX_OBJECT_SIZE, ObjectStore};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "objfs-cli")]
#[command(about = "objfs Admin CLI")]
#[command(version)]
struct Args {
    /// Image file or block device
    #[arg(short, long, env = "OBJFS_IMAGE")]
    image: PathBuf,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create an empty store
    Format {
        /// Image size in blocks (ignored for block devices)
        #[arg(short, long, default_value_t = 65_536)]
        blocks: u64,
    },
    /// Copy a local file into an object
    Put {
        /// Object key
        key: String,
        /// Local file to read
        file: PathBuf,
    },
    /// Copy an object out to a file or stdout
    ///
    /// The length copied is the object's recorded size, which counts every
    /// byte ever written to it. An object whose blocks were rewritten comes
    /// out padded with trailing zeros.
    Get {
        /// Object key
        key: String,
        /// Output file (stdout if omitted)
        output: Option<PathBuf>,
    },
    /// List objects
    Ls,
    /// Show object attributes
    Stat {
        /// Object key
        key: String,
    },
    /// Rename an object
    Mv {
        /// Current key
        from: String,
        /// New key
        to: String,
    },
    /// Delete an object
    Rm {
        /// Object key
        key: String,
    },
    /// Show allocation and layout summary
    Info,
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: Config = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse config {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn mount(image: &Path, config: &Config, read_only: bool) -> Result<ObjectStore<FileDevice>> {
    let device = FileDevice::open(image, read_only)?;
    let store = ObjectStore::mount(device, config)
        .with_context(|| format!("failed to mount {}", image.display()))?;
    Ok(store)
}

fn put(store: &ObjectStore<FileDevice>, key: &str, file: &Path) -> Result<()> {
    let data =
        std::fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
    if data.len() as u64 > MAX_OBJECT_SIZE {
        bail!(
            "{} is {} bytes, objects hold at most {MAX_OBJECT_SIZE}",
            file.display(),
            data.len()
        );
    }

    let id = store.create_unique(key)?;
    for (i, chunk) in data.chunks(BLOCK_SIZE).enumerate() {
        store.write(id, chunk, (i * BLOCK_SIZE) as u64)?;
    }
    info!(key, object_id = %id, bytes = data.len(), "stored object");
    Ok(())
}

fn get(store: &ObjectStore<FileDevice>, key: &str, output: Option<&Path>) -> Result<()> {
    let id = store.find(key)?;
    let size = store.stat(id)?.size.min(MAX_OBJECT_SIZE);
    let mut data = vec![0u8; usize::try_from(size)?];
    let n = store.read(id, &mut data, 0)?;
    data.truncate(n);

    match output {
        Some(path) => std::fs::write(path, &data)
            .with_context(|| format!("failed to write {}", path.display()))?,
        None => std::io::stdout().lock().write_all(&data)?,
    }
    Ok(())
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(args.config.as_deref())?;

    match args.command {
        Commands::Format { blocks } => {
            let device = FileDevice::create(&args.image, blocks)?;
            let store = ObjectStore::format(device, &config)?;
            let layout = store.layout().clone();
            store.unmount()?;
            println!("Formatted {}", args.image.display());
            println!("Blocks:      {}", layout.device_blocks);
            println!("Data blocks: {}", layout.data_blocks());
            println!("Objects:     {}", layout.object_capacity);
        }
        Commands::Put { key, file } => {
            let store = mount(&args.image, &config, false)?;
            put(&store, &key, &file)?;
            store.unmount()?;
        }
        Commands::Get { key, output } => {
            let store = mount(&args.image, &config, true)?;
            get(&store, &key, output.as_deref())?;
        }
        Commands::Ls => {
            let store = mount(&args.image, &config, true)?;
            let objects = store.list();
            println!("{:<8} {:<32} {:>12}", "ID", "KEY", "SIZE");
            for (id, key) in &objects {
                println!("{:<8} {:<32} {:>12}", id, key, store.stat(*id)?.size);
            }
            println!("{} object(s)", objects.len());
        }
        Commands::Stat { key } => {
            let store = mount(&args.image, &config, true)?;
            let stat = store.stat(store.find(&key)?)?;
            println!("{}", serde_json::to_string_pretty(&stat)?);
        }
        Commands::Mv { from, to } => {
            let store = mount(&args.image, &config, false)?;
            store.rename(&from, &to)?;
            store.unmount()?;
        }
        Commands::Rm { key } => {
            let store = mount(&args.image, &config, false)?;
            store.destroy(&key)?;
            store.unmount()?;
        }
        Commands::Info => {
            let store = mount(&args.image, &config, true)?;
            let layout = store.layout();
            let stats = store.stats().allocator;
            println!("Image: {}", args.image.display());
            println!("==========");
            println!("Block size:    {BLOCK_SIZE}");
            println!("Device blocks: {}", layout.device_blocks);
            println!("Data starts:   {}", layout.data_start());
            println!(
                "Blocks used:   {} / {}",
                stats.blocks_used, stats.blocks_total
            );
            println!(
                "Objects:       {} / {}",
                stats.objects_used, stats.objects_total
            );
        }
    }

    Ok(())
}
