//! archivist - versioned artifact archiver command line interface

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{debug, info};

use archivist::{
    Archiver, BackendConfig, CompressionMode, Config, Generation, ResourceKey, VersionStore,
};

#[derive(Parser)]
#[command(name = "archivist")]
#[command(about = "versioned artifact archiver over a generation-addressed blob store")]
#[command(version)]
struct Cli {
    /// config file path
    #[arg(short, long, env = "ARCHIVIST_CONFIG", default_value = "archivist.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// write a new config file
    InitConfig {
        /// local root for materialized versions
        #[arg(long)]
        archive_dir: PathBuf,

        /// bucket holding the archives
        #[arg(long)]
        bucket: String,

        /// leading path for every blob
        #[arg(long)]
        prefix: Option<String>,

        /// archive compression: gzip or lz4
        #[arg(long, default_value = "gzip")]
        compression: String,

        /// use a local filesystem store rooted here instead of gcs
        #[arg(long)]
        local_root: Option<PathBuf>,

        /// gcs endpoint
        #[arg(long, default_value = archivist::store::gcs::DEFAULT_ENDPOINT)]
        endpoint: String,

        /// download to a temp file before extracting
        #[arg(long)]
        no_stream: bool,

        /// overwrite an existing config
        #[arg(short, long)]
        force: bool,
    },

    /// package a directory and upload it as a new generation
    Upload {
        service: String,
        resource: String,

        /// directory to package
        source: PathBuf,

        /// only include these files (relative to source, or absolute inside it)
        #[arg(long = "file")]
        files: Vec<PathBuf>,

        /// only include everything under these directories
        #[arg(long = "parent-dir")]
        parent_dirs: Vec<PathBuf>,
    },

    /// materialize a generation locally and make it current
    Download {
        service: String,
        resource: String,

        /// exact generation to fetch instead of the latest
        #[arg(short, long)]
        generation: Option<String>,

        /// don't take the per-resource lock
        #[arg(long)]
        no_lock: bool,
    },

    /// list resources stored for a service
    Resources {
        service: String,

        /// glob filter on resource names
        #[arg(short, long)]
        pattern: Option<String>,
    },

    /// show the generation the current pointer refers to
    Current { service: String, resource: String },

    /// list generations materialized locally
    Versions { service: String, resource: String },

    /// remove all local files of a resource
    CleanLocal { service: String, resource: String },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("error: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn open_archiver(config_path: &Path) -> archivist::Result<Archiver> {
    let config = Config::load(config_path)?;
    debug!(path = %config_path.display(), "loaded config");
    let store: Box<dyn VersionStore> = config.open_store()?;
    Ok(Archiver::with_store(store, config.archiver_options()))
}

fn run(cli: Cli) -> archivist::Result<()> {
    match cli.command {
        Commands::InitConfig {
            archive_dir,
            bucket,
            prefix,
            compression,
            local_root,
            endpoint,
            no_stream,
            force,
        } => {
            if cli.config.exists() && !force {
                return Err(archivist::Error::StaleState(cli.config));
            }
            let compression: CompressionMode = compression.parse()?;
            let backend = match local_root {
                Some(root) => BackendConfig::Local { root },
                None => BackendConfig::Gcs {
                    endpoint,
                    token_env: "GCS_OAUTH_TOKEN".to_string(),
                },
            };
            let config = Config {
                archive_dir,
                bucket,
                path_prefix: prefix,
                compression,
                download_as_stream: !no_stream,
                backend,
            };
            config.save(&cli.config)?;
            println!("wrote config to {}", cli.config.display());
        }

        Commands::Upload {
            service,
            resource,
            source,
            files,
            parent_dirs,
        } => {
            let archiver = open_archiver(&cli.config)?;
            let key = ResourceKey::new(service, resource)?;
            let generation = archiver.upload(&key, &source, &files, &parent_dirs)?;
            println!("{}", generation);
        }

        Commands::Download {
            service,
            resource,
            generation,
            no_lock,
        } => {
            let archiver = open_archiver(&cli.config)?;
            let key = ResourceKey::new(service, resource)?;
            let _lock = if no_lock {
                None
            } else {
                Some(archiver.lock_resource(&key)?)
            };

            let path = match generation {
                Some(g) => {
                    let generation: Generation = g.parse()?;
                    archiver.download_version(&key, generation)?
                }
                None => archiver.download(&key)?,
            };
            println!("{}", path.display());
        }

        Commands::Resources { service, pattern } => {
            let archiver = open_archiver(&cli.config)?;
            let names = match pattern {
                Some(p) => archiver.list_resources_matching(&service, &p)?,
                None => archiver.list_resources(&service)?,
            };

            for name in names {
                println!("{}", name);
            }
        }

        Commands::Current { service, resource } => {
            let archiver = open_archiver(&cli.config)?;
            let key = ResourceKey::new(service, resource)?;
            match archiver.current_version(&key)? {
                Some(version) => println!("{}", version),
                None => println!("no current version of {}", key),
            }
        }

        Commands::Versions { service, resource } => {
            let archiver = open_archiver(&cli.config)?;
            let key = ResourceKey::new(service, resource)?;
            let current = archiver.current_version(&key)?;

            for version in archiver.local_versions(&key)? {
                let marker = if current.as_deref() == Some(version.as_str()) {
                    "*"
                } else {
                    " "
                };
                println!("{} {}", marker, version);
            }
        }

        Commands::CleanLocal { service, resource } => {
            let archiver = open_archiver(&cli.config)?;
            let key = ResourceKey::new(service, resource)?;
            if archiver.delete_local_files(&key)? {
                info!(resource = %key, "removed local files");
                println!("removed local files of {}", key);
            } else {
                println!("nothing to remove for {}", key);
            }
        }
    }

    Ok(())
}
