use clap::Parser;
use colored::Colorize;
use ocibuild::{
    cache::CacheStore,
    error::Result,
    instruction::{BackendKind, BuilderConfig, Instruction, OutputKind},
    manifest, BuildConfig, BuildEngine, ImageName, Platform,
};
use std::{collections::HashMap, fs, path::PathBuf, time::Duration};

#[derive(Debug, Parser)]
#[command(version)]
enum Opt {
    /// Build an image from a parsed recipe
    Build {
        /// JSON file holding the parsed instruction list
        recipe: PathBuf,

        /// Build context directory
        #[arg(short = 'c', long = "context", default_value = ".")]
        context: PathBuf,

        /// Output directory for the OCI layout; must not exist
        #[arg(short = 'o', long = "output", default_value = "./image")]
        output: PathBuf,

        /// Image references to record, e.g. ghcr.io/acme/app:1.0
        #[arg(short = 't', long = "tag")]
        tags: Vec<String>,

        /// Target platforms as os/arch[/variant]; defaults to the host
        #[arg(short = 'p', long = "platform")]
        platforms: Vec<String>,

        /// Build arguments as NAME=value
        #[arg(long = "build-arg")]
        build_args: Vec<String>,

        /// Skip cache lookups (results are still stored)
        #[arg(long = "no-cache")]
        no_cache: bool,

        /// Force the rootless backend even when a runtime is installed
        #[arg(long = "rootless")]
        rootless: bool,

        /// Also pack the layout into an oci-archive tar at this path
        #[arg(long = "archive")]
        archive: Option<PathBuf>,

        /// Builder settings file (ocibuild.toml)
        #[arg(long = "config")]
        config: Option<PathBuf>,

        /// Per-build timeout in seconds
        #[arg(long = "timeout", default_value_t = 1800)]
        timeout: u64,
    },

    /// Inspect or maintain the layer cache
    #[command(subcommand)]
    Cache(CacheOpt),
}

#[derive(Debug, clap::Subcommand)]
enum CacheOpt {
    /// Show cache size and hit/miss counters
    Info {
        #[arg(long = "cache-dir")]
        cache_dir: Option<PathBuf>,
    },
    /// Evict old entries until the age and size bounds hold
    Prune {
        #[arg(long = "cache-dir")]
        cache_dir: Option<PathBuf>,

        /// Maximum entry age in days
        #[arg(long = "max-age", default_value_t = 30)]
        max_age_days: u64,

        /// Maximum total size in MiB
        #[arg(long = "max-size", default_value_t = 10 * 1024)]
        max_size_mib: u64,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    match Opt::parse() {
        Opt::Build {
            recipe,
            context,
            output,
            tags,
            platforms,
            build_args,
            no_cache,
            rootless,
            archive,
            config,
            timeout,
        } => {
            let instructions: Vec<Instruction> = serde_json::from_slice(&fs::read(&recipe)?)?;
            let settings = match config {
                Some(path) => BuilderConfig::load(&path)?,
                None => BuilderConfig::default(),
            };

            let mut build = BuildConfig::new(fs::canonicalize(&context)?, &output);
            for tag in &tags {
                build.tags.push(ImageName::parse(tag)?);
            }
            if !platforms.is_empty() {
                build.platforms = platforms
                    .iter()
                    .map(|p| Platform::parse(p))
                    .collect::<Result<_>>()?;
            } else if !settings.platforms.is_empty() {
                build.platforms = settings
                    .platforms
                    .iter()
                    .map(|p| Platform::parse(p))
                    .collect::<Result<_>>()?;
            }
            build.output = if build.platforms.len() > 1 {
                OutputKind::Multiarch
            } else {
                OutputKind::Image
            };
            build.build_args = parse_build_args(&build_args);
            build.no_cache = no_cache;
            if rootless {
                build.backend = BackendKind::Rootless;
            } else {
                build.backend = BackendKind::Auto;
            }
            build.cache_dir = settings.cache_dir;
            build.resource_limits = settings.resource_limits;
            build.timeout = Duration::from_secs(timeout);

            let engine = BuildEngine::new(build)?;
            let result = engine.build(&instructions)?;
            for outcome in &result.platforms {
                let status = if outcome.success {
                    "ok".green()
                } else {
                    "failed".red()
                };
                println!(
                    "{:>12} {} ({} ops, {} cached){}",
                    status,
                    outcome.platform,
                    outcome.operations,
                    outcome.cache_hits,
                    outcome
                        .error
                        .as_deref()
                        .map(|e| format!(": {e}"))
                        .unwrap_or_default(),
                );
            }
            if let Some(digest) = &result.image_digest {
                println!("{:>12} {}", "digest".bold(), digest);
            }
            println!(
                "{:>12} {} in {:.1}s",
                if result.success {
                    "finished".green().bold()
                } else {
                    "failed".red().bold()
                },
                result.layout.display(),
                result.duration.as_secs_f64(),
            );
            if let Some(archive) = archive {
                manifest::pack_archive(&result.layout, &archive)?;
                println!("{:>12} {}", "archive".bold(), archive.display());
            }
            if !result.success {
                std::process::exit(1);
            }
        }

        Opt::Cache(CacheOpt::Info { cache_dir }) => {
            let store = CacheStore::open(resolve_cache_dir(cache_dir)?)?;
            let info = store.info()?;
            println!("size:     {} bytes", info.total_size);
            println!("files:    {}", info.total_files);
            println!("hits:     {}", info.hits);
            println!("misses:   {}", info.misses);
            println!("hit rate: {:.1}%", info.hit_rate * 100.0);
        }

        Opt::Cache(CacheOpt::Prune {
            cache_dir,
            max_age_days,
            max_size_mib,
        }) => {
            let store = CacheStore::open(resolve_cache_dir(cache_dir)?)?;
            let report = store.prune(
                Duration::from_secs(max_age_days * 24 * 3600),
                max_size_mib * 1024 * 1024,
            )?;
            println!(
                "freed {} bytes in {} files",
                report.freed_bytes, report.freed_files
            );
        }
    }
    Ok(())
}

fn parse_build_args(args: &[String]) -> HashMap<String, String> {
    args.iter()
        .filter_map(|arg| arg.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn resolve_cache_dir(cache_dir: Option<PathBuf>) -> Result<PathBuf> {
    match cache_dir {
        Some(dir) => Ok(dir),
        None => directories::ProjectDirs::from("", "ocibuild", "ocibuild")
            .map(|d| d.cache_dir().to_owned())
            .ok_or(ocibuild::error::Error::NoValidHomeDirectory),
    }
}
