mod cli;

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{CacheCommands, Cli, Commands, JobCommands, LibraryCommands};
use rk_core::config::Config;
use rk_core::{ItemId, JobKind, JobTarget, LibraryId, MatchStatus, SortKey};
use rk_db::models::ItemFilter;
use metrics_exporter_prometheus::PrometheusBuilder;
use rk_engine::{Engine, JobPayload};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG if set, otherwise pick defaults from the verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "reelkeep=debug,rk_engine=debug,rk_cache=debug,rk_db=debug".to_string()
        } else {
            "reelkeep=info,rk_engine=info,rk_cache=info,rk_db=warn".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.as_deref();
    let config = Config::load_or_default(config_path);

    match cli.command {
        Commands::Validate => validate_config(config_path, &config),
        Commands::Version => {
            println!("reelkeep {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        command => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(dispatch(command, config))
        }
    }
}

async fn dispatch(command: Commands, config: Config) -> Result<()> {
    let engine = Engine::builder(config)
        .build()
        .context("failed to initialize engine")?;

    match command {
        Commands::Run {
            until_idle,
            metrics_addr,
        } => run(&engine, until_idle, metrics_addr).await,
        Commands::Library { command } => match command {
            LibraryCommands::Add { name, path } => {
                let library = engine
                    .create_library(&name, &path.to_string_lossy())
                    .await?;
                println!("Created library {} ({})", library.id, library.name);
                Ok(())
            }
            LibraryCommands::List => {
                for library in engine.list_libraries().await? {
                    println!("{:>4}  {:<24} {}", library.id, library.name, library.root_path);
                }
                Ok(())
            }
        },
        Commands::Scan { library } => scan(&engine, library).await,
        Commands::Ls {
            library,
            offset,
            limit,
            sort,
            status,
            title,
            json,
        } => {
            let filter = ItemFilter {
                match_status: status,
                title_contains: title,
            };
            list_items(&engine, library, &filter, sort, offset, limit, json).await
        }
        Commands::Count { library, status } => {
            let filter = ItemFilter {
                match_status: status,
                ..Default::default()
            };
            println!("{}", engine.count(library, &filter).await?);
            Ok(())
        }
        Commands::Show { item } => {
            let detail = serde_json::json!({
                "item": engine.get_item(item).await?,
                "credits": engine.credits(item).await?,
                "artwork": engine.artwork(item).await?,
                "subtitles": engine.subtitles(item).await?,
                "history": engine.history(item).await?,
            });
            println!("{}", serde_json::to_string_pretty(&detail)?);
            Ok(())
        }
        Commands::Remove { item } => {
            engine.remove_item(item).await?;
            println!("Removed item {item}");
            Ok(())
        }
        Commands::Job { command } => match command {
            JobCommands::Submit {
                kind,
                target,
                provider,
                refresh,
                language,
                detach,
            } => {
                let mut payload = JobPayload::default();
                if let Some(provider) = provider {
                    payload = payload.with_provider(provider);
                }
                if refresh {
                    payload = payload.refreshed();
                }
                if let Some(language) = language {
                    payload = payload.with_language(language);
                }
                submit(&engine, kind, job_target(kind, target), payload, detach).await
            }
            JobCommands::Cancel { id } => {
                if engine.cancel(id).await? {
                    println!("Cancelled job {id}");
                } else {
                    println!("Job {id} is {}; nothing to cancel", engine.status(id)?);
                }
                Ok(())
            }
            JobCommands::Status { id } => {
                let job = engine.job(id)?;
                println!("{}", serde_json::to_string_pretty(&job)?);
                Ok(())
            }
            JobCommands::Gc => {
                println!("Removed {} finished jobs", engine.collect_jobs()?);
                Ok(())
            }
        },
        Commands::Cache { command } => match command {
            CacheCommands::Sweep => {
                println!("Removed {} expired cache entries", engine.sweep_cache().await?);
                Ok(())
            }
        },
        Commands::Stats { json } => stats(&engine, json).await,
        Commands::Validate | Commands::Version => Ok(()),
    }
}

async fn run(engine: &Engine, until_idle: bool, metrics_addr: Option<SocketAddr>) -> Result<()> {
    if let Some(addr) = metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to start metrics listener")?;
        tracing::info!(%addr, "Serving Prometheus metrics");
    }

    let recovered = engine.start()?;
    tracing::info!(recovered, workers = engine.pool_size(), "Worker pool running");

    if until_idle {
        engine.wait_idle().await;
    } else {
        tokio::signal::ctrl_c().await?;
    }

    tracing::info!("Shutting down...");
    engine.shutdown().await;
    Ok(())
}

async fn scan(engine: &Engine, library: LibraryId) -> Result<()> {
    engine.start()?;
    let id = engine.submit(JobKind::Scan, library, JobPayload::default())?;
    engine.wait_idle().await;

    let job = engine.job(id)?;
    match (&job.result, &job.error) {
        (Some(result), _) => {
            println!(
                "Found {} files, added {} items",
                result["files_found"], result["items_added"]
            );
        }
        (None, Some(error)) => println!("Scan {}: {error}", job.status),
        (None, None) => println!("Scan {}", job.status),
    }

    engine.shutdown().await;
    Ok(())
}

fn job_target(kind: JobKind, id: i64) -> JobTarget {
    match kind {
        JobKind::Scan => LibraryId::from(id).into(),
        _ => ItemId::from(id).into(),
    }
}

async fn submit(
    engine: &Engine,
    kind: JobKind,
    target: JobTarget,
    payload: JobPayload,
    detach: bool,
) -> Result<()> {
    let id = engine.submit(kind, target, payload)?;
    if detach {
        println!("Queued job {id}");
        return Ok(());
    }

    engine.start()?;
    engine.wait_idle().await;
    let job = engine.job(id)?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    engine.shutdown().await;
    Ok(())
}

async fn list_items(
    engine: &Engine,
    library: LibraryId,
    filter: &ItemFilter,
    sort: SortKey,
    offset: usize,
    limit: usize,
    json: bool,
) -> Result<()> {
    let items = engine
        .window_filtered(library, filter, sort, offset, limit)
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    for item in &items {
        let year = item.year.map(|y| y.to_string()).unwrap_or_default();
        let mark = match item.match_status {
            MatchStatus::Matched => '*',
            MatchStatus::Unmatched => ' ',
        };
        println!("{:>6} {mark} {:<4}  {}", item.id, year, item.title);
    }
    let total = engine.count(library, filter).await?;
    println!(
        "\n{}-{} of {total}",
        offset + usize::from(!items.is_empty()),
        offset + items.len()
    );
    Ok(())
}

async fn stats(engine: &Engine, json: bool) -> Result<()> {
    let stats = engine.stats().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Cache backend: {}", stats.cache_backend);
    println!("Workers: {}", stats.pool_size);
    println!("Libraries: {}", stats.libraries);
    println!("\nJobs:");
    for (status, count) in &stats.jobs {
        println!("  {:<10} {count}", status.as_str());
    }

    let m = &stats.metrics;
    println!("\nProvider calls: {} ({} failed)", m.provider_calls, m.provider_failures);
    match m.cache_hit_ratio() {
        Some(ratio) => println!("Cache hit ratio: {:.1}%", ratio * 100.0),
        None => println!("Cache hit ratio: n/a"),
    }
    for latency in &m.latency {
        println!(
            "  {:<16} n={:<6} mean={:?} max={}us",
            latency.op,
            latency.count,
            latency.mean(),
            latency.max_us
        );
    }
    Ok(())
}

fn validate_config(path: Option<&Path>, config: &Config) -> Result<()> {
    match path {
        Some(p) => println!("Validating config: {}", p.display()),
        None => println!("No config file specified, using defaults"),
    }

    let warnings = config.validate();
    if warnings.is_empty() {
        println!("Configuration is valid");
    } else {
        for warning in &warnings {
            println!("  warning: {warning}");
        }
    }
    println!("  Database: {}", config.database.path.display());
    println!("  Cache backend: {:?}", config.cache.backend);
    println!("  Workers: {}", config.workers.pool_size(num_cpus::get()));
    println!("  Page size: {}", config.view.page_size);
    Ok(())
}
