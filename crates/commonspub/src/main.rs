use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use commonspub_core::api::{MediaWikiClient, MediaWikiClientConfig};
use commonspub_core::cache::{CacheStore, LookupCache, open_cache_store};
use commonspub_core::config::{PublishConfig, load_config};
use commonspub_core::executor::ExecutionContext;
use commonspub_core::model::{ActionId, PublishPlan};
use commonspub_core::resolver::Resolver;
use commonspub_core::scheduler::PublishScheduler;
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "commonspub",
    version,
    about = "Publish orchestrator for Wikimedia Commons and Wikidata"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH", help = "Config file (default: ./commonspub.toml)")]
    config: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH", help = "State directory (default: ./.commonspub)")]
    state_dir: Option<PathBuf>,
    #[arg(long, global = true, help = "Emit JSON instead of text")]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Load a publish plan and show the derived queue")]
    Plan(PlanArgs),
    #[command(about = "Run every ready action in the plan to completion")]
    Publish(PlanArgs),
    #[command(name = "publish-one", about = "Run a single ready action")]
    PublishOne(PublishOneArgs),
    #[command(about = "Dry-run category resolution for a performer entity")]
    Resolve(ResolveArgs),
    #[command(subcommand, about = "Inspect or reset the lookup cache")]
    Cache(CacheCommands),
}

#[derive(Debug, Args)]
struct PlanArgs {
    #[arg(value_name = "PLAN", help = "Publish plan JSON file")]
    plan: PathBuf,
}

#[derive(Debug, Args)]
struct PublishOneArgs {
    #[arg(value_name = "PLAN")]
    plan: PathBuf,
    #[arg(value_name = "ID", help = "Action id to publish")]
    id: String,
}

#[derive(Debug, Args)]
struct ResolveArgs {
    #[arg(value_name = "QID", help = "Wikidata entity id, e.g. Q42")]
    qid: String,
    #[arg(value_name = "NAME", help = "Performer display name")]
    name: String,
}

#[derive(Debug, Subcommand)]
enum CacheCommands {
    Stats,
    Clear,
}

struct Runtime {
    config: PublishConfig,
    cache: LookupCache,
    store: CacheStore,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut runtime = open_runtime(&cli)?;

    match &cli.command {
        Commands::Plan(args) => cmd_plan(args, cli.json),
        Commands::Publish(args) => cmd_publish(args, &mut runtime, cli.json),
        Commands::PublishOne(args) => cmd_publish_one(args, &mut runtime, cli.json),
        Commands::Resolve(args) => cmd_resolve(args, &mut runtime, cli.json),
        Commands::Cache(command) => cmd_cache(command, &mut runtime, cli.json),
    }
}

fn open_runtime(cli: &Cli) -> Result<Runtime> {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("commonspub.toml"));
    let config = load_config(&config_path)?;

    let state_dir = cli
        .state_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(".commonspub"));
    let store = open_cache_store(&state_dir.join("cache.db"))?;

    let mut cache = LookupCache::new(std::time::Duration::from_secs(config.cache_ttl_secs()));
    cache
        .load(&store)
        .context("failed to load the cache snapshot")?;

    Ok(Runtime {
        config,
        cache,
        store,
    })
}

fn build_clients(config: &PublishConfig) -> Result<(MediaWikiClient, MediaWikiClient)> {
    let mut commons = MediaWikiClient::new(MediaWikiClientConfig::for_commons(config))?;
    let mut wikidata = MediaWikiClient::new(MediaWikiClientConfig::for_wikidata(config))?;

    let username = env::var("COMMONSPUB_BOT_USER")
        .map_err(|_| anyhow::anyhow!("COMMONSPUB_BOT_USER is required for publish"))?;
    let password = env::var("COMMONSPUB_BOT_PASS")
        .map_err(|_| anyhow::anyhow!("COMMONSPUB_BOT_PASS is required for publish"))?;
    commons
        .login(username.trim(), password.trim())
        .context("Commons login failed")?;
    wikidata
        .login(username.trim(), password.trim())
        .context("Wikidata login failed")?;
    Ok((commons, wikidata))
}

fn cmd_plan(args: &PlanArgs, json: bool) -> Result<()> {
    let plan = PublishPlan::load(&args.plan)?;
    let scheduler = PublishScheduler::new(plan)?;
    if json {
        println!("{}", serde_json::to_string_pretty(scheduler.actions())?);
        return Ok(());
    }
    for record in scheduler.actions() {
        let status = serde_json::to_value(record.status)?;
        let dependency = record
            .depends_on
            .as_ref()
            .map(|id| format!(" (after {id})"))
            .unwrap_or_default();
        println!(
            "{:<24} {}{}",
            record.id,
            status.as_str().unwrap_or("unknown"),
            dependency
        );
    }
    Ok(())
}

fn cmd_publish(args: &PlanArgs, runtime: &mut Runtime, json: bool) -> Result<()> {
    let plan = PublishPlan::load(&args.plan)?;
    let mut scheduler = PublishScheduler::new(plan)?;
    let (mut commons, mut wikidata) = build_clients(&runtime.config)?;

    let report = {
        let mut ctx = ExecutionContext {
            commons: &mut commons,
            wikidata: &mut wikidata,
            cache: &mut runtime.cache,
            unlinked_policy: runtime.config.unlinked_category_policy(),
        };
        scheduler.publish_all(&mut ctx)?
    };
    runtime.cache.persist_best_effort(&runtime.store);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for outcome in &report.results {
            match &outcome.error {
                Some(error) => println!("{:<24} error: {error}", outcome.id),
                None => println!(
                    "{:<24} {}",
                    outcome.id,
                    outcome.detail.as_deref().unwrap_or("completed")
                ),
            }
        }
        println!(
            "published {} / failed {} / blocked {}",
            report.published, report.failed, report.blocked
        );
    }
    if !report.success {
        bail!("publish finished with failures");
    }
    Ok(())
}

fn cmd_publish_one(args: &PublishOneArgs, runtime: &mut Runtime, json: bool) -> Result<()> {
    let plan = PublishPlan::load(&args.plan)?;
    let mut scheduler = PublishScheduler::new(plan)?;
    let (mut commons, mut wikidata) = build_clients(&runtime.config)?;

    let outcome = {
        let mut ctx = ExecutionContext {
            commons: &mut commons,
            wikidata: &mut wikidata,
            cache: &mut runtime.cache,
            unlinked_policy: runtime.config.unlinked_category_policy(),
        };
        scheduler.publish_one(&ActionId::new(args.id.clone()), &mut ctx)?
    };
    runtime.cache.persist_best_effort(&runtime.store);

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        match &outcome.error {
            Some(error) => println!("{} error: {error}", outcome.id),
            None => println!(
                "{} {}",
                outcome.id,
                outcome.detail.as_deref().unwrap_or("completed")
            ),
        }
    }
    if outcome.error.is_some() {
        bail!("action {} failed", outcome.id);
    }
    Ok(())
}

fn cmd_resolve(args: &ResolveArgs, runtime: &mut Runtime, json: bool) -> Result<()> {
    let mut commons = MediaWikiClient::new(MediaWikiClientConfig::for_commons(&runtime.config))?;
    let mut wikidata = MediaWikiClient::new(MediaWikiClientConfig::for_wikidata(&runtime.config))?;

    let info = {
        let mut resolver = Resolver::new(
            &mut commons,
            &mut wikidata,
            &mut runtime.cache,
            runtime.config.unlinked_category_policy(),
        );
        resolver.resolve_performer_category(&args.qid, &args.name)?
    };
    runtime.cache.persist_best_effort(&runtime.store);

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!(
            "{} -> Category:{} (source {:?}, needs creation: {})",
            args.qid, info.commons_category, info.source, info.needs_creation
        );
    }
    Ok(())
}

fn cmd_cache(command: &CacheCommands, runtime: &mut Runtime, json: bool) -> Result<()> {
    match command {
        CacheCommands::Stats => {
            let stats = runtime.cache.stats();
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("entries: {}", stats.total_entries);
                for (kind, count) in &stats.by_kind {
                    println!("  {kind}: {count}");
                }
            }
        }
        CacheCommands::Clear => {
            runtime.cache.clear();
            runtime.cache.persist_best_effort(&runtime.store);
            if json {
                println!("{}", json!({"cleared": true}));
            } else {
                println!("cache cleared");
            }
        }
    }
    Ok(())
}
