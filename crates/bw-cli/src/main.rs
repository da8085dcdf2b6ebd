//! Blockwarden CLI
//!
//! CLI tool for running the engine lifecycle, publishing list manifests and
//! inspecting trust decisions and filter transformations.

mod app;
mod logger;
mod publish;

use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand, ValueEnum};

use bw_core::{
    negate_filter, restrict_filter, resolve, Category, Environment, ExceptionRecord, Filter, RuleEngine, StanceReason,
};
use bw_engine::{Config, DnrConverter, SiteStance, CUSTOM_FILTERS_ENGINE, MAIN_ENGINE};

use app::App;
use publish::{publish, PublishOptions};

#[derive(Parser)]
#[command(name = "bw-cli")]
#[command(about = "Blockwarden engine lifecycle and filter tools")]
struct Cli {
    /// Debug logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load, update and compose engines
    Update {
        /// Config file (JSON)
        #[arg(short, long)]
        config: String,

        /// Engines to update (default: the enabled engines)
        #[arg(short, long)]
        engine: Vec<String>,
    },

    /// Recompose "main" only if it is older than the freshness interval
    Refresh {
        #[arg(short, long)]
        config: String,
    },

    /// Show persisted engines
    Status {
        #[arg(short, long)]
        config: String,
    },

    /// Replace the custom filters engine and recompose
    Custom {
        #[arg(short, long)]
        config: String,

        /// Filter list file; omit to remove custom filters
        #[arg(short, long)]
        input: Option<String>,
    },

    /// Resolve whether a tracker is trusted on a site
    Trust {
        #[arg(short, long)]
        site: String,

        /// Tracker category id, e.g. advertising or site_analytics
        #[arg(long)]
        category: String,

        /// Exception record file (JSON)
        #[arg(short, long, conflicts_with = "id")]
        record: Option<String>,

        /// Tracker id to look up in the persisted exceptions (requires --config)
        #[arg(long, requires = "config")]
        id: Option<String>,

        #[arg(short, long)]
        config: Option<String>,
    },

    /// Edit a persisted tracker exception
    Exception {
        #[arg(short, long)]
        config: String,

        #[arg(long)]
        id: String,

        #[arg(value_enum)]
        action: ExceptionAction,

        /// Site for the per-site actions
        #[arg(short, long)]
        site: Option<String>,
    },

    /// Restrict a filter to one or more domains
    Restrict {
        #[arg(short, long)]
        filter: String,

        #[arg(short, long, required = true)]
        domain: Vec<String>,
    },

    /// Invert a filter (block <-> allow, hide <-> unhide)
    Negate {
        #[arg(short, long)]
        filter: String,
    },

    /// Convert network filters to declarative rules
    Convert {
        /// Filter list file
        #[arg(short, long)]
        input: String,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<String>,

        #[arg(long, default_value_t = 1)]
        first_id: u32,

        /// Materialize this exception record (JSON) over the input filters
        #[arg(long, requires = "category")]
        exception: Option<String>,

        #[arg(long)]
        category: Option<String>,
    },

    /// Publish lists, diffs, snapshot and manifest for one engine
    Publish {
        /// Engine name
        #[arg(short, long)]
        name: String,

        /// Source list as NAME=PATH
        #[arg(short, long, required = true)]
        list: Vec<String>,

        #[arg(short, long)]
        resources: Option<String>,

        /// Directory of the previous publication (enables diffs)
        #[arg(short, long)]
        previous: Option<String>,

        #[arg(short, long)]
        output: String,

        /// Url the output directory is served from
        #[arg(short, long)]
        base_url: String,

        /// Config file whose environment the snapshot is compiled for
        /// (default: an empty environment, re-conditioned on load)
        #[arg(short, long)]
        config: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ExceptionAction {
    Show,
    TrustSite,
    BlockSite,
    ClearSite,
    Toggle,
    Remove,
}

fn main() {
    let cli = Cli::parse();
    logger::init(cli.verbose);

    let result = match cli.command {
        Commands::Update { config, engine } => run(cmd_update(config, engine)),
        Commands::Refresh { config } => run(cmd_refresh(config)),
        Commands::Status { config } => run(cmd_status(config)),
        Commands::Custom { config, input } => run(cmd_custom(config, input)),
        Commands::Trust {
            site,
            category,
            record,
            id,
            config,
        } => match (id, config) {
            (Some(id), Some(config)) => run(cmd_trust_persisted(site, category, id, config)),
            _ => cmd_trust(&site, &category, record.as_deref()),
        },
        Commands::Exception {
            config,
            id,
            action,
            site,
        } => run(cmd_exception(config, id, action, site)),
        Commands::Restrict { filter, domain } => cmd_restrict(&filter, &domain),
        Commands::Negate { filter } => cmd_negate(&filter),
        Commands::Convert {
            input,
            output,
            first_id,
            exception,
            category,
        } => run(cmd_convert(input, output, first_id, exception, category)),
        Commands::Publish {
            name,
            list,
            resources,
            previous,
            output,
            base_url,
            config,
        } => cmd_publish(name, &list, resources, previous, output, base_url, config),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run<F>(fut: F) -> Result<(), String>
where
    F: Future<Output = Result<(), String>>,
{
    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| format!("Failed to start tokio runtime: {}", e))?;
    runtime.block_on(fut)
}

async fn start(config: &str) -> Result<App, String> {
    let config = Config::load(Path::new(config)).await.map_err(|e| e.to_string())?;
    App::start(config).await
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn parse_category(id: &str) -> Result<Category, String> {
    id.parse::<Category>().map_err(|e| e.to_string())
}

fn parse_filter(text: &str) -> Result<Filter, String> {
    text.parse::<Filter>()
        .map_err(|e| format!("Invalid filter '{}': {}", text, e))
}

fn read_record(path: &str) -> Result<ExceptionRecord, String> {
    let text = fs::read_to_string(path).map_err(|e| format!("Failed to read '{}': {}", path, e))?;
    serde_json::from_str(&text).map_err(|e| format!("Invalid exception record '{}': {}", path, e))
}

async fn cmd_update(config: String, engines: Vec<String>) -> Result<(), String> {
    let app = start(&config).await?;
    let names = if engines.is_empty() {
        app.composer.enabled()
    } else {
        engines
    };

    for name in &names {
        if app.store.init(name).await.is_none() {
            println!("  {:<16} not installed", name);
        }
    }

    let results = app.updater.update_all(&names).await;
    for (name, engine) in names.iter().zip(results) {
        if let Some(engine) = engine {
            println!(
                "  {:<16} {} rules, {} lists",
                name,
                engine.rules.rule_count(),
                engine.lists.len()
            );
        }
    }

    let main = app.composer.reload_main().await;
    println!("Composed '{}' with {} rules", MAIN_ENGINE, main.rules.rule_count());

    app.shutdown();
    Ok(())
}

async fn cmd_refresh(config: String) -> Result<(), String> {
    let app = start(&config).await?;
    if app.composer.refresh_if_stale(now_secs()).await {
        println!("Refreshed '{}'", MAIN_ENGINE);
    } else {
        println!(
            "'{}' is fresh (interval {}s)",
            MAIN_ENGINE, app.config.freshness_interval_secs
        );
    }
    app.shutdown();
    Ok(())
}

async fn cmd_status(config: String) -> Result<(), String> {
    let app = start(&config).await?;

    let mut names = app.composer.enabled();
    if !names.iter().any(|name| name == CUSTOM_FILTERS_ENGINE) {
        names.push(CUSTOM_FILTERS_ENGINE.to_string());
    }
    names.push(MAIN_ENGINE.to_string());

    println!("Storage: {}", app.config.storage_dir.as_deref().map_or("memory".into(), |p| p.display().to_string()));
    for name in &names {
        match app.store.persisted(name).await {
            Some(engine) => {
                let updated = engine
                    .updated_at
                    .map_or("never".to_string(), |t| format!("{}s ago", now_secs().saturating_sub(t)));
                println!(
                    "  {:<16} {:>7} rules  updated {}",
                    name,
                    engine.rules.rule_count(),
                    updated
                );
                for (list, checksum) in &engine.lists {
                    println!("    {:<20} {}", list, checksum);
                }
            }
            None => println!("  {:<16} (none)", name),
        }
    }
    println!("Exceptions: {}", app.exceptions.all().len());

    app.shutdown();
    Ok(())
}

async fn cmd_custom(config: String, input: Option<String>) -> Result<(), String> {
    let app = start(&config).await?;
    let text = match &input {
        Some(path) => fs::read_to_string(path).map_err(|e| format!("Failed to read '{}': {}", path, e))?,
        None => String::new(),
    };

    match app.composer.set_custom_filters(&text).await {
        Some(engine) => println!("Custom filters: {} rules", engine.rules.rule_count()),
        None => println!("Custom filters removed"),
    }
    if !app.composer.enabled().iter().any(|name| name == CUSTOM_FILTERS_ENGINE) {
        println!("Note: '{}' is not in enabled_engines, so it is not composed", CUSTOM_FILTERS_ENGINE);
    }
    let main = app.composer.reload_main().await;
    println!("Composed '{}' with {} rules", MAIN_ENGINE, main.rules.rule_count());

    app.shutdown();
    Ok(())
}

fn print_stance(site: &str, category: Category, record: Option<&ExceptionRecord>) {
    let stance = resolve(site, category, record);
    let reason = match stance.reason {
        StanceReason::CategoryDefault => "category default",
        StanceReason::GlobalOverride => "global override",
        StanceReason::SiteException => "site exception",
    };
    println!(
        "{} on {}: {} ({})",
        category.as_str(),
        site,
        if stance.trusted { "trusted" } else { "blocked" },
        reason
    );
}

fn cmd_trust(site: &str, category: &str, record: Option<&str>) -> Result<(), String> {
    let category = parse_category(category)?;
    let record = record.map(read_record).transpose()?;
    print_stance(site, category, record.as_ref());
    Ok(())
}

async fn cmd_trust_persisted(site: String, category: String, id: String, config: String) -> Result<(), String> {
    let category = parse_category(&category)?;
    let app = start(&config).await?;
    print_stance(&site, category, app.exceptions.get(&id).as_ref());
    app.shutdown();
    Ok(())
}

async fn cmd_exception(
    config: String,
    id: String,
    action: ExceptionAction,
    site: Option<String>,
) -> Result<(), String> {
    let app = start(&config).await?;
    let exceptions = &app.exceptions;
    let require_site = || site.clone().ok_or_else(|| "--site is required for this action".to_string());

    let record = match action {
        ExceptionAction::Show => exceptions.get(&id),
        ExceptionAction::TrustSite => Some(exceptions.set_site_stance(&id, &require_site()?, SiteStance::Trusted).await),
        ExceptionAction::BlockSite => Some(exceptions.set_site_stance(&id, &require_site()?, SiteStance::Blocked).await),
        ExceptionAction::ClearSite => Some(exceptions.clear_site(&id, &require_site()?).await),
        ExceptionAction::Toggle => Some(exceptions.toggle_overwrite(&id).await),
        ExceptionAction::Remove => {
            exceptions.remove(&id).await;
            None
        }
    };

    match record.filter(|r| !r.is_noop()) {
        Some(record) => println!(
            "{}",
            serde_json::to_string_pretty(&record).map_err(|e| e.to_string())?
        ),
        None => println!("No exception for '{}'", id),
    }

    app.shutdown();
    Ok(())
}

fn cmd_restrict(filter: &str, domains: &[String]) -> Result<(), String> {
    let filter = parse_filter(filter)?;
    let restricted = domains
        .iter()
        .fold(filter, |filter, domain| restrict_filter(&filter, domain));
    println!("{restricted}");
    Ok(())
}

fn cmd_negate(filter: &str) -> Result<(), String> {
    println!("{}", negate_filter(&parse_filter(filter)?));
    Ok(())
}

async fn cmd_convert(
    input: String,
    output: Option<String>,
    first_id: u32,
    exception: Option<String>,
    category: Option<String>,
) -> Result<(), String> {
    let text = fs::read_to_string(&input).map_err(|e| format!("Failed to read '{}': {}", input, e))?;
    let converter = DnrConverter::new(first_id);

    let conversion = match (exception, category) {
        (Some(record), Some(category)) => {
            let record = read_record(&record)?;
            let category = parse_category(&category)?;
            let filters: Vec<Filter> = bw_core::diff::list_lines(&text)
                .filter_map(|line| line.parse().ok())
                .collect();
            converter.convert_exception(&record, category, &filters).await
        }
        _ => converter.convert(text.lines().map(str::to_string).collect()).await,
    };

    for error in &conversion.errors {
        eprintln!("  skipped '{}': {}", error.filter, error.error);
    }

    let json = serde_json::to_string_pretty(&conversion.rules).map_err(|e| e.to_string())?;
    match output {
        Some(path) => {
            fs::write(&path, json).map_err(|e| format!("Failed to write '{}': {}", path, e))?;
            println!(
                "Converted {} rules to '{}' ({} skipped)",
                conversion.rules.len(),
                path,
                conversion.errors.len()
            );
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn cmd_publish(
    name: String,
    lists: &[String],
    resources: Option<String>,
    previous: Option<String>,
    output: String,
    base_url: String,
    config: Option<String>,
) -> Result<(), String> {
    let environment = match &config {
        Some(path) => {
            let text = fs::read_to_string(path).map_err(|e| format!("Failed to read '{}': {}", path, e))?;
            Config::from_json_str(&text)
                .map_err(|e| format!("Invalid config '{}': {}", path, e))?
                .environment
        }
        None => Environment::new(),
    };

    let lists = lists
        .iter()
        .map(|arg| match arg.split_once('=') {
            Some((list, path)) if !list.is_empty() && !path.is_empty() => {
                Ok((list.to_string(), PathBuf::from(path)))
            }
            _ => Err(format!("Invalid --list '{}', expected NAME=PATH", arg)),
        })
        .collect::<Result<Vec<_>, String>>()?;

    let opts = PublishOptions {
        name,
        lists,
        resources: resources.map(PathBuf::from),
        previous: previous.map(PathBuf::from),
        output: PathBuf::from(&output),
        base_url,
        environment,
    };
    let stats = publish(&opts)?;

    println!("Published '{}' to '{}'", opts.name, output);
    println!("  Lists:    {}", stats.lists);
    println!("  Diffs:    {}", stats.diffs);
    println!("  Rules:    {}", stats.rules);
    println!(
        "  Snapshot: {} bytes ({:.1} KB)",
        stats.snapshot_bytes,
        stats.snapshot_bytes as f64 / 1024.0
    );
    Ok(())
}
