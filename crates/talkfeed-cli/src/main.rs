use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use talkfeed_core::{Config, EventConfig, FeedMeta, Feedback, RecordFile};
use talkfeed_curate::{
    build_feed, discover, feed_unchanged, mean_rating, BuildError, DiscoverOptions, DiscoveryError,
};
use talkfeed_schedule::{choose_schedule_url, generate_endpoints, resolve_event};
use talkfeed_store::{write_atomic, FetchCache, FetchCacheConfig};

const MEDIA_DIR: &str = "media";

#[derive(Debug, Parser)]
#[command(name = "talkfeed")]
#[command(version, about = "Curate congress talks into podcast RSS feeds")]
struct Cli {
    /// Increase verbosity (-v: warnings, -vv: info, -vvv: debug)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to the configuration document
    #[arg(long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Generate RSS feeds from record files
    Build {
        /// Record files to build; defaults to nothing unless --all is given
        files: Vec<PathBuf>,
        /// Build every record file under media/
        #[arg(short, long)]
        all: bool,
        /// Output directory for rendered feeds
        #[arg(short, long, default_value = "feeds")]
        output_dir: PathBuf,
        /// Include talks with a mean rating of 2 or lower
        #[arg(long)]
        all_ratings: bool,
    },
    /// Search the remote schedule and add the merged talk to a record file
    Add {
        query: String,
        /// Event identifier (e.g. 36c3)
        #[arg(short, long)]
        event: Option<String>,
        /// Event year
        #[arg(short, long, conflicts_with = "event")]
        year: Option<i32>,
        /// Record file to update (defaults to media/media_<event>.yml)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Use the long schedule description instead of the podcast one
        #[arg(short = 'l', long)]
        long_desc: bool,
        /// Override categories (comma-separated), bypassing track mapping
        #[arg(short, long)]
        categories: Option<String>,
        /// Attach a rating (1-5) to the new record
        #[arg(long, value_parser = clap::value_parser!(u8).range(1..=5))]
        rating: Option<u8>,
        /// Username for the attached feedback entry
        #[arg(long)]
        username: Option<String>,
        /// Comment for the attached feedback entry
        #[arg(long)]
        comment: Option<String>,
    },
    /// Generate and store configuration for a new congress year
    NewEvent {
        year: i32,
        /// Congress ordinal (derived from the year when omitted)
        #[arg(short = 'c', long)]
        congress_number: Option<u32>,
        /// Skip the URL reachability probes
        #[arg(long)]
        no_validate: bool,
    },
    /// List rated talks sorted by mean rating
    ListByRating {
        /// Restrict to one event (id or record-file path)
        #[arg(short, long)]
        event: Option<String>,
        /// Minimum mean rating
        #[arg(short, long)]
        min_rating: Option<f64>,
        /// Restrict to one category
        #[arg(short, long)]
        category: Option<String>,
    },
    /// Delete cached remote documents
    ClearCache,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "error",
        1 => "warn",
        2 => "info",
        _ => "debug",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn cache_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("TALKFEED_CACHE_DIR") {
        return PathBuf::from(dir);
    }
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".cache").join("talkfeed"),
        None => PathBuf::from(".talkfeed-cache"),
    }
}

fn new_cache() -> Result<FetchCache> {
    FetchCache::new(cache_dir(), FetchCacheConfig::default())
}

async fn load_config_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        talkfeed_store::load_config(path).await
    } else {
        Ok(Config::default())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    tracing::debug!(config = %cli.config.display(), "starting");

    match cli.command {
        Commands::Build {
            files,
            all,
            output_dir,
            all_ratings,
        } => cmd_build(&cli.config, files, all, &output_dir, all_ratings).await,
        Commands::Add {
            query,
            event,
            year,
            output,
            long_desc,
            categories,
            rating,
            username,
            comment,
        } => {
            cmd_add(
                &cli.config,
                &query,
                event,
                year,
                output,
                DiscoverOptions {
                    long_desc,
                    category_override: categories.map(|list| {
                        list.split(',')
                            .map(|c| c.trim().to_string())
                            .filter(|c| !c.is_empty())
                            .collect()
                    }),
                },
                rating,
                username,
                comment,
            )
            .await
        }
        Commands::NewEvent {
            year,
            congress_number,
            no_validate,
        } => cmd_new_event(&cli.config, year, congress_number, no_validate).await,
        Commands::ListByRating {
            event,
            min_rating,
            category,
        } => cmd_list_by_rating(event, min_rating, category).await,
        Commands::ClearCache => {
            let cache = new_cache()?;
            let count = cache.clear()?;
            println!("✓ Cleared {count} cached file(s)");
            Ok(())
        }
    }
}

fn feed_output_path(output_dir: &Path, record_path: &Path) -> PathBuf {
    let name = record_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let name = name.replacen("media_", "feed_", 1);
    let name = match name.strip_suffix(".yml") {
        Some(stem) => format!("{stem}.xml"),
        None => format!("{name}.xml"),
    };
    output_dir.join(name)
}

async fn cmd_build(
    config_path: &Path,
    files: Vec<PathBuf>,
    all: bool,
    output_dir: &Path,
    all_ratings: bool,
) -> Result<()> {
    let config = talkfeed_store::load_config(config_path)
        .await
        .context("loading configuration")?;

    let files = if all {
        talkfeed_store::list_record_files(Path::new(MEDIA_DIR))?
    } else {
        files
    };
    if files.is_empty() {
        bail!("No files to build. Use --all or specify record files.");
    }

    let built_at = Utc::now();
    let mut failures = 0usize;

    for record_path in &files {
        let file = match talkfeed_store::load_record_file(record_path).await {
            Ok(file) => file,
            Err(err) => {
                eprintln!("✗ Failed {}: {err:#}", record_path.display());
                failures += 1;
                continue;
            }
        };

        let report = match build_feed(&file, &config.global, all_ratings, built_at) {
            Ok(report) => report,
            Err(BuildError::Invalid(validation)) => {
                eprintln!("❌ Errors for {}:", record_path.display());
                for error in &validation.errors {
                    eprintln!("   • {error}");
                }
                eprintln!("✗ Failed {}: validation failed", record_path.display());
                failures += 1;
                continue;
            }
        };

        for warning in &report.warnings {
            eprintln!("⚠️  {}: {warning}", record_path.display());
        }

        let output_path = feed_output_path(output_dir, record_path);
        let existing = tokio::fs::read_to_string(&output_path).await.ok();
        if existing
            .as_deref()
            .is_some_and(|old| feed_unchanged(old, &report.xml))
        {
            println!("○ Unchanged: {}", output_path.display());
            continue;
        }

        if let Err(err) = write_atomic(&output_path, report.xml.as_bytes()).await {
            eprintln!("✗ Failed {}: {err:#}", record_path.display());
            failures += 1;
            continue;
        }
        println!(
            "✓ Built: {} ({} talk(s), {} excluded)",
            output_path.display(),
            report.item_count,
            report.excluded
        );
    }

    if failures > 0 {
        bail!("{failures} file(s) failed");
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_add(
    config_path: &Path,
    query: &str,
    event: Option<String>,
    year: Option<i32>,
    output: Option<PathBuf>,
    opts: DiscoverOptions,
    rating: Option<u8>,
    username: Option<String>,
    comment: Option<String>,
) -> Result<()> {
    let config = talkfeed_store::load_config(config_path)
        .await
        .context("loading configuration")?;

    let resolved = match (event, year) {
        (Some(id), _) => resolve_event(&config, &id)?,
        (None, Some(year)) => resolve_event(&config, &year.to_string())?,
        (None, None) => {
            let (key, event) = config.latest_event()?;
            talkfeed_schedule::ResolvedEvent {
                key: key.to_string(),
                config: event.clone(),
                generated: false,
            }
        }
    };
    if resolved.generated {
        eprintln!(
            "⚠️  Event '{}' is not configured; using generated endpoints for this run \
             (persist them with `talkfeed new-event`)",
            resolved.key
        );
    }

    let cache = new_cache()?;
    let discovered = match discover(&cache, &resolved.config, &config.global, query, &opts).await {
        Ok(discovered) => discovered,
        Err(DiscoveryError::NoMatch { query }) => {
            eprintln!(
                "✗ No matching talk found for '{query}' in {} (Congress #{}, {})",
                resolved.key.to_uppercase(),
                resolved.config.congress_number,
                resolved.config.year
            );
            eprintln!(
                "  Tip: try a shorter or more specific term, or check the schedule at {}",
                resolved.config.fahrplan_url
            );
            bail!("no match");
        }
        Err(DiscoveryError::Ambiguous { query, titles }) => {
            eprintln!("✗ Query '{query}' is ambiguous between:");
            for title in &titles {
                eprintln!("   • {title}");
            }
            eprintln!("  Refine the query to disambiguate.");
            bail!("ambiguous match");
        }
        Err(err) => return Err(err.into()),
    };

    for warning in &discovered.warnings {
        eprintln!("⚠️  {warning}");
    }

    let mut record = discovered.record;
    if rating.is_some() || comment.as_deref().is_some_and(|c| !c.trim().is_empty()) {
        record.feedback.push(Feedback {
            rating,
            username: username.filter(|u| !u.trim().is_empty()),
            comment: comment.filter(|c| !c.trim().is_empty()),
        });
    }

    println!("✓ Found talk:");
    println!("  Title: {}", record.title);
    println!("  Speakers: {}", record.speakers);
    println!("  Categories: {}", record.categories.join(", "));

    let output_path =
        output.unwrap_or_else(|| Path::new(MEDIA_DIR).join(format!("media_{}.yml", resolved.key)));
    if !output_path.exists() {
        bail!(
            "record file {} does not exist (create it with `talkfeed new-event {}`)",
            output_path.display(),
            resolved.config.year
        );
    }

    let mut file = talkfeed_store::load_record_file(&output_path).await?;
    file.feed.insert(0, record);
    talkfeed_store::save_record_file(&output_path, &file).await?;
    println!("✓ Added entry to {}", output_path.display());
    Ok(())
}

async fn cmd_new_event(
    config_path: &Path,
    year: i32,
    congress_number: Option<u32>,
    no_validate: bool,
) -> Result<()> {
    let mut config = load_config_or_default(config_path).await?;

    let ordinal = match congress_number {
        Some(n) => n,
        None => {
            let derived = talkfeed_schedule::congress_number(&config, year);
            println!("Derived congress number: {derived}");
            derived
        }
    };

    let endpoints = generate_endpoints(year, ordinal);
    if config.events.contains_key(&endpoints.event_id) {
        bail!(
            "event '{}' already exists in {}; remove it first to replace it",
            endpoints.event_id,
            config_path.display()
        );
    }

    let cache = new_cache()?;
    let fahrplan_url = if no_validate {
        endpoints.schedule_candidates[0].clone()
    } else {
        let (chosen, outcomes) = choose_schedule_url(&cache, &endpoints).await;
        for outcome in &outcomes {
            let mark = if outcome.ok { "✓" } else { "✗" };
            println!("{mark} {} ({})", outcome.url, outcome.detail);
        }
        let podcast = cache.probe(&endpoints.podcast_url).await;
        let mark = if podcast.ok { "✓" } else { "✗" };
        println!("{mark} {} ({})", podcast.url, podcast.detail);
        if !podcast.ok {
            eprintln!("⚠️  Podcast feed did not respond; storing the URL anyway");
        }
        chosen
    };

    let event = EventConfig {
        year,
        congress_number: ordinal,
        fahrplan_url,
        media_feed_url: endpoints.podcast_url.clone(),
        event_pattern_head: Some(endpoints.event_pattern_head.clone()),
        event_pattern_tail: Some(endpoints.event_pattern_tail.clone()),
    };
    config.events.insert(endpoints.event_id.clone(), event);
    talkfeed_store::save_config(config_path, &config).await?;
    println!(
        "✓ Event '{}' added to {}",
        endpoints.event_id,
        config_path.display()
    );

    init_record_file(&cache, &endpoints.event_id, year, no_validate).await?;
    Ok(())
}

/// Create the event's record file with a meta skeleton unless it already
/// exists. The congress logo is probed so Apple-compatible feeds get an
/// image out of the box.
async fn init_record_file(
    cache: &FetchCache,
    event_id: &str,
    year: i32,
    no_validate: bool,
) -> Result<()> {
    let path = Path::new(MEDIA_DIR).join(format!("media_{event_id}.yml"));
    if path.exists() {
        println!("✓ Record file already exists: {}", path.display());
        return Ok(());
    }

    let logo_url = format!("https://static.media.ccc.de/media/congress/{year}/logo.png");
    let image_url = if no_validate || cache.probe(&logo_url).await.ok {
        Some(logo_url)
    } else {
        eprintln!("⚠️  Event logo not found at {logo_url}; add image_url manually later");
        None
    };

    let event_name = event_id.to_uppercase();
    let file = RecordFile {
        meta: FeedMeta {
            title: format!("{event_name} media feed"),
            description: format!(
                "A curated feed for different talks of the {event_name} \
                 (Chaos Communication Congress {year})."
            ),
            image_url,
        },
        feed: Vec::new(),
    };
    talkfeed_store::save_record_file(&path, &file).await?;
    println!("✓ Created record file: {}", path.display());
    Ok(())
}

async fn cmd_list_by_rating(
    event: Option<String>,
    min_rating: Option<f64>,
    category: Option<String>,
) -> Result<()> {
    let files = match &event {
        Some(selector) if selector.contains('/') || selector.ends_with(".yml") => {
            vec![PathBuf::from(selector)]
        }
        Some(selector) => vec![Path::new(MEDIA_DIR).join(format!(
            "media_{}.yml",
            selector.to_lowercase()
        ))],
        None => talkfeed_store::list_record_files(Path::new(MEDIA_DIR))?,
    };
    if files.is_empty() {
        bail!("no record files found");
    }

    struct Row {
        title: String,
        event: String,
        category: String,
        mean: f64,
        count: usize,
    }

    let mut rows = Vec::new();
    for path in &files {
        if !path.exists() {
            continue;
        }
        let file = match talkfeed_store::load_record_file(path).await {
            Ok(file) => file,
            Err(err) => {
                eprintln!("⚠️  Failed to load {}: {err:#}", path.display());
                continue;
            }
        };
        let event_name = path
            .file_stem()
            .map(|s| s.to_string_lossy().replacen("media_", "", 1).to_uppercase())
            .unwrap_or_default();

        for record in &file.feed {
            let Some(mean) = mean_rating(record) else {
                continue;
            };
            if min_rating.is_some_and(|min| mean < min) {
                continue;
            }
            if let Some(wanted) = &category {
                let hit = record
                    .categories
                    .iter()
                    .any(|c| c.eq_ignore_ascii_case(wanted));
                if !hit {
                    continue;
                }
            }
            rows.push(Row {
                title: record.title.clone(),
                event: event_name.clone(),
                category: record.categories.join(", "),
                mean,
                count: record.feedback.iter().filter(|f| f.rating.is_some()).count(),
            });
        }
    }

    rows.sort_by(|a, b| b.mean.partial_cmp(&a.mean).unwrap_or(std::cmp::Ordering::Equal));

    if rows.is_empty() {
        println!("No rated talks found.");
        return Ok(());
    }

    let bar = "━".repeat(95);
    println!("{bar}");
    println!(
        "{:<8} {:<40} {:<14} {:<8} {:<10}",
        "Rating", "Title", "Category", "Event", "# Ratings"
    );
    println!("{bar}");
    for row in &rows {
        let rating = format!("{}/5", talkfeed_curate::display_mean(row.mean));
        let title = truncate(&row.title, 40);
        let category = truncate(&row.category, 14);
        println!(
            "{rating:<8} {title:<40} {category:<14} {:<8} {:<10}",
            row.event, row.count
        );
    }
    println!("{bar}");
    println!("Total: {} rated talk(s)", rows.len());
    Ok(())
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{cut}...")
}
