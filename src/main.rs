//! keyspace-bulk - Bulk Actions over Sharded Key-Value Stores
//!
//! Entry point for the CLI application.

use anyhow::{bail, Context, Result};
use clap::Parser;
use keyspace_bulk::config::{BulkConfig, CliArgs, Command, OutputFormat};
use keyspace_bulk::report::{print_counts, print_header, print_summary, ProgressReporter};
use keyspace_bulk::scanner::count_keys;
use keyspace_bulk::{
    ActionStatus, BulkActionManager, BulkActionRequest, ProgressEvent, RedisStore, SeedEntry,
    ShardedStoreClient,
};
use std::fs::File;
use std::io::BufReader;
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Name the CLI registers its single store under
const CONNECTION: &str = "cli";

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args = CliArgs::parse();

    setup_logging(args.verbose)?;

    let config = BulkConfig::from_cli(&args).context("Invalid configuration")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create async runtime")?;

    runtime.block_on(async { run_async(args, config).await })
}

async fn run_async(args: CliArgs, config: BulkConfig) -> Result<()> {
    let store = Arc::new(
        RedisStore::connect(&args.url)
            .await
            .with_context(|| format!("Failed to connect to {}", args.url))?,
    );

    let result = match &args.command {
        Command::Count(filter) => {
            let filter = filter.to_filter().context("Invalid filter")?;
            let counts = count_keys(store.clone(), &filter, &config)
                .await
                .context("Count failed")?;
            match args.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&counts)?),
                OutputFormat::Text => print_counts(&counts),
            }
            Ok(())
        }
        Command::Delete(filter) => {
            let filter = filter.to_filter().context("Invalid filter")?;
            let request = BulkActionRequest::delete(CONNECTION, filter);
            run_action(&args, config, store.clone(), request).await
        }
        Command::Unlink(filter) => {
            let filter = filter.to_filter().context("Invalid filter")?;
            let request = BulkActionRequest::unlink(CONNECTION, filter);
            run_action(&args, config, store.clone(), request).await
        }
        Command::Upload { file } => {
            let reader = File::open(file)
                .map(BufReader::new)
                .with_context(|| format!("Failed to open {}", file.display()))?;
            let seed = SeedEntry::read_json_lines(reader)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            info!(records = seed.len(), file = %file.display(), "Loaded seed file");
            let request = BulkActionRequest::upload(CONNECTION, seed);
            run_action(&args, config, store.clone(), request).await
        }
    };

    store.close();
    result
}

async fn run_action(
    args: &CliArgs,
    config: BulkConfig,
    store: Arc<dyn ShardedStoreClient>,
    request: BulkActionRequest,
) -> Result<()> {
    let show_progress = !args.quiet && args.format == OutputFormat::Text;
    if show_progress {
        print_header(
            &args.url,
            &request.action.to_string(),
            &request.filter.pattern,
            config.shard_concurrency,
        );
    }

    let manager = BulkActionManager::with_reaper(config).context("Invalid configuration")?;
    manager.register_connection(CONNECTION, store);
    let id = manager.create(request).context("Invalid request")?;

    // First Ctrl-C stops after the current page, the second exits
    let interrupts = Arc::new(AtomicUsize::new(0));
    let handler_manager = Arc::clone(&manager);
    ctrlc::set_handler(move || {
        if interrupts.fetch_add(1, Ordering::SeqCst) == 0 {
            eprintln!("\nInterrupt received, stopping after the current page (Ctrl-C again to exit)...");
            handler_manager.abort_all();
        } else {
            eprintln!("\nExiting");
            std::process::exit(130);
        }
    })
    .context("Failed to set signal handler")?;

    let mut subscription = manager.subscribe(id)?;
    manager.start(id).context("Failed to start")?;

    let progress = if show_progress {
        Some(ProgressReporter::new())
    } else {
        None
    };
    if let Some(ref p) = progress {
        p.set_status("Resolving shards...");
    }

    while let Some(event) = subscription.recv().await {
        if let Some(ref p) = progress {
            p.update(event.overview());
        }
        if let ProgressEvent::ReportComplete(ref overview) = event {
            info!(run_id = %overview.id, status = %overview.status, "Run finished");
        }
    }
    manager.unsubscribe(subscription);

    let overview = manager.get_overview(id)?;

    if let Some(ref p) = progress {
        p.finish(&format!("Bulk {} {}", overview.action, overview.status));
    }

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&overview)?),
        OutputFormat::Text => print_summary(&overview),
    }

    match overview.status {
        ActionStatus::Completed | ActionStatus::Aborted => Ok(()),
        status => bail!(
            "Bulk {} {}: {}",
            overview.action,
            status,
            overview.error.as_deref().unwrap_or("no details")
        ),
    }
}

fn setup_logging(verbose: bool) -> Result<()> {
    let default = if verbose {
        "keyspace_bulk=debug,warn"
    } else {
        "keyspace_bulk=info,warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}
