use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use coda_core::{
    CodaConfig, Cursor, DlqRange, MergeFailure, Partition, Payload, QueueEngine, QueueRow, TaskId,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "coda", about = "Coda queue engine operator CLI")]
struct Cli {
    /// Config file (default: ./coda.toml, then /etc/coda/coda.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory, overriding the config file and CODA_DATA_DIR
    #[arg(long, global = true)]
    data_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and edit task-queue rows
    #[command(subcommand)]
    Tasks(TaskCommands),

    /// Partition ownership
    #[command(subcommand)]
    Partition(PartitionCommands),

    /// Replication dead-letter queues
    #[command(subcommand)]
    Dlq(DlqCommands),
}

/// Queues are named by their logical name; `dlq:<cluster>` names the
/// dead-letter partition of a source cluster.
#[derive(Subcommand)]
enum TaskCommands {
    /// Enqueue payloads, taking ownership of the partition
    Enqueue {
        queue: String,

        /// One row per payload
        #[arg(required = true)]
        payloads: Vec<String>,

        #[arg(long, default_value = "raw")]
        encoding: String,
    },

    /// List rows in task id order
    List {
        queue: String,

        #[command(flatten)]
        range: RangeArgs,
    },

    /// Remove one task regardless of ownership
    Remove { queue: String, task_id: TaskId },
}

#[derive(Subcommand)]
enum PartitionCommands {
    /// List partitions with their ownership token and task id ceiling
    List,

    /// Fence out the current owner of a partition
    Close { queue: String },
}

#[derive(Subcommand)]
enum DlqCommands {
    /// Source clusters with a dead-letter partition
    Sources,

    /// Dead-letter a message for a source cluster
    Append {
        source: String,
        payload: String,

        #[arg(long, default_value = "raw")]
        encoding: String,
    },

    /// List dead-lettered messages
    List {
        source: String,

        #[command(flatten)]
        range: RangeArgs,
    },

    /// Delete messages up to and including a task id
    Purge {
        source: String,

        #[arg(long)]
        until: TaskId,
    },

    /// Replay messages into a task queue, deleting each one after it is enqueued
    Merge {
        source: String,

        /// Target task queue
        #[arg(long)]
        into: String,

        #[command(flatten)]
        range: RangeArgs,
    },
}

#[derive(clap::Args)]
struct RangeArgs {
    /// Start after this task id
    #[arg(long)]
    after: Option<TaskId>,

    /// Stop at this task id (inclusive)
    #[arg(long)]
    until: Option<TaskId>,

    /// Maximum rows
    #[arg(long)]
    limit: Option<usize>,

    /// One JSON object per row
    #[arg(long)]
    json: bool,
}

fn load_config(explicit: Option<&Path>) -> CodaConfig {
    let default_paths = [Path::new("coda.toml"), Path::new("/etc/coda/coda.toml")];
    let candidates: Vec<&Path> = match explicit {
        Some(path) => vec![path],
        None => default_paths
            .into_iter()
            .filter(|p| p.exists())
            .collect(),
    };

    if let Some(path) = candidates.first() {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    info!(path = %path.display(), "loaded configuration");
                    return config;
                }
                Err(e) => {
                    eprintln!("error parsing {}: {e}", path.display());
                    process::exit(1);
                }
            },
            Err(e) => {
                eprintln!("error reading {}: {e}", path.display());
                process::exit(1);
            }
        }
    }

    info!("no config file found, using defaults");
    CodaConfig::default()
}

fn parse_partition(queue: &str) -> Partition {
    match queue.strip_prefix("dlq:") {
        Some(source) => Partition::dlq(source),
        None => Partition::task_queue(queue),
    }
}

fn fail(context: &str, err: impl std::fmt::Display) -> ! {
    eprintln!("Error: {context}: {err}");
    process::exit(1);
}

fn print_rows(rows: &[QueueRow], json: bool) {
    if json {
        for row in rows {
            let value = serde_json::json!({
                "task_id": row.task_id,
                "encoding": row.data_encoding,
                "data": String::from_utf8_lossy(&row.data),
            });
            println!("{value}");
        }
        return;
    }

    if rows.is_empty() {
        println!("No rows found.");
        return;
    }
    let encoding_width = rows
        .iter()
        .map(|r| r.data_encoding.len())
        .max()
        .unwrap_or(8)
        .max(8);
    println!("{:>12}  {:<encoding_width$}  DATA", "TASK_ID", "ENCODING");
    for row in rows {
        println!(
            "{:>12}  {:<encoding_width$}  {}",
            row.task_id,
            row.data_encoding,
            String::from_utf8_lossy(&row.data)
        );
    }
}

fn cmd_tasks_enqueue(engine: &QueueEngine, queue: &str, payloads: Vec<String>, encoding: &str) {
    let partition = parse_partition(queue);
    let mut lease = engine
        .acquire(&partition)
        .unwrap_or_else(|e| fail(&format!("acquire \"{queue}\""), e));
    let payloads = payloads
        .into_iter()
        .map(|p| Payload::new(p.into_bytes(), encoding))
        .collect();
    match engine.enqueue(&mut lease, payloads) {
        Ok(ids) => {
            for id in ids {
                println!("{id}");
            }
        }
        Err(e) => fail(&format!("enqueue to \"{queue}\""), e),
    }
}

fn cmd_tasks_list(engine: &QueueEngine, queue: &str, range: RangeArgs) {
    let cursor = Cursor {
        partition: parse_partition(queue),
        read_level: range.after,
    };
    let mut pager = engine.read_tasks(cursor);
    if let Some(until) = range.until {
        pager = pager.until(until);
    }

    let limit = range.limit.unwrap_or(usize::MAX);
    let mut rows = Vec::new();
    for page in pager {
        match page {
            Ok(page) => rows.extend(page),
            Err(e) => fail(&format!("list \"{queue}\""), e),
        }
        if rows.len() >= limit {
            break;
        }
    }
    rows.truncate(limit);
    print_rows(&rows, range.json);
}

fn cmd_tasks_remove(engine: &QueueEngine, queue: &str, task_id: TaskId) {
    match engine.remove_task(&parse_partition(queue), task_id) {
        Ok(0) => println!("Task {task_id} not found in \"{queue}\""),
        Ok(_) => println!("Removed task {task_id} from \"{queue}\""),
        Err(e) => fail(&format!("remove from \"{queue}\""), e),
    }
}

fn cmd_partition_list(engine: &QueueEngine) {
    let partitions = engine
        .partitions()
        .unwrap_or_else(|e| fail("list partitions", e));
    if partitions.is_empty() {
        println!("No partitions found.");
        return;
    }

    let names: Vec<String> = partitions
        .iter()
        .map(|(p, _)| String::from_utf8_lossy(&p.queue_id).into_owned())
        .collect();
    let name_width = names.iter().map(String::len).max().unwrap_or(5).max(5);
    println!(
        "{:<name_width$}  {:>10}  {:>6}  {:>12}",
        "QUEUE", "HASH", "TOKEN", "CEILING"
    );
    for (name, (p, meta)) in names.iter().zip(&partitions) {
        println!(
            "{:<name_width$}  {:>10}  {:>6}  {:>12}",
            name, p.range_hash, meta.fence_token, meta.task_id_ceiling
        );
    }
}

fn cmd_partition_close(engine: &QueueEngine, queue: &str) {
    match engine.close_partition(&parse_partition(queue)) {
        Ok(token) => println!("Closed \"{queue}\" (token {token})"),
        Err(e) => fail(&format!("close \"{queue}\""), e),
    }
}

fn cmd_dlq_sources(engine: &QueueEngine) {
    let sources = engine
        .dlq()
        .sources()
        .unwrap_or_else(|e| fail("list dlq sources", e));
    if sources.is_empty() {
        println!("No dead-letter queues found.");
    }
    for source in sources {
        println!("{source}");
    }
}

fn cmd_dlq_append(engine: &QueueEngine, source: &str, payload: String, encoding: &str) {
    match engine
        .dlq()
        .append(source, Payload::new(payload.into_bytes(), encoding))
    {
        Ok(task_id) => println!("{task_id}"),
        Err(e) => fail(&format!("append to dlq \"{source}\""), e),
    }
}

fn cmd_dlq_list(engine: &QueueEngine, source: &str, range: RangeArgs) {
    let dlq_range = DlqRange {
        read_level: range.after,
        inclusive_end: range.until,
        page_size: range.limit,
    };
    match engine.dlq().read(source, dlq_range) {
        Ok(page) => {
            print_rows(&page.rows, range.json);
            if page.has_more && !range.json {
                if let Some(level) = page.next_read_level {
                    println!("More rows follow; continue with --after {level}");
                }
            }
        }
        Err(e) => fail(&format!("list dlq \"{source}\""), e),
    }
}

fn cmd_dlq_purge(engine: &QueueEngine, source: &str, until: TaskId) {
    match engine.dlq().purge(source, until) {
        Ok(purged) => println!(
            "Purged {purged} message{} from dlq \"{source}\"",
            if purged == 1 { "" } else { "s" }
        ),
        Err(failure) => {
            eprintln!(
                "Error: purge of dlq \"{source}\" stopped after {} messages: {}",
                failure.purged, failure.error
            );
            process::exit(1);
        }
    }
}

fn cmd_dlq_merge(engine: &QueueEngine, source: &str, into: &str, range: RangeArgs) {
    let applier = engine.requeue_applier(parse_partition(into));
    let dlq_range = DlqRange {
        read_level: range.after,
        inclusive_end: range.until,
        page_size: range.limit,
    };
    let report = engine.dlq().merge(source, dlq_range, &applier);

    println!(
        "Merged {} message{} from dlq \"{source}\" into \"{into}\"",
        report.merged,
        if report.merged == 1 { "" } else { "s" }
    );
    if let Some(next) = report.next_task_id {
        println!("Resume with --after {}", next.saturating_sub(1));
    }
    if let Some(failure) = report.failure {
        match failure {
            MergeFailure::Apply { task_id, source: e } => {
                eprintln!("Error: task {task_id} could not be enqueued: {e}")
            }
            MergeFailure::Dlq(e) => eprintln!("Error: {e}"),
        }
        process::exit(1);
    }
}

fn main() {
    coda_core::telemetry::init_tracing();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref());
    if let Ok(data_dir) = std::env::var("CODA_DATA_DIR") {
        config.storage.data_dir = data_dir;
    }
    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir;
    }

    let engine = QueueEngine::open(config).unwrap_or_else(|e| fail("open storage", e));

    match cli.command {
        Commands::Tasks(cmd) => match cmd {
            TaskCommands::Enqueue {
                queue,
                payloads,
                encoding,
            } => cmd_tasks_enqueue(&engine, &queue, payloads, &encoding),
            TaskCommands::List { queue, range } => cmd_tasks_list(&engine, &queue, range),
            TaskCommands::Remove { queue, task_id } => cmd_tasks_remove(&engine, &queue, task_id),
        },
        Commands::Partition(cmd) => match cmd {
            PartitionCommands::List => cmd_partition_list(&engine),
            PartitionCommands::Close { queue } => cmd_partition_close(&engine, &queue),
        },
        Commands::Dlq(cmd) => match cmd {
            DlqCommands::Sources => cmd_dlq_sources(&engine),
            DlqCommands::Append {
                source,
                payload,
                encoding,
            } => cmd_dlq_append(&engine, &source, payload, &encoding),
            DlqCommands::List { source, range } => cmd_dlq_list(&engine, &source, range),
            DlqCommands::Purge { source, until } => cmd_dlq_purge(&engine, &source, until),
            DlqCommands::Merge {
                source,
                into,
                range,
            } => cmd_dlq_merge(&engine, &source, &into, range),
        },
    }

    if let Err(e) = engine.flush() {
        fail("flush storage", e);
    }
}
