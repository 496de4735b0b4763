use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;

use ivfpage::config::Config;
use ivfpage::source::TableSource;
use ivfpage::startup::{init_logging, open_store, resolve_config_path};
use ivfpage::{
    BuildOptions, CancellationToken, IvfError, IvfIndex, OpClass, OrderBy, RowRef, ScanOptions,
    VacuumStats,
};

/// Rows per block of the table read from a vector file.
const ROWS_PER_BLOCK: usize = 64;

#[derive(Parser, Debug)]
#[command(name = "ivfpage", about = "IVF-Flat vector index over a page file")]
struct Args {
    /// Config file (default: $IVFPAGE_CONFIG, then ./ivfpage.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build a new index from a JSON-lines file of vectors (`[..]` or `null` per line)
    Build {
        #[arg(long)]
        input: PathBuf,

        /// Number of lists (default: index.lists)
        #[arg(long)]
        lists: Option<usize>,

        /// Seed for sampling and training
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Insert one vector
    Insert {
        /// Vector as a JSON array
        #[arg(long)]
        vector: String,

        /// Row reference to store with the vector
        #[arg(long)]
        row: u64,
    },

    /// Print the nearest rows to a vector as JSON lines
    Query {
        #[arg(long)]
        vector: String,

        #[arg(long, default_value_t = 10)]
        k: usize,

        /// Lists to probe (default: scan.probes)
        #[arg(long)]
        probes: Option<usize>,
    },

    /// Remove rows listed in a JSON array of row references
    Vacuum {
        #[arg(long)]
        dead: PathBuf,
    },

    /// Print per-list statistics as JSON
    Stats {
        /// Also print Prometheus metrics
        #[arg(long)]
        metrics: bool,
    },
}

#[derive(Serialize)]
struct QueryHit {
    row: u64,
    distance: f64,
}

fn parse_vector(raw: &str) -> Result<Vec<f32>, IvfError> {
    Ok(serde_json::from_str(raw)?)
}

fn read_table(path: &PathBuf) -> Result<(TableSource, Option<usize>), IvfError> {
    let reader = BufReader::new(File::open(path)?);
    let mut table = TableSource::new(ROWS_PER_BLOCK);
    let mut dimensions = None;
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let vector: Option<Vec<f32>> = serde_json::from_str(&line)?;
        if dimensions.is_none() {
            dimensions = vector.as_ref().map(Vec::len);
        }
        table.push(vector);
    }
    Ok((table, dimensions))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    // Load config (priority: --config > IVFPAGE_CONFIG env var > ./ivfpage.toml > defaults)
    let config_path = args.config.clone().or_else(resolve_config_path);
    let config = Config::load(config_path.as_deref())?;

    init_logging(&config);

    let store = Arc::new(open_store(&config)?);
    let opclass = OpClass::from_names(&config.index.opclass, &config.index.vector_type)?;
    let cancel = CancellationToken::new();
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    match args.command {
        Command::Build { input, lists, seed } => {
            let (table, dimensions) = read_table(&input)?;
            let dimensions = dimensions.ok_or_else(|| {
                IvfError::InvalidParameter(format!("{} has no non-null vectors", input.display()))
            })?;
            let mut options = BuildOptions::from_config(&config, dimensions);
            if let Some(lists) = lists {
                options.lists = lists;
            }
            if let Some(seed) = seed {
                options.seed = Some(seed);
            }
            let (_, result) = IvfIndex::build(store, &table, opclass, &options, &cancel)?;
            writeln!(
                out,
                "{}",
                serde_json::json!({
                    "heap_tuples": result.heap_tuples,
                    "index_tuples": result.index_tuples,
                    "samples": result.samples,
                    "pages": result.pages,
                })
            )?;
        }
        Command::Insert { vector, row } => {
            let index = IvfIndex::open(store, opclass)?;
            let vector = parse_vector(&vector)?;
            let inserted = index.insert(Some(&vector), RowRef(row))?;
            writeln!(out, "{}", serde_json::json!({ "inserted": inserted }))?;
        }
        Command::Query { vector, k, probes } => {
            let index = IvfIndex::open(store, opclass)?;
            let vector = parse_vector(&vector)?;
            let mut options = ScanOptions::from_config(&config.scan);
            if let Some(probes) = probes {
                options.probes = probes;
            }
            let scan = index.scan(Some(OrderBy::Vector(vector)), options, &cancel)?;
            for item in scan.take(k) {
                let item = item?;
                let hit = QueryHit {
                    row: item.row.0,
                    distance: item.distance,
                };
                writeln!(out, "{}", serde_json::to_string(&hit)?)?;
            }
        }
        Command::Vacuum { dead } => {
            let index = IvfIndex::open(store, opclass)?;
            let rows: HashSet<u64> = serde_json::from_reader(BufReader::new(File::open(dead)?))?;
            let mut stats = VacuumStats::default();
            index.bulk_delete(&mut stats, |row| rows.contains(&row.0), &cancel)?;
            index.vacuum_cleanup(&mut stats);
            writeln!(
                out,
                "{}",
                serde_json::json!({
                    "tuples_removed": stats.tuples_removed,
                    "num_index_tuples": stats.num_index_tuples,
                    "num_pages": stats.num_pages,
                })
            )?;
        }
        Command::Stats { metrics } => {
            let index = IvfIndex::open(store, opclass)?;
            let lists = index.list_stats()?;
            writeln!(
                out,
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "dimensions": index.dimensions(),
                    "lists": lists,
                    "pages": index.store().page_count(),
                }))?
            )?;
            if metrics {
                write!(out, "{}", ivfpage::metrics::gather_text())?;
            }
        }
    }

    Ok(())
}
