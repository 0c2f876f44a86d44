use anyhow::{Context, Result};
use clap::Parser;
use hprof_walker::cli::{Cli, Commands, OutputFormat};
use hprof_walker::config::{WalkerConfig, resolve_dump_path, resolve_dump_paths};
use hprof_walker::heap::{Heap, HeapSummary};
use hprof_walker::histogram::{HistogramEntry, histogram};
use hprof_walker::path::HeapPath;
use hprof_walker::pattern::ClassPattern;
use hprof_walker::walker::{Hit, Walker};
use rayon::prelude::*;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    match cli.command.clone() {
        Commands::Info { dump } => {
            let path = resolve_dump_path(dump.as_ref())?;
            let heap = open_heap(&path)?;
            let summary = heap.summary();
            write_output(&summary, cli.format, summary_text)?;
        }
        Commands::Classes { dump, filter } => {
            let path = resolve_dump_path(dump.as_ref())?;
            let heap = open_heap(&path)?;
            let rows = list_classes(&heap, filter.as_deref());
            write_output(&rows, cli.format, classes_text)?;
        }
        Commands::Histo { dumps, top } => {
            let paths = resolve_dump_paths(&dumps)?;
            let results = histo_files(&paths, top)?;
            write_output(&results, cli.format, histo_text)?;
        }
        Commands::Walk {
            dump,
            class,
            path,
            limit,
        } => {
            let dump_path = resolve_dump_path(dump.as_ref())?;
            let heap = open_heap(&dump_path)?;
            let walker = Walker::new(WalkerConfig::from_cli(&cli)?);
            let result = walk_class(&heap, &walker, &class, &path, limit)?;
            write_output(&result, cli.format, walk_text)?;
        }
    }

    Ok(())
}

fn open_heap(path: &Path) -> Result<Heap> {
    Heap::open(path).with_context(|| format!("Failed to load heap dump: {}", path.display()))
}

#[derive(Debug, Serialize)]
struct ClassRow {
    name: String,
    id: String,
    instances: usize,
    synthetic: bool,
}

fn list_classes(heap: &Heap, filter: Option<&str>) -> Vec<ClassRow> {
    let pattern = filter.map(ClassPattern::compile);
    let mut rows: Vec<ClassRow> = heap
        .classes()
        .filter(|c| pattern.as_ref().is_none_or(|p| p.matches(c.name())))
        .map(|c| ClassRow {
            name: c.name().to_string(),
            id: c.id().to_string(),
            instances: c.instance_count(),
            synthetic: c.is_synthetic(),
        })
        .collect();
    rows.sort_by(|a, b| a.name.cmp(&b.name));
    rows
}

#[derive(Debug, Serialize)]
struct HistoResult {
    dump: String,
    instances: usize,
    bytes: usize,
    duration_ms: u64,
    classes: Vec<HistogramEntry>,
}

/// One heap per file; `Heap` is not `Send`, so each stays on its worker.
fn histo_files(paths: &[PathBuf], top: usize) -> Result<Vec<HistoResult>> {
    paths
        .par_iter()
        .map(|path| {
            let start = Instant::now();
            let heap = open_heap(path)?;
            let mut classes = histogram(&heap)
                .with_context(|| format!("Failed to scan heap dump: {}", path.display()))?;
            let instances = classes.iter().map(|e| e.instances).sum();
            let bytes = classes.iter().map(|e| e.bytes).sum();
            classes.truncate(top);
            Ok(HistoResult {
                dump: path.to_string_lossy().to_string(),
                instances,
                bytes,
                duration_ms: start.elapsed().as_millis() as u64,
                classes,
            })
        })
        .collect()
}

#[derive(Debug, Serialize)]
struct WalkRow {
    root: String,
    kind: &'static str,
    class_name: Option<String>,
    id: Option<String>,
    value: String,
}

#[derive(Debug, Serialize)]
struct WalkResult {
    class_name: String,
    path: String,
    roots: usize,
    duration_ms: u64,
    results: Vec<WalkRow>,
}

fn walk_class(
    heap: &Heap,
    walker: &Walker,
    class_name: &str,
    path: &str,
    limit: Option<usize>,
) -> Result<WalkResult> {
    let start = Instant::now();
    let path = HeapPath::parse(path)?;
    let class = heap.require_class(class_name)?;
    let limit = limit.unwrap_or(usize::MAX);

    let mut roots = 0;
    let mut results = Vec::new();
    'roots: for root in class.instances() {
        let root = root?;
        roots += 1;
        for hit in walker.walk_path(&root, &path) {
            if results.len() >= limit {
                break 'roots;
            }
            let hit = hit?;
            results.push(walk_row(&root.id().to_string(), &hit)?);
        }
    }

    Ok(WalkResult {
        class_name: class.name().to_string(),
        path: path.to_string(),
        roots,
        duration_ms: start.elapsed().as_millis() as u64,
        results,
    })
}

fn walk_row(root: &str, hit: &Hit<'_>) -> Result<WalkRow> {
    let kind = match hit {
        Hit::Null => "null",
        Hit::Instance(_) => "instance",
        Hit::Scalar(_) => "scalar",
        Hit::Entry(_) => "entry",
    };
    Ok(WalkRow {
        root: root.to_string(),
        kind,
        class_name: hit.class_name()?,
        id: hit.as_instance().map(|i| i.id().to_string()),
        value: hit.render()?,
    })
}

fn write_output<T: Serialize + ?Sized>(
    value: &T,
    format: OutputFormat,
    text: impl Fn(&T) -> String,
) -> Result<()> {
    let content = match format {
        OutputFormat::Json => serde_json::to_string_pretty(value)?,
        OutputFormat::Text => text(value),
    };
    print!("{content}");
    if !content.ends_with('\n') {
        println!();
    }
    Ok(())
}

fn summary_text(summary: &HeapSummary) -> String {
    let mut out = String::new();
    if let Some(source) = &summary.source {
        out.push_str(&format!("dump: {source}\n"));
    }
    out.push_str(&format!("version: {}\n", summary.version));
    out.push_str(&format!("id_size: {}\n", summary.id_size));
    out.push_str(&format!("timestamp_ms: {}\n", summary.timestamp_ms));
    out.push_str(&format!("classes: {}\n", summary.classes));
    out.push_str(&format!("instances: {}\n", summary.instances));
    out.push_str(&format!("gc_roots: {}\n", summary.gc_roots));
    out
}

fn classes_text(rows: &Vec<ClassRow>) -> String {
    let mut out = String::new();
    for row in rows {
        out.push_str(&format!("{:>10}  {}\n", row.instances, row.name));
    }
    out
}

fn histo_text(results: &Vec<HistoResult>) -> String {
    let mut out = String::new();
    for result in results {
        out.push_str(&format!(
            "{} ({} instances, {} bytes)\n",
            result.dump, result.instances, result.bytes
        ));
        for entry in &result.classes {
            out.push_str(&format!(
                "{:>10} {:>12}  {}\n",
                entry.instances, entry.bytes, entry.class_name
            ));
        }
    }
    out
}

fn walk_text(result: &WalkResult) -> String {
    let mut out = String::new();
    for row in &result.results {
        out.push_str(&format!("{}\t{}\n", row.root, row.value));
    }
    out
}
