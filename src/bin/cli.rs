//! Libris CLI - import embeddings, run the taxonomy, inspect the result
//!
//! Usage: libris-cli [OPTIONS] <COMMAND>
//!
//! Supports JSON output for scripting.

use clap::{Parser, Subcommand};
use libris_lib::{
    db::TaxonomyStore,
    engine::TaxonomyEngine,
    logging,
    settings::{self, Settings},
    taxonomy::{CategoryId, CategoryNode, TaxonomyState},
    vector_store::{Book, BookId},
};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

// ============================================================================
// CLI Structure
// ============================================================================

#[derive(Parser)]
#[command(name = "libris-cli")]
#[command(version, about = "Libris semantic taxonomy CLI", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Database path (default: from settings, then the platform data dir)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Settings file (default: platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output as JSON for scripting
    #[arg(long, global = true)]
    json: bool,

    /// More logging (-v info, -vv debug)
    #[arg(long, short, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import books from a JSON Lines file of embeddings
    Import {
        /// One object per line: {"id"|"path", "embedding", "title"?}
        file: PathBuf,
    },
    /// Remove books from the vector store
    Remove {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Run the taxonomy over the current vector set and commit it
    Run,
    /// Print the category tree
    Tree,
    /// Show every category a book belongs to
    Book { id: String },
    /// Show one category with its members
    Category { id: String },
    /// List categories whose label is missing or stale
    PendingLabels,
    /// Apply labels from a JSON object of {"cat-N": "label"}
    Label { file: PathBuf },
    /// Show recent committed runs
    History {
        #[arg(long, default_value = "10")]
        limit: usize,
    },
    /// Print the effective settings
    Config,
}

/// One line of an import file.
#[derive(Deserialize)]
struct ImportRecord {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    path: Option<PathBuf>,
    embedding: Vec<f32>,
    #[serde(default)]
    title: Option<String>,
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run_cli(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run_cli(cli: Cli) -> Result<(), String> {
    let config_path = cli.config.clone().unwrap_or_else(settings::default_config_path);
    let mut settings = Settings::load(&config_path).map_err(|e| e.to_string())?;

    match cli.verbose {
        0 => {}
        1 => settings.logging.default = "info".into(),
        _ => settings.logging.default = "debug".into(),
    }
    logging::init_with_config(&settings.logging);

    if let Commands::Config = &cli.command {
        return print_json_or(&settings, true, || {});
    }

    let db_path = cli.db.clone().unwrap_or_else(|| settings.database_path());
    tracing::info!(target: "store", path = %db_path.display(), "Using database");
    let db = TaxonomyStore::new(&db_path).map_err(|e| e.to_string())?;
    let json = cli.json;

    match cli.command {
        Commands::Import { file } => handle_import(&file, &db, json),
        Commands::Remove { ids } => {
            let mut removed = Vec::new();
            for id in ids {
                let book = BookId::new(id);
                if db.remove_book(&book).map_err(|e| e.to_string())? {
                    removed.push(book);
                } else {
                    eprintln!("Not found: {}", book);
                }
            }
            print_json_or(&removed, json, || {
                println!("Removed {} book(s). Memberships update on the next run.", removed.len());
            })
        }
        Commands::Run => {
            let engine = TaxonomyEngine::new(settings.engine.clone()).map_err(|e| e.to_string())?;
            let outcome = engine.run_and_commit(&db).map_err(|e| e.to_string())?;
            let r = &outcome.report;
            print_json_or(r, json, || {
                println!("Revision {} ({} books, {}ms)", r.revision, r.books, r.duration_ms);
                println!("  Clusters: {} ({} noise)", r.clusters, r.noise);
                println!("  Categories: {}  Subcategories: {}", r.categories, r.subcategories);
                println!(
                    "  Created: {}  Reused: {}  Retired: {}  Splits: {}",
                    r.categories_created, r.categories_reused, r.categories_retired, r.splits
                );
                println!("  Memberships: {}  Unclassified: {}", r.memberships, r.unclassified);
                if r.single_category {
                    println!("  (everything landed in one category)");
                }
            })
        }
        Commands::Tree => {
            let state = db.load_state().map_err(|e| e.to_string())?;
            if json {
                return print_json_or(&state, true, || {});
            }
            print_tree(&state);
            Ok(())
        }
        Commands::Book { id } => {
            let state = db.load_state().map_err(|e| e.to_string())?;
            let book = BookId::new(id);
            let paths = state.categories_for_book(&book);
            let unclassified = state.unclassified().iter().find(|u| u.book == book);

            if json {
                let value = serde_json::json!({
                    "book": book,
                    "categories": paths,
                    "unclassified": unclassified,
                });
                return print_json_or(&value, true, || {});
            }
            if let Some(u) = unclassified {
                match u.reason.best_confidence() {
                    Some(best) => println!("{}: unclassified ({}, best {:.3})", book, u.reason.as_str(), best),
                    None => println!("{}: unclassified ({})", book, u.reason.as_str()),
                }
                return Ok(());
            }
            if paths.is_empty() {
                return Err(format!("Book not in the current taxonomy: {}", book));
            }
            for path in &paths {
                let names: Vec<String> = path
                    .ids
                    .iter()
                    .zip(&path.labels)
                    .map(|(id, label)| match label {
                        Some(l) => format!("{} {}", id, l),
                        None => id.to_string(),
                    })
                    .collect();
                println!(
                    "{}{} ({:.3})",
                    if path.primary { "* " } else { "  " },
                    names.join(" > "),
                    path.confidence
                );
            }
            Ok(())
        }
        Commands::Category { id } => {
            let id: CategoryId = id.parse().map_err(|e: libris_lib::TaxonomyError| e.to_string())?;
            let state = db.load_state().map_err(|e| e.to_string())?;
            let view = state
                .category_view(id)
                .ok_or_else(|| format!("Unknown category: {}", id))?;
            print_json_or(&view, json, || {
                println!("{} {}", view.node.id, describe(&view.node));
                if let Some(parent) = view.node.parent {
                    println!("  Parent: {}", parent);
                }
                if !view.children.is_empty() {
                    let children: Vec<String> = view.children.iter().map(|c| c.to_string()).collect();
                    println!("  Children: {}", children.join(", "));
                }
                if let Some(from) = view.node.split_from {
                    println!("  Split from: {}", from);
                }
                for m in &view.members {
                    println!("  {}{} ({:.3})", if m.primary { "* " } else { "  " }, m.book, m.confidence);
                }
                println!("  {} book(s) including subcategories", view.all_members.len());
            })
        }
        Commands::PendingLabels => {
            let state = db.load_state().map_err(|e| e.to_string())?;
            let pending = state.nodes_needing_labels();
            print_json_or(&pending, json, || {
                for node in &pending {
                    println!("{} {}", node.id, describe(node));
                }
                eprintln!("{} pending", pending.len());
            })
        }
        Commands::Label { file } => {
            let content = fs::read_to_string(&file).map_err(|e| format!("{}: {}", file.display(), e))?;
            let raw: HashMap<String, String> =
                serde_json::from_str(&content).map_err(|e| format!("{}: {}", file.display(), e))?;
            let mut labels = HashMap::with_capacity(raw.len());
            for (key, label) in raw {
                let id: CategoryId = key.parse().map_err(|e: libris_lib::TaxonomyError| e.to_string())?;
                labels.insert(id, label);
            }
            let report = db.apply_labels(&labels).map_err(|e| e.to_string())?;
            print_json_or(&report, json, || {
                println!("Applied {} label(s)", report.applied.len());
                for (id, why) in &report.rejected {
                    println!("  Rejected {}: {:?}", id, why);
                }
            })
        }
        Commands::History { limit } => {
            let runs = db.recent_runs(limit).map_err(|e| e.to_string())?;
            print_json_or(&runs, json, || {
                for run in &runs {
                    let when = chrono::DateTime::from_timestamp_millis(run.committed_at)
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_default();
                    println!(
                        "r{} {} {} books +{} ={} -{} splits:{} unclassified:{}",
                        run.revision,
                        when,
                        run.books,
                        run.categories_created,
                        run.categories_reused,
                        run.categories_retired,
                        run.splits,
                        run.unclassified
                    );
                }
            })
        }
        // Printed before the database is opened
        Commands::Config => Ok(()),
    }
}

// ============================================================================
// Handlers
// ============================================================================

fn handle_import(file: &Path, db: &TaxonomyStore, json: bool) -> Result<(), String> {
    let reader = BufReader::new(File::open(file).map_err(|e| format!("{}: {}", file.display(), e))?);
    let mut books = Vec::new();

    for (line_no, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| e.to_string())?;
        if line.trim().is_empty() {
            continue;
        }
        let record: ImportRecord = serde_json::from_str(&line)
            .map_err(|e| format!("{}:{}: {}", file.display(), line_no + 1, e))?;
        let id = match (record.id, &record.path) {
            (Some(id), _) => BookId::new(id),
            (None, Some(path)) => BookId::from_path(path),
            (None, None) => {
                return Err(format!("{}:{}: record needs an id or a path", file.display(), line_no + 1));
            }
        };
        let mut book = Book::new(id, record.embedding);
        book.title = record.title;
        books.push(book);
    }

    db.upsert_books(&books).map_err(|e| e.to_string())?;
    let total = db.book_count().map_err(|e| e.to_string())?;

    let summary = serde_json::json!({ "imported": books.len(), "total": total });
    print_json_or(&summary, json, || {
        println!("Imported {} book(s), {} in store", books.len(), total);
    })
}

fn print_tree(state: &TaxonomyState) {
    let roots = state.roots();
    if roots.is_empty() {
        println!("(no categories yet, run `libris-cli run`)");
    }
    for root in roots {
        println!("{} {} [{}]", root.id, describe(root), root.member_count);
        for child in state.children(root.id) {
            println!("  {} {} [{}]", child.id, describe(child), child.member_count);
        }
    }
    let unclassified = state.unclassified().len();
    if unclassified > 0 {
        println!("{} unclassified", unclassified);
    }
}

fn describe(node: &CategoryNode) -> String {
    if node.label.is_some() && node.label_stale {
        format!("{} (stale)", node.display_label())
    } else {
        node.display_label().to_string()
    }
}

/// JSON when asked for, otherwise the human-readable printer.
fn print_json_or<T: serde::Serialize>(value: &T, json: bool, human: impl FnOnce()) -> Result<(), String> {
    if json {
        let out = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
        println!("{}", out);
    } else {
        human();
    }
    Ok(())
}
