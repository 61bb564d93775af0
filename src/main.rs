use anyhow::{bail, Context, Result};
use std::env;
use std::path::Path;

use waterfall::config::DEFAULT_CONFIG_FILE;
use waterfall::{
    load_merge_plan, open_database, record_merge, Config, MergeEngine, MergeReport,
    SqliteStore, Value,
};

const USAGE: &str = "usage:
  waterfall relations <table>
  waterfall plan <table> <obsolete_id>
  waterfall merge <table> <obsolete_id> <surviving_id>
  waterfall batch <plan.csv>";

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    let config = Config::load(Path::new(DEFAULT_CONFIG_FILE))?;
    waterfall::logging::init_logging(&config.log_level, config.log_format)?;

    match args.get(1).map(String::as_str) {
        Some("relations") if args.len() == 3 => run_relations(&config, &args[2]),
        Some("plan") if args.len() == 4 => run_plan(&config, &args[2], &args[3]),
        Some("merge") if args.len() == 5 => run_merge(&config, &args[2], &args[3], &args[4]),
        Some("batch") if args.len() == 3 => run_batch(&config, Path::new(&args[2])),
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    }
}

fn run_relations(config: &Config, table: &str) -> Result<()> {
    let conn = open_database(&config.database)?;
    let engine = MergeEngine::for_sqlite(&conn, config.merge.clone())?;

    let relations = engine.index().relations_referencing(table);
    if relations.is_empty() {
        println!("Nothing references {}", table);
        return Ok(());
    }

    println!("🔗 {} relation(s) reference {}:", relations.len(), table);
    for relation in relations {
        println!(
            "   {}.{} → {}.{}",
            relation.referencing_type, relation.field, relation.target_type, relation.target_field
        );
    }
    Ok(())
}

fn run_plan(config: &Config, table: &str, obsolete_id: &str) -> Result<()> {
    let conn = open_database(&config.database)?;
    let engine = MergeEngine::for_sqlite(&conn, config.merge.clone())?;
    let store = SqliteStore::new(&conn);

    let obsolete = engine.fetch_required(&store, table, &Value::parse_identity(obsolete_id))?;
    let related = engine.plan_merge(&store, &obsolete)?;

    println!("🔍 Merging {} {} would touch {} record(s):", table, obsolete_id, related.len());
    for r in &related {
        println!(
            "   {} {} (via {})",
            r.record.entity_type(),
            r.record.identity(),
            r.relation.field
        );
    }
    Ok(())
}

fn run_merge(config: &Config, table: &str, obsolete_id: &str, surviving_id: &str) -> Result<()> {
    println!("🌊 Waterfall - merging {} {} into {}", table, obsolete_id, surviving_id);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let conn = open_database(&config.database)?;
    let engine = MergeEngine::for_sqlite(&conn, config.merge.clone())?;
    let store = SqliteStore::new(&conn);

    let report = engine
        .merge_by_identity(
            &store,
            table,
            &Value::parse_identity(obsolete_id),
            &Value::parse_identity(surviving_id),
        )
        .map_err(|e| anyhow::anyhow!("Merge failed during {}: {}", e.stage().as_str(), e))?;

    record_merge(&conn, &report, "waterfall-cli")?;
    print_report(&report);
    Ok(())
}

fn run_batch(config: &Config, plan_path: &Path) -> Result<()> {
    println!("📋 Waterfall - batch merge from {}", plan_path.display());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let plan = load_merge_plan(plan_path)?;
    println!("✓ Loaded {} merge(s)", plan.len());

    let conn = open_database(&config.database)?;
    let engine = MergeEngine::for_sqlite(&conn, config.merge.clone())?;
    let store = SqliteStore::new(&conn);

    let mut failed = 0;
    for step in &plan {
        println!(
            "\n▶ line {}: {} {} → {}",
            step.line, step.entity_type, step.obsolete, step.surviving
        );
        match engine.merge_by_identity(&store, &step.entity_type, &step.obsolete, &step.surviving)
        {
            Ok(report) => {
                record_merge(&conn, &report, "waterfall-batch")
                    .with_context(|| format!("Failed to log merge on line {}", step.line))?;
                print_report(&report);
            }
            Err(e) => {
                failed += 1;
                eprintln!("❌ {} failed: {}", e.stage().as_str(), e);
            }
        }
    }

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    if failed > 0 {
        bail!("{} of {} merges failed", failed, plan.len());
    }
    println!("✅ All {} merges complete", plan.len());
    Ok(())
}

fn print_report(report: &MergeReport) {
    println!("✓ Repointed: {}", report.repointed);
    println!("✓ Deleted as duplicate: {}", report.deleted);
    println!("✓ Unchanged: {}", report.unchanged);
    if report.obsolete_deleted {
        println!("✓ Removed {} {}", report.entity_type, report.obsolete);
    }
}
