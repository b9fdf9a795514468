//! Durable variables over the embedded SQLite backend
//!
//! Run this example twice: the first run writes, every later run finds the
//! values it left behind (and increments a restart counter).

use anyhow::Context;
use varstore::{ConfigSection, SqlStorage, SqliteDialect, Value, VariablePath, Variables};

fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init();

    let mut vars = Variables::new();

    // An embedded backend needs only a file; "commit changes" switches it
    // to periodic batched commits.
    let section = ConfigSection::new()
        .with("file", "./example_variables.db")
        .with("commit changes", "1 second");
    let storage = SqlStorage::new("database", SqliteDialect::new(), &section, vars.registry())
        .context("opening the variables database")?;
    vars.register_storage(Box::new(storage), &[])?;
    println!("Storage registered and loaded");

    // Count restarts across runs
    let restarts = VariablePath::parse("restarts")?;
    let count = match vars.get_value(&restarts, None)? {
        Some(Value::Long(n)) => n + 1,
        _ => 1,
    };
    vars.set(&restarts, None, Value::from(count))?;
    println!("This program has started {} time(s)", count);

    // Durable player data addressed through nested paths
    vars.set(
        &VariablePath::parse("stats::alice::kills")?,
        None,
        Value::from(3i64),
    )?;
    println!(
        "stats::alice::kills => {:?}",
        vars.get_value(&VariablePath::parse("stats::alice::kills")?, None)?
    );

    // Close drains the write queue and joins the background threads
    vars.close()?;
    println!("Closed cleanly; run again to see the counter grow");

    Ok(())
}
