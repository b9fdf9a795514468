//! Basic usage example for varstore
//!
//! This example demonstrates the fundamental operations:
//! - Creating the variable engine
//! - Setting and reading global variables
//! - Local variables scoped to one execution context
//! - List variables addressed through nested paths

use varstore::{Ctx, Value, VariablePath, Variables};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::init();

    let mut vars = Variables::new();
    println!("Variable engine ready");

    // Set some global variables
    println!("Writing globals...");
    vars.set(&VariablePath::parse("motd")?, None, Value::from("welcome"))?;
    vars.set(&VariablePath::parse("spawn::x")?, None, Value::from(100i64))?;
    vars.set(&VariablePath::parse("spawn::y")?, None, Value::from(64i64))?;

    if let Some(motd) = vars.get_value(&VariablePath::parse("motd")?, None)? {
        println!("motd => {}", motd);
    }

    // Local variables live inside one execution context
    let ctx = Ctx::new();
    let counter = VariablePath::parse("_counter")?;
    vars.set(&counter, Some(&ctx), Value::from(1i64))?;
    println!(
        "local _counter => {:?}",
        vars.get_value(&counter, Some(&ctx))?
    );

    // Another context cannot see it
    let other = Ctx::new();
    match vars.get_value(&counter, Some(&other))? {
        Some(_) => println!("leaked local variable (unexpected)"),
        None => println!("locals are isolated per execution"),
    }

    // Build a list by appending
    let colors = VariablePath::parse("colors")?;
    for color in ["red", "green", "blue"] {
        vars.append(&colors, None, Value::from(color))?;
    }
    println!(
        "colors::1 => {:?}",
        vars.get_value(&VariablePath::parse("colors::1")?, None)?
    );

    // Tear down the execution contexts, then the engine
    vars.end_context(&ctx);
    vars.end_context(&other);
    vars.close()?;
    println!("Engine closed");

    Ok(())
}
