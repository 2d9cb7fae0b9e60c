//! CLI smoke entry point.
//!
//! # Responsibility
//! - Open a repository from an optional JSON config path.
//! - Define a demo class, then create, update, revert and evolve one
//!   instance, printing each step.

use resbase_core::handler::{AttributeHandlerRegistry, HandlerContext};
use resbase_core::{
    core_version, init_logging_from_config, open_with_config, AttributeSpec, AttributeValue,
    NewResource, RawValue, RepositoryConfig, ResourceRepository, ResourceService, SchemaService,
    StorageKind,
};
use std::error::Error;
use std::process::ExitCode;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("resbase: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => RepositoryConfig::from_json_file(path)?,
        None => RepositoryConfig::default(),
    };
    init_logging_from_config(&config)?;
    println!("resbase_core version={}", core_version());

    let conn = open_with_config(&config)?;
    let registry = AttributeHandlerRegistry::builtin(HandlerContext::default());
    let repository = ResourceRepository::open(&conn, &registry, config.preload_attribute_values)?;
    let schema = SchemaService::new(&conn, &repository);
    let resources = ResourceService::new(&conn, &repository);

    if repository.schema().class_by_name("task").is_err() {
        schema.define_class("task", &[], StorageKind::Table, false)?;
        let title = AttributeSpec::new("title", "string").required();
        schema.add_attribute("task", title, RawValue::Null)?;
        schema.add_attribute("task", AttributeSpec::new("done", "boolean"), RawValue::Null)?;
    }

    let task = resources.create(
        NewResource::new("task", "demo")
            .value("title", "write the smoke test")
            .value("done", false),
    )?;
    println!("created {} title={:?}", task.id(), task.get(&conn, "title")?);

    task.set(&conn, "done", true)?;
    resources.update(&task)?;
    println!("updated done={:?}", task.get(&conn, "done")?);

    task.set(&conn, "title", "unsaved edit")?;
    resources.revert(&task)?;
    println!("reverted title={:?}", task.get(&conn, "title")?);

    if repository.schema().class_by_name("task")?.attribute("priority").is_none() {
        schema.add_attribute(
            "task",
            AttributeSpec::new("priority", "integer"),
            AttributeValue::Integer(3),
        )?;
    }
    println!("evolved priority={:?}", task.get(&conn, "priority")?);

    let stats = repository.cache().stats();
    println!(
        "cache classes={} live={} dead={}",
        stats.classes, stats.live, stats.dead
    );
    Ok(())
}
