//! Formlink: linked subforms for XML form instances.
//!
//! A parent form instance can carry directives on its nodes:
//!
//! - `saveForm="<form id>"` asks for a child instance of that form
//! - `saveInstance="<child path>"` copies the node's value into the child
//! - `deleteForm` deletes the instance it sits in, with all its descendants
//!
//! Each save of an instance runs a management pass ([`subforms::SubformManager`])
//! that creates, updates and deletes children to match the directives, and
//! pushes mapped values back into the instance's own parent.
//!
//! # Examples
//!
//! ```bash
//! formlink init
//! formlink form add household.xml
//! formlink form add person.xml
//! formlink instance new --form household
//! formlink manage --instance 1 --dry-run
//! formlink delete-repeat --instance 1 --index 2
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: storage plumbing, configuration, errors, XML documents
//! - [`subforms`]: directives, relationship store, propagation engine

pub mod core;
pub mod subforms;

use crate::core::{config, error::FormlinkError, time, workspace::Workspace};
use subforms::{
    Catalog, InstanceId, InstanceStore, SubformActionResult, SubformManager,
    definition::FormDefinition, directive,
};

use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::json;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(
    name = "formlink",
    version = env!("CARGO_PKG_VERSION"),
    about = "Linked subforms for XML form instances"
)]
struct Cli {
    /// Workspace directory (defaults to current working directory).
    #[clap(long, global = true)]
    root: Option<PathBuf>,
    /// Output format: 'text' or 'json'.
    #[clap(long, global = true, default_value = "text")]
    format: String,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the workspace layout and a default `formlink.toml`.
    Init,
    /// Form template registry.
    Form(FormCli),
    /// Form instances.
    Instance(InstanceCli),
    /// Run a subform management pass over a saved instance.
    Manage(ManageCli),
    /// Remove one repeat occurrence's child and renumber the links above it.
    DeleteRepeat {
        #[clap(long)]
        instance: InstanceId,
        /// 1-based repeat index that was removed.
        #[clap(long)]
        index: i64,
        #[clap(long)]
        dry_run: bool,
    },
    /// Show the links of an instance.
    Links {
        #[clap(long)]
        instance: InstanceId,
    },
    /// Show the live directives of a saved instance.
    Directives {
        #[clap(long)]
        instance: InstanceId,
    },
}

#[derive(clap::Args, Debug)]
struct FormCli {
    #[clap(subcommand)]
    command: FormCommand,
}

#[derive(Subcommand, Debug)]
enum FormCommand {
    /// Copy a template into the workspace and register it.
    Add { file: PathBuf },
}

#[derive(clap::Args, Debug)]
struct InstanceCli {
    #[clap(subcommand)]
    command: InstanceCommand,
}

#[derive(Subcommand, Debug)]
enum InstanceCommand {
    /// Create a blank instance of a registered form.
    New {
        #[clap(long)]
        form: String,
        /// Display name; defaults to the form title.
        #[clap(long, default_value = "")]
        title: String,
    },
    /// List all instances.
    List,
}

#[derive(clap::Args, Debug)]
#[clap(group(clap::ArgGroup::new("target").required(true).args(["instance", "path", "form"])))]
struct ManageCli {
    #[clap(long)]
    instance: Option<InstanceId>,
    /// Instance file path.
    #[clap(long)]
    path: Option<PathBuf>,
    /// Newest instance of this form id.
    #[clap(long)]
    form: Option<String>,
    /// Report what would change without writing anything.
    #[clap(long)]
    dry_run: bool,
}

pub fn run() -> Result<(), FormlinkError> {
    let cli = Cli::parse();
    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir()?,
    };
    if matches!(cli.command, Command::Init) {
        fs::create_dir_all(&root)?;
    }
    let root = fs::canonicalize(&root)
        .map_err(|e| FormlinkError::NotFound(format!("workspace {}: {}", root.display(), e)))?;
    let workspace = Workspace::open(&root)?;
    init_tracing(&workspace.config.logging.filter);
    let json_output = cli.format == "json";

    match cli.command {
        Command::Init => {
            workspace.ensure_layout()?;
            let config_path = root.join(config::CONFIG_FILE_NAME);
            let wrote_config = !config_path.exists();
            if wrote_config {
                let text = toml::to_string_pretty(&workspace.config)
                    .map_err(|e| FormlinkError::ConfigError(e.to_string()))?;
                fs::write(&config_path, text)?;
            }
            Catalog::open(&workspace.catalog_db_path())?;
            subforms::RelationStore::open(&workspace.relations_db_path())?;
            emit(
                json_output,
                time::command_envelope(
                    "init",
                    "ok",
                    json!({ "root": root, "wrote_config": wrote_config }),
                ),
                || println!("{} {}", "Initialized".bright_green(), root.display()),
            )
        }
        Command::Form(form_cli) => run_form_cli(&workspace, form_cli, json_output),
        Command::Instance(instance_cli) => run_instance_cli(&workspace, instance_cli, json_output),
        Command::Manage(manage) => {
            let (catalog, manager) = open_manager(&workspace)?;
            let instance_id = resolve_target(catalog.as_ref(), &manage)?;
            let result = manager.manage_saved_instance(instance_id, manage.dry_run)?;
            report_result("manage", instance_id, manage.dry_run, &result, json_output)
        }
        Command::DeleteRepeat {
            instance,
            index,
            dry_run,
        } => {
            let (_, manager) = open_manager(&workspace)?;
            let result = manager.delete_repeat(instance, index, dry_run)?;
            report_result("delete-repeat", instance, dry_run, &result, json_output)
        }
        Command::Links { instance } => {
            let relations = subforms::RelationStore::open(&workspace.relations_db_path())?;
            let parent = relations.parent_of(instance)?;
            let links = relations.records_for_parent(instance)?;
            emit(
                json_output,
                time::command_envelope(
                    "links",
                    "ok",
                    json!({ "instance": instance, "parent": parent, "links": links }),
                ),
                || {
                    match parent {
                        Some(p) => println!("parent: {}", p.to_string().bright_white()),
                        None => println!("parent: {}", "none".dimmed()),
                    }
                    for link in &links {
                        let node = if link.child_node.is_empty() {
                            "(form link)".dimmed().to_string()
                        } else {
                            link.child_node.clone()
                        };
                        println!(
                            "  {} -> #{} {}",
                            link.parent_node.bright_cyan(),
                            link.child_id,
                            node
                        );
                    }
                },
            )
        }
        Command::Directives { instance } => {
            let (_, manager) = open_manager(&workspace)?;
            let tree = manager.live_tree(instance)?;
            let found = directive::discover_live(&tree);
            let rows: Vec<_> = found
                .iter()
                .map(|d| {
                    json!({
                        "kind": d.kind,
                        "value": d.attribute_value,
                        "node": d.node_xpath,
                        "relevant": d.is_relevant,
                        "repeat_index": d.repeat_index(),
                    })
                })
                .collect();
            emit(
                json_output,
                time::command_envelope("directives", "ok", json!({ "directives": rows })),
                || {
                    for d in &found {
                        let marker = if d.is_relevant {
                            "●".bright_green()
                        } else {
                            "○".dimmed()
                        };
                        println!(
                            "  {} {:<12} {} {}",
                            marker,
                            d.kind.attribute_name(),
                            d.node_xpath,
                            d.attribute_value.bright_white()
                        );
                    }
                },
            )
        }
    }
}

fn run_form_cli(
    workspace: &Workspace,
    cli: FormCli,
    json_output: bool,
) -> Result<(), FormlinkError> {
    match cli.command {
        FormCommand::Add { file } => {
            let definition = FormDefinition::load(&file)?;
            workspace.ensure_layout()?;
            let target = workspace
                .forms_dir()
                .join(format!("{}.xml", definition.form_id));
            fs::copy(&file, &target)?;
            let catalog = Catalog::open(&workspace.catalog_db_path())?;
            catalog.register_form(
                &definition.form_id,
                definition.version.as_deref(),
                &definition.title,
                &target,
            )?;
            emit(
                json_output,
                time::command_envelope(
                    "form.add",
                    "ok",
                    json!({ "form_id": definition.form_id, "path": target }),
                ),
                || {
                    println!(
                        "{} form {} ({})",
                        "Registered".bright_green(),
                        definition.form_id.bright_white(),
                        definition.title
                    )
                },
            )
        }
    }
}

fn run_instance_cli(
    workspace: &Workspace,
    cli: InstanceCli,
    json_output: bool,
) -> Result<(), FormlinkError> {
    match cli.command {
        InstanceCommand::New { form, title } => {
            let (catalog, manager) = open_manager(workspace)?;
            let (id, path) = subforms::creation::create_instance(
                catalog.as_ref(),
                catalog.as_ref(),
                manager.definitions(),
                manager.instances_dir(),
                &form,
                &title,
            )?;
            emit(
                json_output,
                time::command_envelope(
                    "instance.new",
                    "ok",
                    json!({ "id": id, "form_id": form, "path": path }),
                ),
                || println!("{} instance #{} at {}", "Created".bright_green(), id, path.display()),
            )
        }
        InstanceCommand::List => {
            let catalog = Catalog::open(&workspace.catalog_db_path())?;
            let instances = catalog.list_instances()?;
            emit(
                json_output,
                time::command_envelope("instance.list", "ok", json!({ "instances": instances })),
                || {
                    if instances.is_empty() {
                        println!("No instances yet.");
                    }
                    for inst in &instances {
                        println!(
                            "  #{:<4} {:<16} {:<18} {}",
                            inst.id,
                            inst.form_id,
                            inst.status.as_str(),
                            inst.display_name
                        );
                    }
                },
            )
        }
    }
}

fn open_manager(workspace: &Workspace) -> Result<(Arc<Catalog>, SubformManager), FormlinkError> {
    let catalog = Arc::new(Catalog::open(&workspace.catalog_db_path())?);
    let manager = SubformManager::for_workspace(workspace, Arc::clone(&catalog))?;
    Ok((catalog, manager))
}

fn resolve_target(catalog: &Catalog, manage: &ManageCli) -> Result<InstanceId, FormlinkError> {
    if let Some(id) = manage.instance {
        return Ok(id);
    }
    if let Some(path) = &manage.path {
        let path = fs::canonicalize(path).unwrap_or_else(|_| path.clone());
        return catalog
            .id_from_path(&path)?
            .ok_or_else(|| FormlinkError::NotFound(format!("instance at {}", path.display())));
    }
    match &manage.form {
        Some(form_id) => catalog
            .id_from_form_id(form_id, true)?
            .ok_or_else(|| FormlinkError::NotFound(format!("instance of form {}", form_id))),
        None => Err(FormlinkError::ValidationError(
            "one of --instance, --path or --form is required".to_string(),
        )),
    }
}

fn report_result(
    cmd: &str,
    instance_id: InstanceId,
    dry_run: bool,
    result: &SubformActionResult,
    json_output: bool,
) -> Result<(), FormlinkError> {
    let status = if result.error.is_some() { "partial" } else { "ok" };
    emit(
        json_output,
        time::command_envelope(
            cmd,
            status,
            json!({ "instance": instance_id, "dry_run": dry_run, "result": result }),
        ),
        || {
            let prefix = if dry_run { "[dry-run] " } else { "" };
            println!(
                "{}instance #{}: {} created, {} updated, {} deleted",
                prefix, instance_id, result.created, result.updated, result.deleted
            );
            if result.self_destruct {
                println!("  {}", "instance deleted itself".bright_yellow());
            }
            if let Some(err) = &result.error {
                println!("  {} {}", "error:".bright_red(), err);
            }
        },
    )
}

fn emit(
    json_output: bool,
    envelope: serde_json::Value,
    text: impl FnOnce(),
) -> Result<(), FormlinkError> {
    if json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(&envelope)
                .map_err(|e| FormlinkError::ValidationError(e.to_string()))?
        );
    } else {
        text();
    }
    Ok(())
}

/// Logs go to stderr. `RUST_LOG` overrides the configured filter.
fn init_tracing(configured: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(configured))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

