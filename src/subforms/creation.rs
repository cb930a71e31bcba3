//! Programmatic creation of a new instance of a form template.
//!
//! This is the non-interactive twin of opening a blank form: resolve the
//! template, get its parsed definition (cached when possible), build the
//! initial instance, save it once into its own folder and register it as
//! `incomplete`.

use crate::core::error::FormlinkError;
use crate::core::xml::{self, Element};
use crate::subforms::catalog::{FormStore, InstanceStore};
use crate::subforms::definition::{DefinitionCache, FormDefinition};
use crate::subforms::relations::InstanceId;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A blank instance that has not been written anywhere yet.
#[derive(Debug, Clone)]
pub struct PreparedInstance {
    pub definition: Arc<FormDefinition>,
    pub document: Element,
}

/// Resolve `form_id` and build its initial document in memory.
///
/// Fails with `FormNotFound` when no template is registered for the id or
/// its file is gone.
pub fn prepare_instance(
    forms: &dyn FormStore,
    cache: &DefinitionCache,
    form_id: &str,
) -> Result<PreparedInstance, FormlinkError> {
    let form_path = forms
        .form_path(form_id)?
        .filter(|p| p.is_file())
        .ok_or_else(|| FormlinkError::FormNotFound(form_id.to_string()))?;
    let definition = cache.get_or_load(&form_path)?;
    let document = definition.fresh_instance();
    Ok(PreparedInstance {
        definition,
        document,
    })
}

/// Write `document` into a new instance folder and register it.
pub fn persist_instance(
    instances: &dyn InstanceStore,
    instances_dir: &Path,
    form_id: &str,
    title: &str,
    document: &Element,
) -> Result<(InstanceId, PathBuf), FormlinkError> {
    let (dir, file) = allocate_instance_path(instances_dir, form_id)?;
    fs::create_dir_all(&dir)?;
    xml::write_document(&file, document)?;
    let id = instances.create(form_id, &file, title)?;
    tracing::info!(instance_id = id, form_id, path = %file.display(), "instance created");
    Ok((id, file))
}

/// `prepare_instance` followed by `persist_instance`, titled with the
/// template title when `title` is empty.
pub fn create_instance(
    forms: &dyn FormStore,
    instances: &dyn InstanceStore,
    cache: &DefinitionCache,
    instances_dir: &Path,
    form_id: &str,
    title: &str,
) -> Result<(InstanceId, PathBuf), FormlinkError> {
    let prepared = prepare_instance(forms, cache, form_id)?;
    let title = if title.is_empty() {
        prepared.definition.title.as_str()
    } else {
        title
    };
    persist_instance(instances, instances_dir, form_id, title, &prepared.document)
}

fn sanitize(form_id: &str) -> String {
    form_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// `<instances_dir>/<form>_<n>/<form>_<n>.xml` with the first free `n`.
fn allocate_instance_path(
    instances_dir: &Path,
    form_id: &str,
) -> Result<(PathBuf, PathBuf), FormlinkError> {
    fs::create_dir_all(instances_dir)?;
    let stem = sanitize(form_id);
    for n in 1.. {
        let name = format!("{}_{}", stem, n);
        let dir = instances_dir.join(&name);
        if !dir.exists() {
            let file = dir.join(format!("{}.xml", name));
            return Ok((dir, file));
        }
    }
    Err(FormlinkError::ValidationError(format!(
        "no free instance folder for form '{}'",
        form_id
    )))
}
