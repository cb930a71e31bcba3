//! Subform propagation engine.
//!
//! A management pass over one instance runs in this order:
//!
//! 1. Parent sync: values this instance feeds back to its own parent are
//!    written into the parent document.
//! 2. Self deletion: a relevant `deleteForm` directive deletes this instance
//!    and every descendant, and the pass ends with `self_destruct`.
//! 3. Child management, grouped by repeat index: stale children are deleted
//!    first, then every group with a relevant `saveForm` gets its child
//!    created or updated from the `saveInstance` values.
//!
//! With `dry_run` every read and comparison still happens, but no document,
//! status, link or instance is written or deleted, so the returned counts
//! match what the same pass would do for real.

use crate::core::error::FormlinkError;
use crate::core::workspace::Workspace;
use crate::core::xml::{self, Element};
use crate::subforms::catalog::{FormStore, InstanceStatus, InstanceStore};
use crate::subforms::creation;
use crate::subforms::definition::DefinitionCache;
use crate::subforms::directive::{self, DirectiveKind, FormNode, SubformDirective, TreeNode};
use crate::subforms::media;
use crate::subforms::relations::{
    InstanceId, RelationStore, RelationshipRecord, FORM_LINK_NODE,
};
use crate::subforms::result::{ActionError, SubformActionResult};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

pub struct SubformManager {
    relations: RelationStore,
    instances: Arc<dyn InstanceStore>,
    forms: Arc<dyn FormStore>,
    definitions: DefinitionCache,
    instances_dir: PathBuf,
    media_extensions: Vec<String>,
    /// Serializes `manage_relationships` and `delete_repeat`.
    guard: Mutex<()>,
}

/// Where a child document came from during a create/update.
enum ChildSource {
    Existing { id: InstanceId, path: PathBuf },
    New { title: String },
}

impl SubformManager {
    pub fn new(
        relations: RelationStore,
        instances: Arc<dyn InstanceStore>,
        forms: Arc<dyn FormStore>,
        instances_dir: &Path,
        media_extensions: Vec<String>,
    ) -> Self {
        Self {
            relations,
            instances,
            forms,
            definitions: DefinitionCache::new(),
            instances_dir: instances_dir.to_path_buf(),
            media_extensions,
            guard: Mutex::new(()),
        }
    }

    /// Wire a manager to a workspace's relation store and the given catalog.
    pub fn for_workspace<C>(workspace: &Workspace, catalog: Arc<C>) -> Result<Self, FormlinkError>
    where
        C: InstanceStore + FormStore + 'static,
    {
        let relations = RelationStore::open(&workspace.relations_db_path())?;
        Ok(Self::new(
            relations,
            catalog.clone(),
            catalog,
            &workspace.instances_dir(),
            workspace.config.media.extensions.clone(),
        ))
    }

    pub fn relations(&self) -> &RelationStore {
        &self.relations
    }

    pub fn definitions(&self) -> &DefinitionCache {
        &self.definitions
    }

    pub fn instances_dir(&self) -> &Path {
        &self.instances_dir
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, FormlinkError> {
        self.guard.lock().map_err(|_| {
            FormlinkError::ValidationError("subform manager lock poisoned".to_string())
        })
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Run a full management pass for `instance_id` whose current form-engine
    /// tree is `tree`.
    pub fn manage_relationships(
        &self,
        instance_id: InstanceId,
        tree: &dyn FormNode,
        dry_run: bool,
    ) -> Result<SubformActionResult, FormlinkError> {
        let _guard = self.lock()?;
        let directives = directive::discover_live(tree);
        tracing::debug!(instance_id, directives = directives.len(), dry_run, "managing subforms");

        let mut result = self.manage_parent_form(instance_id, dry_run)?;

        if directives
            .iter()
            .any(|d| d.kind == DirectiveKind::DeleteForm && d.is_relevant)
        {
            tracing::info!(instance_id, dry_run, "delete-form directive is relevant; removing instance");
            let removed = self.delete_instance_tree(instance_id, dry_run)?;
            return Ok(result + SubformActionResult::self_destructed(removed.len() as u32));
        }

        if directives
            .iter()
            .any(|d| matches!(d.kind, DirectiveKind::SaveForm | DirectiveKind::SaveInstance))
        {
            result += self.manage_child_forms(instance_id, &directives, dry_run)?;
        }

        tracing::info!(
            instance_id,
            dry_run,
            created = result.created,
            updated = result.updated,
            deleted = result.deleted,
            "subform pass finished"
        );
        Ok(result)
    }

    /// The user removed repeat occurrence `repeat_index` from `parent_id`:
    /// delete the child linked there and shift the links above it down.
    pub fn delete_repeat(
        &self,
        parent_id: InstanceId,
        repeat_index: i64,
        dry_run: bool,
    ) -> Result<SubformActionResult, FormlinkError> {
        if repeat_index < 1 {
            return Err(FormlinkError::ValidationError(format!(
                "repeat index must be 1 or greater, got {}",
                repeat_index
            )));
        }
        let _guard = self.lock()?;
        let mut result = SubformActionResult::default();
        if let Some(child_id) = self.relations.child_for(parent_id, repeat_index)? {
            let removed = self.delete_instance_tree(child_id, dry_run)?;
            result += SubformActionResult::deleted(removed.len() as u32);
        }
        if !dry_run {
            let renumbered = self
                .relations
                .renumber_after_deletion(parent_id, repeat_index)?;
            tracing::debug!(parent_id, repeat_index, renumbered, "links renumbered");
        }
        Ok(result)
    }

    /// Run `manage_relationships` on a dedicated worker thread.
    pub fn spawn_manage<T>(
        self: &Arc<Self>,
        instance_id: InstanceId,
        tree: T,
        dry_run: bool,
    ) -> Result<JoinHandle<Result<SubformActionResult, FormlinkError>>, FormlinkError>
    where
        T: FormNode + Send + 'static,
    {
        let manager = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("subforms-{}", instance_id))
            .spawn(move || manager.manage_relationships(instance_id, &tree, dry_run))?;
        Ok(handle)
    }

    /// Build the form-engine tree of a saved instance from its document and
    /// its template.
    pub fn live_tree(&self, instance_id: InstanceId) -> Result<TreeNode, FormlinkError> {
        let path = self
            .instances
            .path_of(instance_id)?
            .ok_or_else(|| FormlinkError::NotFound(format!("instance {}", instance_id)))?;
        let form_id = self
            .instances
            .form_id_of(instance_id)?
            .ok_or_else(|| FormlinkError::NotFound(format!("instance {}", instance_id)))?;
        let form_path = self
            .forms
            .form_path(&form_id)?
            .ok_or(FormlinkError::FormNotFound(form_id))?;
        let definition = self.definitions.get_or_load(&form_path)?;
        let document = xml::read_document(&path)?;
        Ok(definition.live_tree(&document))
    }

    /// `manage_relationships` against the saved state of `instance_id`.
    pub fn manage_saved_instance(
        &self,
        instance_id: InstanceId,
        dry_run: bool,
    ) -> Result<SubformActionResult, FormlinkError> {
        let tree = self.live_tree(instance_id)?;
        self.manage_relationships(instance_id, &tree, dry_run)
    }

    // -----------------------------------------------------------------------
    // Parent sync
    // -----------------------------------------------------------------------

    /// Push this child's mapped values into its parent document. Pairs that
    /// do not resolve on either side are skipped.
    fn manage_parent_form(
        &self,
        child_id: InstanceId,
        dry_run: bool,
    ) -> Result<SubformActionResult, FormlinkError> {
        let Some(parent_id) = self.relations.parent_of(child_id)? else {
            return Ok(SubformActionResult::default());
        };
        let mappings = self.relations.mappings_to_parent(child_id)?;
        if mappings.is_empty() {
            return Ok(SubformActionResult::default());
        }

        let Some(parent_path) = self.instances.path_of(parent_id)? else {
            tracing::warn!(parent_id, child_id, "linked parent has no instance record");
            return Ok(SubformActionResult::default());
        };
        let Some(child_path) = self.instances.path_of(child_id)? else {
            tracing::warn!(child_id, "instance has no record; skipping parent sync");
            return Ok(SubformActionResult::default());
        };
        let (mut parent_doc, child_doc) =
            match (xml::read_document(&parent_path), xml::read_document(&child_path)) {
                (Ok(p), Ok(c)) => (p, c),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::warn!(parent_id, child_id, error = %e, "cannot read documents for parent sync");
                    return Ok(SubformActionResult::default());
                }
            };

        let mut changed = false;
        for (parent_node, child_node) in &mappings {
            let Some(value) = child_doc.select(child_node).map(|e| e.text.clone()) else {
                tracing::debug!(child_id, child_node = %child_node, "mapped child node missing");
                continue;
            };
            let Some(target) = parent_doc.select_mut(parent_node) else {
                tracing::debug!(parent_id, parent_node = %parent_node, "mapped parent node missing");
                continue;
            };
            if target.text != value {
                target.text = value;
                changed = true;
            }
        }
        if !changed {
            return Ok(SubformActionResult::default());
        }

        if !dry_run {
            if let Err(e) = xml::write_document(&parent_path, &parent_doc) {
                tracing::warn!(parent_id, error = %e, "cannot write parent document");
                return Ok(SubformActionResult::default());
            }
            self.instances
                .set_status(parent_id, InstanceStatus::Incomplete)?;
        }
        tracing::debug!(parent_id, child_id, dry_run, "parent updated from child");
        Ok(SubformActionResult::updated(1))
    }

    // -----------------------------------------------------------------------
    // Deletion
    // -----------------------------------------------------------------------

    /// `root` and every instance reachable through child links, parents first.
    fn descendants_of(&self, root: InstanceId) -> Result<Vec<InstanceId>, FormlinkError> {
        let mut order = vec![root];
        let mut seen = HashSet::from([root]);
        let mut next = 0;
        while next < order.len() {
            for child in self.relations.children_of(order[next])? {
                if seen.insert(child) {
                    order.push(child);
                }
            }
            next += 1;
        }
        Ok(order)
    }

    /// Delete `root` with all descendants and every link touching them.
    /// Returns the ids that are (or in a dry run would be) removed.
    fn delete_instance_tree(
        &self,
        root: InstanceId,
        dry_run: bool,
    ) -> Result<Vec<InstanceId>, FormlinkError> {
        let doomed = self.descendants_of(root)?;
        if dry_run {
            return Ok(doomed);
        }
        for &id in &doomed {
            self.relations.delete_where_parent(id)?;
            self.relations.delete_where_child(id)?;
            if !self.instances.delete(id)? {
                tracing::debug!(instance_id = id, "instance record already gone");
            }
            tracing::info!(instance_id = id, "instance deleted");
        }
        Ok(doomed)
    }

    // -----------------------------------------------------------------------
    // Children
    // -----------------------------------------------------------------------

    fn manage_child_forms(
        &self,
        parent_id: InstanceId,
        directives: &[SubformDirective],
        dry_run: bool,
    ) -> Result<SubformActionResult, FormlinkError> {
        let mut groups: BTreeMap<i64, Vec<&SubformDirective>> = BTreeMap::new();
        for d in directives
            .iter()
            .filter(|d| d.kind != DirectiveKind::DeleteForm && !d.is_template())
        {
            groups.entry(d.repeat_index()).or_default().push(d);
        }

        let mut result = SubformActionResult::default();
        let mut removed: HashSet<InstanceId> = HashSet::new();

        for (&index, group) in &groups {
            let Some(child_id) = self.relations.child_for(parent_id, index)? else {
                continue;
            };
            let stale = match relevant_save_form(group) {
                None => true,
                Some(save_form) => {
                    let current = self.instances.form_id_of(child_id)?;
                    current.as_deref() != Some(save_form.attribute_value.as_str())
                }
            };
            if stale {
                tracing::info!(parent_id, child_id, repeat_index = index, "child no longer wanted");
                let gone = self.delete_instance_tree(child_id, dry_run)?;
                result += SubformActionResult::deleted(gone.len() as u32);
                removed.extend(gone);
            }
        }

        for (&index, group) in &groups {
            let Some(save_form) = relevant_save_form(group) else {
                continue;
            };
            let existing = self
                .relations
                .child_for(parent_id, index)?
                .filter(|id| !removed.contains(id));
            result += self.create_or_update_child(parent_id, index, save_form, group, existing, dry_run)?;
        }
        Ok(result)
    }

    fn create_or_update_child(
        &self,
        parent_id: InstanceId,
        repeat_index: i64,
        save_form: &SubformDirective,
        group: &[&SubformDirective],
        existing: Option<InstanceId>,
        dry_run: bool,
    ) -> Result<SubformActionResult, FormlinkError> {
        let form_id = save_form.attribute_value.as_str();

        let (mut document, source) = match existing {
            Some(id) => {
                let Some(path) = self.instances.path_of(id)? else {
                    tracing::warn!(parent_id, child_id = id, "linked child has no instance record");
                    return Ok(SubformActionResult::default());
                };
                match xml::read_document(&path) {
                    Ok(doc) => (doc, ChildSource::Existing { id, path }),
                    Err(e) => {
                        tracing::warn!(child_id = id, error = %e, "cannot read child document; skipping");
                        return Ok(SubformActionResult::default());
                    }
                }
            }
            None => match creation::prepare_instance(self.forms.as_ref(), &self.definitions, form_id) {
                Ok(prepared) => {
                    let title = if save_form.node_value.is_empty() {
                        prepared.definition.title.clone()
                    } else {
                        save_form.node_value.clone()
                    };
                    (prepared.document, ChildSource::New { title })
                }
                Err(FormlinkError::FormNotFound(missing)) => {
                    tracing::warn!(parent_id, form_id = %missing, "save-form id not found");
                    return Ok(SubformActionResult::failed(ActionError::MissingFormTemplate {
                        form_id: missing,
                    }));
                }
                Err(e @ (FormlinkError::IoError(_) | FormlinkError::XmlError(_) | FormlinkError::ValidationError(_))) => {
                    tracing::warn!(parent_id, form_id, error = %e, "cannot load form template; skipping");
                    return Ok(SubformActionResult::default());
                }
                Err(e) => return Err(e),
            },
        };

        let changed = match copy_values(&mut document, group) {
            Ok(changed) => changed,
            Err(xpath) => {
                tracing::warn!(parent_id, repeat_index, xpath = %xpath, "save-instance XPath not found in child");
                return Ok(SubformActionResult::failed(ActionError::MissingXPath { xpath }));
            }
        };

        match source {
            ChildSource::Existing { id, path } => {
                if changed.is_empty() {
                    return Ok(SubformActionResult::default());
                }
                if !dry_run {
                    if let Err(e) = xml::write_document(&path, &document) {
                        tracing::warn!(child_id = id, error = %e, "cannot write child document; skipping");
                        return Ok(SubformActionResult::default());
                    }
                    self.finish_child(parent_id, repeat_index, save_form, group, id, &path, &changed)?;
                    self.instances.set_status(id, InstanceStatus::Incomplete)?;
                    if !save_form.node_value.is_empty() {
                        self.instances.set_title(id, &save_form.node_value)?;
                    }
                }
                tracing::debug!(parent_id, child_id = id, values = changed.len(), dry_run, "child updated");
                Ok(SubformActionResult::updated(1))
            }
            ChildSource::New { title } => {
                if !dry_run {
                    let (id, path) = match creation::persist_instance(
                        self.instances.as_ref(),
                        &self.instances_dir,
                        form_id,
                        &title,
                        &document,
                    ) {
                        Ok(created) => created,
                        Err(e @ (FormlinkError::IoError(_) | FormlinkError::XmlError(_))) => {
                            tracing::warn!(parent_id, form_id, error = %e, "cannot write new child; skipping");
                            return Ok(SubformActionResult::default());
                        }
                        Err(e) => return Err(e),
                    };
                    self.finish_child(parent_id, repeat_index, save_form, group, id, &path, &changed)?;
                }
                Ok(SubformActionResult::created(1))
            }
        }
    }

    /// Attachments and links for a child whose document was just written.
    #[allow(clippy::too_many_arguments)]
    fn finish_child(
        &self,
        parent_id: InstanceId,
        repeat_index: i64,
        save_form: &SubformDirective,
        group: &[&SubformDirective],
        child_id: InstanceId,
        child_path: &Path,
        changed_values: &[String],
    ) -> Result<(), FormlinkError> {
        let parent_dir = self
            .instances
            .path_of(parent_id)?
            .and_then(|p| p.parent().map(Path::to_path_buf));
        let child_dir = child_path.parent();
        if let (Some(from), Some(to)) = (parent_dir, child_dir) {
            for value in changed_values
                .iter()
                .filter(|v| media::is_media_value(v, &self.media_extensions))
            {
                match media::copy_attachment(value, &from, to) {
                    Ok(true) => tracing::debug!(child_id, file = %value, "attachment copied"),
                    Ok(false) => {}
                    Err(e) => tracing::warn!(child_id, file = %value, error = %e, "attachment copy failed"),
                }
            }
        }

        self.relations.insert(
            &RelationshipRecord::new(
                parent_id,
                &save_form.node_xpath,
                save_form.enclosing_repeat_path.as_deref(),
                repeat_index,
                child_id,
                FORM_LINK_NODE,
            ),
            true,
        )?;
        for d in save_instance_directives(group) {
            self.relations.insert(
                &RelationshipRecord::new(
                    parent_id,
                    &d.node_xpath,
                    d.enclosing_repeat_path.as_deref(),
                    repeat_index,
                    child_id,
                    &d.attribute_value,
                ),
                true,
            )?;
        }
        Ok(())
    }
}

fn relevant_save_form<'a>(group: &[&'a SubformDirective]) -> Option<&'a SubformDirective> {
    let mut relevant = group
        .iter()
        .copied()
        .filter(|d| d.kind == DirectiveKind::SaveForm && d.is_relevant);
    let first = relevant.next();
    if let (Some(first), Some(other)) = (first, relevant.next()) {
        tracing::warn!(
            kept = %first.node_xpath,
            ignored = %other.node_xpath,
            "several relevant save-form directives share a repeat index"
        );
    }
    first
}

fn save_instance_directives<'a>(
    group: &'a [&'a SubformDirective],
) -> impl Iterator<Item = &'a SubformDirective> + 'a {
    group
        .iter()
        .copied()
        .filter(|d| d.kind == DirectiveKind::SaveInstance && d.is_relevant)
}

/// Copy every relevant save-instance value into `document`.
/// Returns the values that differed, or the first target path that is missing.
fn copy_values(document: &mut Element, group: &[&SubformDirective]) -> Result<Vec<String>, String> {
    let mut changed = Vec::new();
    for d in save_instance_directives(group) {
        let Some(target) = document.select_mut(&d.attribute_value) else {
            return Err(d.attribute_value.clone());
        };
        if target.text != d.node_value {
            target.text = d.node_value.clone();
            changed.push(d.node_value.clone());
        }
    }
    Ok(changed)
}
