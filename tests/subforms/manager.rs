use formlink::core::error::FormlinkError;
use formlink::core::workspace::Workspace;
use formlink::core::xml::{self, Element};
use formlink::subforms::creation;
use formlink::subforms::relations::{RelationshipRecord, FORM_LINK_NODE};
use formlink::subforms::{
    ActionError, Catalog, InstanceId, InstanceStatus, InstanceStore, SubformActionResult,
    SubformManager, TreeNode,
};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tempfile::{tempdir, TempDir};

const HOUSEHOLD_FORM: &str = r#"
<form id="household" title="Household" version="1">
  <household>
    <hh_id/>
    <status/>
    <member repeat="true">
      <active/>
      <link saveForm="member" relevant="active = 'yes'"/>
      <name saveInstance="/name"/>
      <consent/>
      <photo saveInstance="/photo" relevant="consent = 'yes'"/>
    </member>
    <dissolve deleteForm="" relevant="/status = 'dissolved'"/>
  </household>
</form>
"#;

const MEMBER_FORM: &str = r#"
<form id="member" title="Member" version="2">
  <person>
    <name/>
    <photo/>
    <age/>
  </person>
</form>
"#;

const VISIT_FORM: &str = r#"
<form id="visit" title="Visit">
  <visit>
    <name/>
    <date/>
  </visit>
</form>
"#;

struct Fixture {
    _tmp: TempDir,
    catalog: Arc<Catalog>,
    manager: Arc<SubformManager>,
    parent: InstanceId,
}

struct Member<'a> {
    active: &'a str,
    link: &'a str,
    name: &'a str,
    consent: &'a str,
    photo: &'a str,
}

impl<'a> Member<'a> {
    fn active(name: &'a str) -> Self {
        Self {
            active: "yes",
            link: name,
            name,
            consent: "no",
            photo: "",
        }
    }
}

fn leaf(name: &str, text: &str) -> Element {
    Element::new(name).with_text(text)
}

fn register(ws: &Workspace, catalog: &Catalog, form_id: &str, text: &str) {
    let path = ws.forms_dir().join(format!("{}.xml", form_id));
    fs::write(&path, text).unwrap();
    catalog.register_form(form_id, None, form_id, &path).unwrap();
}

fn fixture() -> Fixture {
    let tmp = tempdir().unwrap();
    let ws = Workspace::open(tmp.path()).unwrap();
    ws.ensure_layout().unwrap();
    let catalog = Arc::new(Catalog::open(&ws.catalog_db_path()).unwrap());
    register(&ws, &catalog, "household", HOUSEHOLD_FORM);
    register(&ws, &catalog, "member", MEMBER_FORM);
    register(&ws, &catalog, "visit", VISIT_FORM);
    let manager = Arc::new(SubformManager::for_workspace(&ws, Arc::clone(&catalog)).unwrap());
    let (parent, _) = creation::create_instance(
        catalog.as_ref(),
        catalog.as_ref(),
        manager.definitions(),
        manager.instances_dir(),
        "household",
        "",
    )
    .unwrap();
    Fixture {
        _tmp: tmp,
        catalog,
        manager,
        parent,
    }
}

impl Fixture {
    fn path(&self, id: InstanceId) -> PathBuf {
        self.catalog.path_of(id).unwrap().unwrap()
    }

    fn doc(&self, id: InstanceId) -> Element {
        xml::read_document(&self.path(id)).unwrap()
    }

    /// Overwrite the parent document with the given household state.
    fn save_parent(&self, status: &str, members: &[Member<'_>]) {
        let mut root = Element::new("household")
            .with_attribute("id", "household")
            .with_child(leaf("hh_id", "H-1"))
            .with_child(leaf("status", status));
        for m in members {
            root = root.with_child(
                Element::new("member")
                    .with_child(leaf("active", m.active))
                    .with_child(leaf("link", m.link))
                    .with_child(leaf("name", m.name))
                    .with_child(leaf("consent", m.consent))
                    .with_child(leaf("photo", m.photo)),
            );
        }
        root = root.with_child(Element::new("dissolve"));
        xml::write_document(&self.path(self.parent), &root).unwrap();
    }

    fn manage(&self, dry_run: bool) -> SubformActionResult {
        self.manager
            .manage_saved_instance(self.parent, dry_run)
            .unwrap()
    }

    fn child_at(&self, index: i64) -> Option<InstanceId> {
        self.manager
            .relations()
            .child_for(self.parent, index)
            .unwrap()
    }

    fn instance_count(&self) -> usize {
        self.catalog.list_instances().unwrap().len()
    }
}

#[test]
fn test_creates_one_child_per_relevant_repeat() {
    let f = fixture();
    f.save_parent("", &[Member::active("Ana"), Member::active("Bea")]);

    let result = f.manage(false);
    assert_eq!(result.counts(), (2, 0, 0, false));
    assert_eq!(result.error, None);

    let first = f.child_at(1).unwrap();
    let second = f.child_at(2).unwrap();
    assert_ne!(first, second);
    assert_eq!(f.doc(first).select("/name").unwrap().text, "Ana");
    assert_eq!(f.doc(second).select("/name").unwrap().text, "Bea");
    assert_eq!(f.doc(first).attribute("id"), Some("member"));

    let record = f.catalog.get(first).unwrap().unwrap();
    assert_eq!(record.form_id, "member");
    assert_eq!(record.display_name, "Ana");
    assert_eq!(record.status, InstanceStatus::Incomplete);

    assert_eq!(
        f.manager.relations().children_of(f.parent).unwrap(),
        vec![first, second]
    );
    assert_eq!(f.manager.relations().parent_of(first).unwrap(), Some(f.parent));
}

#[test]
fn test_links_anchor_and_value_mappings() {
    let f = fixture();
    f.save_parent("", &[Member::active("Ana")]);
    f.manage(false);

    let child = f.child_at(1).unwrap();
    let records = f.manager.relations().records_for_parent(f.parent).unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.contains(&RelationshipRecord::new(
        f.parent,
        "/member[1]/link",
        Some("/member[1]"),
        1,
        child,
        FORM_LINK_NODE,
    )));
    assert_eq!(
        f.manager.relations().mappings_to_parent(child).unwrap(),
        vec![("/member[1]/name".to_string(), "/name".to_string())]
    );
}

#[test]
fn test_second_pass_without_changes_is_a_no_op() {
    let f = fixture();
    f.save_parent("", &[Member::active("Ana"), Member::active("Bea")]);
    f.manage(false);

    let again = f.manage(false);
    assert_eq!(again, SubformActionResult::default());
    assert_eq!(f.instance_count(), 3);
}

#[test]
fn test_value_change_updates_child_and_resets_status() {
    let f = fixture();
    f.save_parent("", &[Member::active("Ana")]);
    f.manage(false);
    let child = f.child_at(1).unwrap();
    f.catalog.set_status(child, InstanceStatus::Complete).unwrap();

    f.save_parent(
        "",
        &[Member {
            name: "Anna",
            ..Member::active("Ana")
        }],
    );
    let result = f.manage(false);
    assert_eq!(result.counts(), (0, 1, 0, false));
    assert_eq!(f.doc(child).select("/name").unwrap().text, "Anna");
    assert_eq!(
        f.catalog.get(child).unwrap().unwrap().status,
        InstanceStatus::Incomplete
    );
    assert_eq!(f.child_at(1), Some(child));
}

#[test]
fn test_media_value_is_copied_next_to_child() {
    let f = fixture();
    let parent_dir = f.path(f.parent).parent().unwrap().to_path_buf();
    fs::write(parent_dir.join("ana.jpg"), b"jpeg").unwrap();
    f.save_parent(
        "",
        &[Member {
            consent: "yes",
            photo: "ana.jpg",
            ..Member::active("Ana")
        }],
    );

    let result = f.manage(false);
    assert_eq!(result.created, 1);
    let child = f.child_at(1).unwrap();
    let child_dir = f.path(child).parent().unwrap().to_path_buf();
    assert_eq!(fs::read(child_dir.join("ana.jpg")).unwrap(), b"jpeg");
    assert_eq!(f.doc(child).select("/photo").unwrap().text, "ana.jpg");
    assert_eq!(
        f.manager.relations().mappings_to_parent(child).unwrap().len(),
        2
    );
}

#[test]
fn test_irrelevant_save_instance_is_not_copied() {
    let f = fixture();
    f.save_parent(
        "",
        &[Member {
            consent: "no",
            photo: "ana.jpg",
            ..Member::active("Ana")
        }],
    );
    f.manage(false);
    let child = f.child_at(1).unwrap();
    assert_eq!(f.doc(child).select("/photo").unwrap().text, "");
}

#[test]
fn test_relevance_flip_deletes_child() {
    let f = fixture();
    f.save_parent("", &[Member::active("Ana"), Member::active("Bea")]);
    f.manage(false);
    let second = f.child_at(2).unwrap();
    let second_dir = f.path(second).parent().unwrap().to_path_buf();

    f.save_parent(
        "",
        &[
            Member::active("Ana"),
            Member {
                active: "no",
                ..Member::active("Bea")
            },
        ],
    );
    let result = f.manage(false);
    assert_eq!(result.counts(), (0, 0, 1, false));
    assert_eq!(f.child_at(2), None);
    assert!(f.catalog.get(second).unwrap().is_none());
    assert!(!second_dir.exists());
    assert_eq!(f.manager.relations().children_of(f.parent).unwrap().len(), 1);
}

#[test]
fn test_form_id_change_replaces_child() {
    let f = fixture();
    let tree = |form: &str| {
        TreeNode::new("household").child(
            TreeNode::repeat("member", 1)
                .child(TreeNode::new("link").attr("saveForm", form))
                .child(TreeNode::new("name").value("Ana").attr("saveInstance", "/name")),
        )
    };
    f.manager
        .manage_relationships(f.parent, &tree("member"), false)
        .unwrap();
    let old = f.child_at(1).unwrap();

    let preview = f
        .manager
        .manage_relationships(f.parent, &tree("visit"), true)
        .unwrap();
    let result = f
        .manager
        .manage_relationships(f.parent, &tree("visit"), false)
        .unwrap();
    assert_eq!(result.counts(), (1, 0, 1, false));
    assert_eq!(preview, result);

    let new = f.child_at(1).unwrap();
    assert_ne!(old, new);
    assert!(f.catalog.get(old).unwrap().is_none());
    assert_eq!(f.catalog.form_id_of(new).unwrap().as_deref(), Some("visit"));
    assert_eq!(f.doc(new).select("/name").unwrap().text, "Ana");
}

#[test]
fn test_dry_run_matches_real_run_and_writes_nothing() {
    let f = fixture();
    f.save_parent("", &[Member::active("Ana"), Member::active("Bea")]);
    let before = fs::read_to_string(f.path(f.parent)).unwrap();

    let preview = f.manage(true);
    assert_eq!(preview.counts(), (2, 0, 0, false));
    assert_eq!(f.instance_count(), 1);
    assert!(f
        .manager
        .relations()
        .records_for_parent(f.parent)
        .unwrap()
        .is_empty());
    assert_eq!(fs::read_dir(f.manager.instances_dir()).unwrap().count(), 1);
    assert_eq!(fs::read_to_string(f.path(f.parent)).unwrap(), before);

    let real = f.manage(false);
    assert_eq!(preview, real);
    assert_eq!(f.instance_count(), 3);
}

#[test]
fn test_missing_xpath_reports_error_and_processes_siblings() {
    let f = fixture();
    let tree = TreeNode::new("household")
        .child(
            TreeNode::repeat("member", 1)
                .child(TreeNode::new("link").attr("saveForm", "member"))
                .child(TreeNode::new("nick").value("A").attr("saveInstance", "/nickname")),
        )
        .child(
            TreeNode::repeat("member", 2)
                .child(TreeNode::new("link").attr("saveForm", "member"))
                .child(TreeNode::new("name").value("Bea").attr("saveInstance", "/name")),
        );

    let result = f.manager.manage_relationships(f.parent, &tree, false).unwrap();
    assert_eq!(result.created, 1);
    assert_eq!(
        result.error,
        Some(ActionError::MissingXPath {
            xpath: "/nickname".to_string()
        })
    );
    assert_eq!(f.child_at(1), None);
    assert!(f.child_at(2).is_some());
    assert_eq!(f.instance_count(), 2);
}

#[test]
fn test_missing_form_template_wins_over_missing_xpath() {
    let f = fixture();
    let tree = TreeNode::new("household")
        .child(
            TreeNode::repeat("member", 1)
                .child(TreeNode::new("link").attr("saveForm", "member"))
                .child(TreeNode::new("nick").value("A").attr("saveInstance", "/nickname")),
        )
        .child(
            TreeNode::repeat("member", 2)
                .child(TreeNode::new("link").attr("saveForm", "ghost"))
                .child(TreeNode::new("name").value("Bea").attr("saveInstance", "/name")),
        );

    let result = f.manager.manage_relationships(f.parent, &tree, false).unwrap();
    assert_eq!(result.created, 0);
    assert_eq!(
        result.error,
        Some(ActionError::MissingFormTemplate {
            form_id: "ghost".to_string()
        })
    );
    assert_eq!(f.instance_count(), 1);
}

#[test]
fn test_template_placeholders_are_ignored() {
    let f = fixture();
    f.save_parent("", &[]);
    let result = f.manage(false);
    assert_eq!(result, SubformActionResult::default());
    assert_eq!(f.instance_count(), 1);
}

#[test]
fn test_child_edit_is_pushed_to_parent() {
    let f = fixture();
    f.save_parent("", &[Member::active("Ana")]);
    f.manage(false);
    let child = f.child_at(1).unwrap();
    f.catalog.set_status(f.parent, InstanceStatus::Complete).unwrap();

    let mut doc = f.doc(child);
    doc.select_mut("/name").unwrap().text = "Ana Maria".to_string();
    xml::write_document(&f.path(child), &doc).unwrap();

    let preview = f.manager.manage_saved_instance(child, true).unwrap();
    assert_eq!(preview.counts(), (0, 1, 0, false));
    assert_eq!(f.doc(f.parent).select("/member[1]/name").unwrap().text, "Ana");

    let result = f.manager.manage_saved_instance(child, false).unwrap();
    assert_eq!(result, preview);
    assert_eq!(
        f.doc(f.parent).select("/member[1]/name").unwrap().text,
        "Ana Maria"
    );
    assert_eq!(
        f.catalog.get(f.parent).unwrap().unwrap().status,
        InstanceStatus::Incomplete
    );
}

#[test]
fn test_delete_form_cascades_through_descendants() {
    let f = fixture();
    f.save_parent("", &[Member::active("Ana"), Member::active("Bea")]);
    f.manage(false);
    let first = f.child_at(1).unwrap();
    let (grandchild, _) = creation::create_instance(
        f.catalog.as_ref(),
        f.catalog.as_ref(),
        f.manager.definitions(),
        f.manager.instances_dir(),
        "visit",
        "",
    )
    .unwrap();
    f.manager
        .relations()
        .insert(
            &RelationshipRecord::new(first, "/visit", None, -1, grandchild, FORM_LINK_NODE),
            false,
        )
        .unwrap();

    f.save_parent("dissolved", &[Member::active("Ana"), Member::active("Bea")]);
    let preview = f.manage(true);
    assert_eq!(preview.counts(), (0, 0, 4, true));
    assert_eq!(f.instance_count(), 4);

    let result = f.manage(false);
    assert_eq!(result, preview);
    assert_eq!(f.instance_count(), 0);
    assert!(f.manager.relations().children_of(f.parent).unwrap().is_empty());
    assert!(f.manager.relations().children_of(first).unwrap().is_empty());
    assert_eq!(f.manager.relations().parent_of(grandchild).unwrap(), None);
}

#[test]
fn test_delete_form_survives_link_cycles() {
    let f = fixture();
    f.save_parent("", &[Member::active("Ana")]);
    f.manage(false);
    let child = f.child_at(1).unwrap();
    f.manager
        .relations()
        .insert(
            &RelationshipRecord::new(child, "/back", None, -1, f.parent, FORM_LINK_NODE),
            false,
        )
        .unwrap();

    f.save_parent("dissolved", &[Member::active("Ana")]);
    let result = f.manage(false);
    assert_eq!(result.counts(), (0, 0, 2, true));
    assert_eq!(f.instance_count(), 0);
}

#[test]
fn test_delete_repeat_renumbers_following_links() {
    let f = fixture();
    f.save_parent(
        "",
        &[
            Member::active("Ana"),
            Member::active("Bea"),
            Member::active("Cid"),
        ],
    );
    f.manage(false);
    let (first, second, third) = (
        f.child_at(1).unwrap(),
        f.child_at(2).unwrap(),
        f.child_at(3).unwrap(),
    );

    let preview = f.manager.delete_repeat(f.parent, 2, true).unwrap();
    assert_eq!(preview.counts(), (0, 0, 1, false));
    assert_eq!(f.child_at(2), Some(second));

    let result = f.manager.delete_repeat(f.parent, 2, false).unwrap();
    assert_eq!(result, preview);
    assert!(f.catalog.get(second).unwrap().is_none());
    assert_eq!(f.child_at(1), Some(first));
    assert_eq!(f.child_at(2), Some(third));
    assert_eq!(f.child_at(3), None);
    assert_eq!(
        f.manager.relations().mappings_to_parent(third).unwrap(),
        vec![("/member[2]/name".to_string(), "/name".to_string())]
    );
}

#[test]
fn test_delete_repeat_without_child_only_renumbers() {
    let f = fixture();
    f.save_parent("", &[Member::active("Ana"), Member::active("Bea")]);
    f.manage(false);
    let second = f.child_at(2).unwrap();
    f.manager.relations().delete_where_child(f.child_at(1).unwrap()).unwrap();

    let result = f.manager.delete_repeat(f.parent, 1, false).unwrap();
    assert_eq!(result, SubformActionResult::default());
    assert_eq!(f.child_at(1), Some(second));
}

#[test]
fn test_delete_repeat_rejects_non_repeat_index() {
    let f = fixture();
    let tree = TreeNode::new("household")
        .child(TreeNode::new("visit").attr("saveForm", "visit"))
        .child(
            TreeNode::repeat("member", 1)
                .child(TreeNode::new("link").attr("saveForm", "member"))
                .child(TreeNode::new("name").value("Ana").attr("saveInstance", "/name")),
        )
        .child(
            TreeNode::repeat("member", 2)
                .child(TreeNode::new("link").attr("saveForm", "member"))
                .child(TreeNode::new("name").value("Bea").attr("saveInstance", "/name")),
        );
    let result = f.manager.manage_relationships(f.parent, &tree, false).unwrap();
    assert_eq!(result.created, 3);
    let visit = f.child_at(-1).unwrap();
    let (first, second) = (f.child_at(1).unwrap(), f.child_at(2).unwrap());

    for index in [-1, 0] {
        for dry_run in [true, false] {
            match f.manager.delete_repeat(f.parent, index, dry_run) {
                Err(FormlinkError::ValidationError(_)) => {}
                other => panic!("expected ValidationError for {}, got {:?}", index, other),
            }
        }
    }

    assert_eq!(f.child_at(-1), Some(visit));
    assert!(f.catalog.get(visit).unwrap().is_some());
    assert_eq!(f.child_at(1), Some(first));
    assert_eq!(f.child_at(2), Some(second));
    assert_eq!(f.instance_count(), 4);
}

#[test]
fn test_spawn_manage_runs_on_worker_thread() {
    let f = fixture();
    f.save_parent("", &[Member::active("Ana")]);
    let tree = f.manager.live_tree(f.parent).unwrap();

    let handle = f.manager.spawn_manage(f.parent, tree, false).unwrap();
    let result = handle.join().unwrap().unwrap();
    assert_eq!(result.created, 1);
}

#[test]
fn test_concurrent_passes_are_serialized() {
    let f = fixture();
    f.save_parent("", &[Member::active("Ana"), Member::active("Bea")]);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let manager = Arc::clone(&f.manager);
            let parent = f.parent;
            thread::spawn(move || manager.manage_saved_instance(parent, false).unwrap())
        })
        .collect();
    let total: SubformActionResult = handles.into_iter().map(|h| h.join().unwrap()).sum();

    assert_eq!(total.counts(), (2, 0, 0, false));
    assert_eq!(f.instance_count(), 3);
    assert_eq!(f.manager.relations().children_of(f.parent).unwrap().len(), 2);
}
