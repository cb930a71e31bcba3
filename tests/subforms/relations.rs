use formlink::core::error::FormlinkError;
use formlink::subforms::relations::{RelationStore, RelationshipRecord, FORM_LINK_NODE};
use tempfile::{tempdir, TempDir};

fn store() -> (TempDir, RelationStore) {
    let tmp = tempdir().unwrap();
    let store = RelationStore::open(&tmp.path().join("relations.db")).unwrap();
    (tmp, store)
}

/// Anchor plus one value mapping for a child at repeat `index` of `/member`.
fn link_member(store: &RelationStore, parent: i64, index: i64, child: i64) {
    let root = format!("/member[{}]", index);
    store
        .insert(
            &RelationshipRecord::new(
                parent,
                &format!("{}/link", root),
                Some(&root),
                index,
                child,
                FORM_LINK_NODE,
            ),
            false,
        )
        .unwrap();
    store
        .insert(
            &RelationshipRecord::new(
                parent,
                &format!("{}/name", root),
                Some(&root),
                index,
                child,
                "/name",
            ),
            false,
        )
        .unwrap();
}

#[test]
fn test_duplicate_parent_node_is_rejected_or_ignored() {
    let (_tmp, store) = store();
    let record = RelationshipRecord::new(1, "/member[1]/name", Some("/member[1]"), 1, 2, "/name");
    assert!(store.insert(&record, false).unwrap().is_some());

    let other_child = RelationshipRecord::new(1, "/member[1]/name", Some("/member[1]"), 1, 3, "/name");
    match store.insert(&other_child, false) {
        Err(FormlinkError::DuplicateLink {
            parent_id,
            parent_node,
        }) => {
            assert_eq!(parent_id, 1);
            assert_eq!(parent_node, "/member[1]/name");
        }
        other => panic!("expected DuplicateLink, got {:?}", other),
    }
    assert_eq!(store.insert(&other_child, true).unwrap(), None);
    assert_eq!(store.records_for_parent(1).unwrap(), vec![record]);
}

#[test]
fn test_children_of_is_distinct_and_sorted() {
    let (_tmp, store) = store();
    link_member(&store, 1, 1, 30);
    link_member(&store, 1, 2, 10);
    link_member(&store, 1, 3, 20);
    link_member(&store, 2, 1, 99);

    assert_eq!(store.children_of(1).unwrap(), vec![10, 20, 30]);
    assert_eq!(store.children_of(42).unwrap(), Vec::<i64>::new());
    assert_eq!(store.parent_of(10).unwrap(), Some(1));
    assert_eq!(store.parent_of(1).unwrap(), None);
}

#[test]
fn test_mappings_skip_the_form_link_row() {
    let (_tmp, store) = store();
    link_member(&store, 1, 1, 10);
    assert_eq!(
        store.mappings_to_parent(10).unwrap(),
        vec![("/member[1]/name".to_string(), "/name".to_string())]
    );
    assert!(store.mappings_to_parent(11).unwrap().is_empty());
}

#[test]
fn test_delete_by_parent_and_child() {
    let (_tmp, store) = store();
    link_member(&store, 1, 1, 10);
    link_member(&store, 1, 2, 11);
    link_member(&store, 10, 1, 20);

    assert_eq!(store.delete_where_child(10).unwrap(), 2);
    assert_eq!(store.children_of(1).unwrap(), vec![11]);
    assert_eq!(store.delete_where_parent(10).unwrap(), 2);
    assert_eq!(store.parent_of(20).unwrap(), None);
    assert_eq!(store.delete_where_parent(10).unwrap(), 0);
}

#[test]
fn test_renumber_shifts_only_links_above_deleted_index() {
    let (_tmp, store) = store();
    for (index, child) in [(1, 10), (2, 11), (3, 12), (4, 13)] {
        link_member(&store, 1, index, child);
    }
    link_member(&store, 2, 3, 50);
    store.delete_where_child(11).unwrap();

    assert_eq!(store.renumber_after_deletion(1, 2).unwrap(), 4);

    assert_eq!(store.child_for(1, 1).unwrap(), Some(10));
    assert_eq!(store.child_for(1, 2).unwrap(), Some(12));
    assert_eq!(store.child_for(1, 3).unwrap(), Some(13));
    assert_eq!(store.child_for(1, 4).unwrap(), None);
    assert_eq!(store.child_for(2, 3).unwrap(), Some(50));

    let moved: Vec<RelationshipRecord> = store
        .records_for_parent(1)
        .unwrap()
        .into_iter()
        .filter(|r| r.child_id == 13)
        .collect();
    assert!(moved.iter().all(|r| r.repeat_index == Some(3)));
    assert!(moved.iter().all(|r| r.repeatable_root.as_deref() == Some("/member[3]")));
    assert!(moved.iter().any(|r| r.parent_node == "/member[3]/name"));
}

#[test]
fn test_renumber_rewrites_innermost_selector_of_nested_paths() {
    let (_tmp, store) = store();
    store
        .insert(
            &RelationshipRecord::new(
                7,
                "/visit[2]/member[3]/link",
                Some("/visit[2]/member[3]"),
                3,
                70,
                FORM_LINK_NODE,
            ),
            false,
        )
        .unwrap();

    assert_eq!(store.renumber_after_deletion(7, 1).unwrap(), 1);
    let record = &store.records_for_parent(7).unwrap()[0];
    assert_eq!(record.parent_node, "/visit[2]/member[2]/link");
    assert_eq!(record.repeatable_root.as_deref(), Some("/visit[2]/member[2]"));
    assert_eq!(record.repeat_index, Some(2));
}

#[test]
fn test_renumber_leaves_non_repeat_links_alone() {
    let (_tmp, store) = store();
    store
        .insert(&RelationshipRecord::new(1, "/visit", None, -1, 5, FORM_LINK_NODE), false)
        .unwrap();
    link_member(&store, 1, 2, 6);

    assert_eq!(store.renumber_after_deletion(1, 1).unwrap(), 2);
    assert_eq!(store.child_for(1, -1).unwrap(), Some(5));
    assert_eq!(store.child_for(1, 1).unwrap(), Some(6));
}

#[test]
fn test_renumber_rejects_index_below_one() {
    let (_tmp, store) = store();
    store
        .insert(&RelationshipRecord::new(1, "/visit", None, -1, 5, FORM_LINK_NODE), false)
        .unwrap();
    link_member(&store, 1, 1, 6);
    link_member(&store, 1, 2, 7);
    let before = store.records_for_parent(1).unwrap();

    for index in [-1, 0] {
        assert!(matches!(
            store.renumber_after_deletion(1, index),
            Err(FormlinkError::ValidationError(_))
        ));
    }
    assert_eq!(store.records_for_parent(1).unwrap(), before);
    assert_eq!(store.child_for(1, 1).unwrap(), Some(6));
}

#[test]
fn test_links_survive_reopen() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("relations.db");
    {
        let store = RelationStore::open(&path).unwrap();
        link_member(&store, 1, 1, 10);
    }
    let store = RelationStore::open(&path).unwrap();
    assert_eq!(store.child_for(1, 1).unwrap(), Some(10));
}
