/// End-to-end scenarios across the reactive core and the state tree
use crate::{
    ChangeRecord, Computation, Error, FeatureDecl, FeatureId, ListItems, ReactiveValue,
    RecordValue, Scheduler, SessionConfig, StateNode, StateTree, SyncSession,
};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const PROPS: FeatureId = FeatureId::new(1);
const CHILDREN: FeatureId = FeatureId::new(2);
const CLASSES: FeatureId = FeatureId::new(3);

// Test fixture: a form field whose label node mirrors a reactive value
struct TestField {
    value: ReactiveValue<String>,
    label: StateNode,
    binding: Computation,
}

impl TestField {
    fn new(scheduler: &Scheduler) -> Self {
        let value = ReactiveValue::new(scheduler, String::from("initial"));
        let label = StateNode::new(scheduler, [FeatureDecl::map(PROPS)]);

        let (v, l) = (value.clone(), label.clone());
        let binding = scheduler.run_when_dependencies_change(move || {
            l.put(PROPS, "text", json!(v.get()))?;
            Ok(())
        });

        Self {
            value,
            label,
            binding,
        }
    }
}

#[test]
fn changes_before_flush_run_the_computation_once() {
    let scheduler = Scheduler::new();
    let source = ReactiveValue::new(&scheduler, 0);
    let runs = Arc::new(AtomicUsize::new(0));

    let (s, r) = (source.clone(), runs.clone());
    scheduler.run_when_dependencies_change(move || {
        s.get();
        r.fetch_add(1, Ordering::Relaxed);
        Ok(())
    });
    scheduler.flush().unwrap();
    assert_eq!(runs.load(Ordering::Relaxed), 1);

    // Two changes before the next flush
    source.set(1);
    source.set(2);
    scheduler.flush().unwrap();
    assert_eq!(runs.load(Ordering::Relaxed), 2);

    for n in 0..20 {
        source.set(n);
    }
    scheduler.flush().unwrap();
    assert_eq!(runs.load(Ordering::Relaxed), 3);
}

#[test]
fn stopped_computation_ignores_everything() {
    let scheduler = Scheduler::new();
    let field = TestField::new(&scheduler);
    scheduler.flush().unwrap();

    field.binding.stop();
    field.binding.stop();
    field.binding.invalidate();
    field.binding.add_dependency(field.value.router());
    field.binding.on_next_invalidate(|_| panic!("must not fire after stop"));
    field.value.set("changed".into());
    scheduler.flush().unwrap();

    assert_eq!(
        field.label.get(PROPS, "text").and_then(|v| v.as_value().cloned()),
        Some(json!("initial"))
    );
    assert_eq!(field.value.listener_count(), 0);
}

#[test]
fn reentrant_flush_loses_no_work() {
    let scheduler = Scheduler::new();
    let runs = Arc::new(AtomicUsize::new(0));

    let (s, r) = (scheduler.clone(), runs.clone());
    scheduler.run_when_dependencies_change(move || {
        let r2 = r.clone();
        s.add_flush_listener(move || {
            r2.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
        // Nested: returns immediately
        s.flush()
    });

    scheduler.flush().unwrap();
    assert_eq!(runs.load(Ordering::Relaxed), 1);
    assert!(!scheduler.has_pending_work());
}

#[test]
fn attach_replays_full_state() {
    let scheduler = Scheduler::new();
    let tree = StateTree::new(&scheduler, [FeatureDecl::node_list(CHILDREN)]);
    tree.collect_changes();

    let node = tree.create_node([FeatureDecl::map(PROPS)]);
    node.put(PROPS, "a", json!(0)).unwrap();
    node.put(PROPS, "a", json!(1)).unwrap();
    node.put(PROPS, "b", json!(2)).unwrap();
    // Nothing is collected while detached
    assert!(tree.collect_changes().is_empty());

    tree.root().list_push(CHILDREN, &node).unwrap();
    let id = node.id().unwrap();
    let changes = tree.collect_changes();
    let node_changes: Vec<_> = changes.iter().filter(|c| c.node() == id).cloned().collect();
    assert_eq!(
        node_changes,
        vec![
            ChangeRecord::Attach { node: id },
            ChangeRecord::Put {
                node: id,
                feature: PROPS,
                key: "a".into(),
                value: RecordValue::Literal(json!(1)),
            },
            ChangeRecord::Put {
                node: id,
                feature: PROPS,
                key: "b".into(),
                value: RecordValue::Literal(json!(2)),
            },
        ]
    );
}

#[test]
fn subtree_attach_and_detach() {
    let scheduler = Scheduler::new();
    let tree = StateTree::new(&scheduler, [FeatureDecl::node_list(CHILDREN)]);
    tree.collect_changes();

    let features = [FeatureDecl::map(PROPS), FeatureDecl::node_list(CHILDREN)];
    let panel = tree.create_node(features);
    let button = tree.create_node(features);
    panel.list_push(CHILDREN, &button).unwrap();
    button.put(PROPS, "label", json!("Save")).unwrap();

    tree.root().list_push(CHILDREN, &panel).unwrap();
    let attached = tree.collect_changes();
    let attaches: Vec<_> = attached
        .iter()
        .filter(|c| matches!(c, ChangeRecord::Attach { .. }))
        .map(ChangeRecord::node)
        .collect();
    assert_eq!(attaches.len(), 2);
    assert!(attaches.contains(&panel.id().unwrap()));
    assert!(attaches.contains(&button.id().unwrap()));

    tree.root().list_remove(CHILDREN, 0).unwrap();
    let detached = tree.collect_changes();
    let detaches: Vec<_> = detached
        .iter()
        .filter(|c| matches!(c, ChangeRecord::Detach { .. }))
        .map(ChangeRecord::node)
        .collect();
    assert_eq!(detaches.len(), 2);
    assert_eq!(tree.node_by_id(button.id().unwrap()), None);

    // Back in, with the same ids
    let ids = (panel.id(), button.id());
    tree.root().list_push(CHILDREN, &panel).unwrap();
    tree.collect_changes();
    assert_eq!((panel.id(), button.id()), ids);
    assert_eq!(tree.node_by_id(button.id().unwrap()), Some(button));
}

#[test]
fn put_then_remove_in_one_cycle_emits_nothing() {
    let scheduler = Scheduler::new();
    let tree = StateTree::new(&scheduler, [FeatureDecl::map(PROPS), FeatureDecl::list(CLASSES)]);
    tree.collect_changes();

    let root = tree.root();
    root.put(PROPS, "tmp", json!("x")).unwrap();
    root.remove(PROPS, "tmp").unwrap();
    root.list_push(CLASSES, json!("hidden")).unwrap();
    root.list_remove(CLASSES, 0).unwrap();

    assert!(tree.collect_changes().is_empty());
}

#[test]
fn list_changes_replay_in_order() {
    let scheduler = Scheduler::new();
    let tree = StateTree::new(&scheduler, [FeatureDecl::list(CLASSES)]);
    let root = tree.root();
    root.list_push(CLASSES, json!("a")).unwrap();
    root.list_push(CLASSES, json!("b")).unwrap();
    tree.collect_changes();

    root.list_remove(CLASSES, 0).unwrap();
    root.list_push(CLASSES, json!("c")).unwrap();
    root.list_push(CLASSES, json!("d")).unwrap();

    assert_eq!(
        tree.collect_changes(),
        vec![
            ChangeRecord::ListRemove {
                node: root.id().unwrap(),
                feature: CLASSES,
                index: 0,
                removed: RecordValue::Literal(json!("a")),
            },
            ChangeRecord::ListAdd {
                node: root.id().unwrap(),
                feature: CLASSES,
                index: 1,
                items: ListItems::Values(vec![json!("c"), json!("d")]),
            },
        ]
    );
    assert_eq!(root.list_len(CLASSES), 3);
}

#[test]
fn computation_drives_the_tree() {
    let session = SessionConfig::new()
        .root_feature(FeatureDecl::node_list(CHILDREN))
        .build();
    let field = TestField::new(session.scheduler());
    session.root().list_push(CHILDREN, &field.label).unwrap();
    session.sync().unwrap();

    field.value.set("first".into());
    field.value.set("second".into());
    let message = session.sync().unwrap();

    let label = field.label.id().unwrap().get();
    assert_eq!(
        message.changes,
        vec![json!({"type": "put", "node": label, "feat": 1, "key": "text", "value": "second"})]
    );
}

#[test]
fn failing_recompute_keeps_later_work_queued() {
    let scheduler = Scheduler::new();
    let source = ReactiveValue::new(&scheduler, 0);
    let healthy_runs = Arc::new(AtomicUsize::new(0));

    let s = source.clone();
    let failing = scheduler.run_when_dependencies_change(move || {
        if s.get() > 0 {
            return Err(Error::recompute("negative balance"));
        }
        Ok(())
    });
    let (s, r) = (source.clone(), healthy_runs.clone());
    scheduler.run_when_dependencies_change(move || {
        s.get();
        r.fetch_add(1, Ordering::Relaxed);
        Ok(())
    });
    scheduler.flush().unwrap();

    source.set(1);
    assert!(matches!(scheduler.flush(), Err(Error::Recompute(_))));
    assert!(!failing.is_invalidated());
    assert!(scheduler.has_pending_work());
    assert_eq!(healthy_runs.load(Ordering::Relaxed), 1);

    scheduler.flush().unwrap();
    assert_eq!(healthy_runs.load(Ordering::Relaxed), 2);
}

#[test]
fn sync_surfaces_recompute_errors() {
    let session = SyncSession::new(SessionConfig::new().root_feature(FeatureDecl::map(PROPS)));
    session
        .scheduler()
        .run_when_dependencies_change(|| Err(Error::recompute("broken binding")));

    assert!(matches!(session.sync(), Err(Error::Recompute(_))));
    // The tree was not collected, nothing is lost
    assert!(session.tree().has_dirty_nodes());
    assert_eq!(session.sync().unwrap().changes.len(), 2);
}

#[test]
fn event_collectors_see_tree_and_value_events() {
    let scheduler = Scheduler::new();
    let seen = Arc::new(AtomicUsize::new(0));
    let s = seen.clone();
    let collector = scheduler.add_event_collector(move |_| {
        s.fetch_add(1, Ordering::Relaxed);
    });

    let field = TestField::new(&scheduler);
    scheduler.flush().unwrap();
    // The binding's put on the label
    assert_eq!(seen.load(Ordering::Relaxed), 1);

    field.value.set("x".into());
    scheduler.flush().unwrap();
    // The value write, then the binding's put again
    assert_eq!(seen.load(Ordering::Relaxed), 3);

    collector.remove();
    field.value.set("y".into());
    assert_eq!(seen.load(Ordering::Relaxed), 3);
}
