//! Integration Tests for the Provider Graph
//!
//! These tests drive containers, providers, subscriptions and overrides
//! together through the public API.

use std::any::Any;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};

use ripple_core::{
    CallbackOrigin, Descriptor, Family, GraphConfig, GraphError, GraphObserver, NodeHandle,
    Provider, ProviderContainer, UncaughtError,
};

/// Records every observer event as "kind:node".
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| event.starts_with(prefix))
            .count()
    }
}

impl GraphObserver for Recorder {
    fn did_add_node(&self, descriptor: &Descriptor, _value: &(dyn Any + Send + Sync)) {
        self.events.lock().push(format!("add:{descriptor}"));
    }

    fn did_update_node(&self, descriptor: &Descriptor, _value: &(dyn Any + Send + Sync)) {
        self.events.lock().push(format!("update:{descriptor}"));
    }

    fn did_dispose_node(&self, descriptor: &Descriptor) {
        self.events.lock().push(format!("dispose:{descriptor}"));
    }
}

fn observed() -> (ProviderContainer, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let container = ProviderContainer::builder()
        .shared_observer(recorder.clone())
        .build()
        .unwrap();
    (container, recorder)
}

fn reader_of(name: &str, target: &Provider<i32>) -> Provider<i32> {
    let target = target.clone();
    Provider::new(move |ctx| ctx.read(&target)).named(name.to_string())
}

/// Test that depending on a node adds the edge pair and disposal removes it.
#[test]
fn depend_on_adds_and_removes_edges() {
    let b = Provider::new(|_| Ok(2)).named("b");
    let a = reader_of("a", &b);

    let container = ProviderContainer::new();
    assert_eq!(container.read(&a).unwrap(), 2);

    let node_a = container.node(&a).unwrap();
    let node_b = container.node(&b).unwrap();
    assert_eq!(node_a.dependencies(), vec![b.descriptor().clone()]);
    assert_eq!(node_b.dependents(), vec![a.descriptor().clone()]);

    container.dispose().unwrap();
    assert!(node_a.dependencies().is_empty());
    assert!(node_b.dependents().is_empty());
    assert!(!node_a.is_mounted());
}

/// Test that reading twice returns the same node and reports it once.
#[test]
fn reading_twice_shares_the_node() {
    let provider = Provider::new(|_| Ok(String::from("shared"))).named("shared");
    let (container, recorder) = observed();

    let first = container.node(&provider).unwrap();
    let second = container.node(&provider).unwrap();
    assert!(first.same_node(&second));
    assert_eq!(container.read(&provider).unwrap(), "shared");
    assert_eq!(recorder.events(), vec!["add:shared"]);
}

/// Test that a failing initializer is sticky and runs once.
#[test]
fn failed_initializer_is_sticky() {
    let runs = Arc::new(AtomicI32::new(0));
    let runs_clone = runs.clone();
    let provider: Provider<i32> = Provider::new(move |_| {
        runs_clone.fetch_add(1, Ordering::SeqCst);
        Err(GraphError::msg("backend unavailable"))
    })
    .named("flaky");

    let (container, recorder) = observed();
    let first = container.read(&provider).unwrap_err();
    let second = container.read(&provider).unwrap_err();

    match (&first, &second) {
        (
            GraphError::Construction { source: a, .. },
            GraphError::Construction { source: b, .. },
        ) => assert!(Arc::ptr_eq(a, b)),
        other => panic!("expected construction errors, got {other:?}"),
    }
    assert_eq!(first.root().to_string(), "backend unavailable");
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.count("add:"), 0);
}

/// Test that a panicking initializer becomes a sticky failure too.
#[test]
fn panicking_initializer_is_captured() {
    let provider: Provider<i32> = Provider::new(|_| panic!("boom")).named("explosive");
    let container = ProviderContainer::new();

    let error = container.read(&provider).unwrap_err();
    assert!(matches!(error.root(), GraphError::Panicked(message) if message == "boom"));
    assert!(container.read(&provider).is_err());
}

/// Test that a failed node stays clean and refuses marks.
#[test]
fn failed_node_is_clean_and_immutable() {
    let escaped: Arc<Mutex<Option<NodeHandle<i32>>>> = Arc::default();
    let escaped_clone = escaped.clone();
    let provider: Provider<i32> = Provider::new(move |ctx| {
        *escaped_clone.lock() = Some(ctx.handle());
        Err(GraphError::msg("nope"))
    });

    let container = ProviderContainer::new();
    assert!(container.read(&provider).is_err());

    let handle = escaped.lock().clone().unwrap();
    assert!(!handle.is_dirty());
    assert!(matches!(
        handle.mark_may_have_changed(),
        Err(GraphError::Construction { .. })
    ));
}

/// Test that mark + flush emits without a value change, and mark + cancel
/// does not.
#[test]
fn mark_flush_emits_and_cancel_does_not() {
    let provider = Provider::new(|_| Ok(1)).named("tick");
    let (container, recorder) = observed();
    let handle = container.node(&provider).unwrap();

    let calls = Arc::new(AtomicI32::new(0));
    let calls_clone = calls.clone();
    let mut subscription = container
        .listen(&provider, || {}, move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    handle.mark_may_have_changed().unwrap();
    assert!(subscription.flush().unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(recorder.count("update:tick"), 1);

    handle.mark_may_have_changed().unwrap();
    handle.cancel_change_notification().unwrap();
    assert!(!subscription.flush().unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(recorder.count("update:tick"), 1);
}

/// Test that a selector only emits when its projection changes.
#[test]
fn selector_emits_on_projection_change_only() {
    let state = Provider::new(|_| Ok(json!({ "a": 1, "b": 2 })));
    let container = ProviderContainer::new();
    let handle = container.node(&state).unwrap();

    let emitted: Arc<Mutex<Vec<i64>>> = Arc::default();
    let emitted_clone = emitted.clone();
    let mut selection = container
        .select(
            &state,
            || {},
            |value: &Value| value["a"].as_i64().unwrap_or_default(),
            move |a| emitted_clone.lock().push(*a),
        )
        .unwrap();

    handle.set(json!({ "a": 1, "b": 3 })).unwrap();
    assert!(!selection.flush().unwrap());

    handle.set(json!({ "a": 2, "b": 3 })).unwrap();
    assert!(selection.flush().unwrap());

    assert_eq!(*emitted.lock(), vec![1, 2]);
}

/// Test that disposal visits dependents first and every node once.
#[test]
fn disposal_runs_dependents_first() {
    let c = Provider::new(|_| Ok(3)).named("c");
    let b = reader_of("b", &c);
    let a = reader_of("a", &b);
    let d = Provider::new(|_| Ok(4)).named("d");

    let (container, recorder) = observed();
    container.read(&a).unwrap();
    container.read(&d).unwrap();

    let planned: Vec<String> = container
        .nodes_in_disposal_order()
        .iter()
        .map(ToString::to_string)
        .collect();
    assert_eq!(planned, vec!["a", "b", "c", "d"]);

    container.dispose().unwrap();
    let disposed: Vec<String> = recorder
        .events()
        .into_iter()
        .filter_map(|event| event.strip_prefix("dispose:").map(str::to_string))
        .collect();
    assert_eq!(disposed, planned);
}

/// Test that disposal callbacks run once and a panicking one is isolated.
#[test]
fn dispose_callbacks_are_isolated() {
    let reports: Arc<Mutex<Vec<UncaughtError>>> = Arc::default();
    let reports_clone = reports.clone();
    let ran = Arc::new(AtomicI32::new(0));
    let ran_clone = ran.clone();

    let provider = Provider::new(move |ctx| {
        ctx.on_dispose(|| panic!("cleanup failed"))?;
        let ran = ran_clone.clone();
        ctx.on_dispose(move || {
            ran.fetch_add(1, Ordering::SeqCst);
        })?;
        Ok(0)
    })
    .named("resource");

    let container = ProviderContainer::builder()
        .error_sink(move |error: UncaughtError| reports_clone.lock().push(error))
        .build()
        .unwrap();
    container.read(&provider).unwrap();
    container.dispose().unwrap();

    assert_eq!(ran.load(Ordering::SeqCst), 1);
    let reports = reports.lock();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].origin, CallbackOrigin::DisposeCallback);
    assert_eq!(reports[0].node, "resource");
    assert_eq!(reports[0].message, "cleanup failed");
}

/// Test that a panicking observer does not stop the others.
#[test]
fn observer_panics_are_isolated() {
    struct Exploding;
    impl GraphObserver for Exploding {
        fn did_add_node(&self, _: &Descriptor, _: &(dyn Any + Send + Sync)) {
            panic!("observer exploded");
        }
    }

    let reports = Arc::new(AtomicI32::new(0));
    let reports_clone = reports.clone();
    let recorder = Arc::new(Recorder::default());
    let container = ProviderContainer::builder()
        .observer(Exploding)
        .shared_observer(recorder.clone())
        .error_sink(move |error: UncaughtError| {
            if error.origin == CallbackOrigin::Observer {
                reports_clone.fetch_add(1, Ordering::SeqCst);
            }
        })
        .build()
        .unwrap();

    let provider = Provider::new(|_| Ok(1)).named("watched");
    assert_eq!(container.read(&provider).unwrap(), 1);
    assert_eq!(reports.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.events(), vec!["add:watched"]);
}

/// Test that override updates must keep the list's shape.
#[test]
fn update_overrides_rejects_shape_changes() {
    let a = Provider::new(|_| Ok(1)).named("a");
    let b = Provider::new(|_| Ok(2)).named("b");
    let c = Provider::new(|_| Ok(3)).named("c");

    let container = ProviderContainer::builder()
        .config(GraphConfig::default().with_debug_checks(true))
        .overrides([a.override_with_value(10), b.override_with_value(20)])
        .build()
        .unwrap();

    let shorter = container.update_overrides([a.override_with_value(11)]);
    let reordered =
        container.update_overrides([b.override_with_value(21), a.override_with_value(11)]);
    let replaced = container.update_overrides([a.override_with_value(11), c.override_with_value(31)]);

    for result in [shorter, reordered, replaced] {
        assert!(matches!(result, Err(GraphError::InvalidOverrideMutation { .. })));
    }
    assert_eq!(container.read(&a).unwrap(), 10);
}

/// Test that a same-shape update swaps the live provider and runs its hook
/// once.
#[test]
fn update_overrides_swaps_live_state() {
    let source = Provider::new(|_| Ok(0)).named("source");
    let hook_runs = Arc::new(AtomicI32::new(0));

    let replacement = |value: i32, runs: Arc<AtomicI32>| {
        Provider::value(value).on_update(move |handle, _previous| {
            runs.fetch_add(1, Ordering::SeqCst);
            handle.set(value)
        })
    };

    let (container, recorder) = {
        let recorder = Arc::new(Recorder::default());
        let container = ProviderContainer::builder()
            .shared_observer(recorder.clone())
            .overrides([source.override_with(replacement(1, hook_runs.clone()))])
            .build()
            .unwrap();
        (container, recorder)
    };

    let listened = Arc::new(AtomicI32::new(0));
    let listened_clone = listened.clone();
    let mut subscription = container
        .listen(&source, || {}, move |value| listened_clone.store(*value, Ordering::SeqCst))
        .unwrap();
    assert_eq!(listened.load(Ordering::SeqCst), 1);

    container
        .update_overrides([source.override_with(replacement(2, hook_runs.clone()))])
        .unwrap();
    assert_eq!(hook_runs.load(Ordering::SeqCst), 1);

    assert!(subscription.flush().unwrap());
    assert_eq!(listened.load(Ordering::SeqCst), 2);
    assert_eq!(recorder.count("add:source"), 1);
}

/// Test that a failing update hook does not stop the remaining overrides
/// from being applied.
#[test]
fn failing_update_hook_still_applies_every_override() {
    let a = Provider::new(|_| Ok(0)).named("a");
    let b = Provider::new(|_| Ok(0)).named("b");
    let container = ProviderContainer::builder()
        .overrides([a.override_with_value(10), b.override_with_value(20)])
        .build()
        .unwrap();
    assert_eq!(container.read(&a).unwrap(), 10);
    assert_eq!(container.read(&b).unwrap(), 20);

    let failing = Provider::value(11).on_update(|_, _| Err(GraphError::msg("hook failed")));
    let error = container
        .update_overrides([a.override_with(failing), b.override_with_value(21)])
        .unwrap_err();
    assert!(matches!(error, GraphError::Init(_)));
    assert_eq!(container.read(&a).unwrap(), 10);
    assert_eq!(container.read(&b).unwrap(), 21);

    container
        .update_overrides([a.override_with_value(12), b.override_with_value(22)])
        .unwrap();
    assert_eq!(container.read(&a).unwrap(), 12);
    assert_eq!(container.read(&b).unwrap(), 22);
}

/// Test that a source node overridden with a computed provider recomputes
/// like a derived node.
#[test]
fn computed_override_recomputes() {
    let total = Provider::new(|_| Ok(0)).named("total");
    let input = Provider::new(|_| Ok(1)).named("input");
    let replacement = {
        let input = input.clone();
        Provider::computed(move |ctx| Ok(ctx.watch(&input)? * 2))
    };
    let container = ProviderContainer::builder()
        .overrides([total.override_with(replacement)])
        .build()
        .unwrap();
    assert_eq!(container.read(&total).unwrap(), 2);

    let input_handle = container.node(&input).unwrap();
    input_handle.set(5).unwrap();
    assert_eq!(container.read(&total).unwrap(), 10);

    let total_handle = container.node(&total).unwrap();
    assert_eq!(total_handle.generation(), 1);

    // Same input, same result: the change is cancelled.
    input_handle.set(5).unwrap();
    assert_eq!(container.read(&total).unwrap(), 10);
    assert_eq!(total_handle.generation(), 1);
}

/// Test that a family override is re-resolved for live members.
#[test]
fn family_override_follows_updates() {
    let scaled: Family<i32, i32> = Family::named("scaled", |_, n| Ok(*n));
    let container = ProviderContainer::builder()
        .overrides([scaled.override_with(|n| Provider::value(n * 10))])
        .build()
        .unwrap();

    assert_eq!(container.read(&scaled.get(2)).unwrap(), 20);
    assert_eq!(ProviderContainer::new().read(&scaled.get(2)).unwrap(), 2);

    container
        .update_overrides([scaled.override_with(|n| Provider::value(n * 100))])
        .unwrap();
    assert_eq!(container.read(&scaled.get(2)).unwrap(), 200);
    assert_eq!(container.read(&scaled.get(3)).unwrap(), 300);
}

/// Test that a node reading itself, directly or through another node, fails.
#[test]
fn cycles_are_rejected() {
    let slot: Arc<Mutex<Option<Provider<i32>>>> = Arc::default();
    let x = {
        let slot = slot.clone();
        Provider::new(move |ctx| {
            let target = slot.lock().clone();
            match target {
                Some(target) => ctx.read(&target),
                None => Ok(0),
            }
        })
        .named("x")
    };
    let y = reader_of("y", &x);

    *slot.lock() = Some(x.clone());
    let direct = ProviderContainer::new().read(&x).unwrap_err();
    assert!(direct.is_circular());

    *slot.lock() = Some(y.clone());
    let indirect = ProviderContainer::new().read(&x).unwrap_err();
    assert!(indirect.is_circular());
}

/// Test that a node cannot mark another node while it is being built.
#[test]
fn marking_during_construction_is_rejected() {
    let a = Provider::new(|_| Ok(1)).named("a");
    let container = ProviderContainer::new();
    let handle_a = container.node(&a).unwrap();

    let b = Provider::new(move |_| {
        handle_a.set(2)?;
        Ok(0)
    })
    .named("b");

    let error = container.read(&b).unwrap_err();
    assert!(matches!(error.root(), GraphError::ProtocolViolation(_)));
    assert_eq!(container.read(&a).unwrap(), 1);
}

/// Test that a node built by a child container cannot mark a node it
/// shares with its parent.
#[test]
fn marking_shared_node_during_child_construction_is_rejected() {
    let shared = Provider::new(|_| Ok(1)).named("shared");
    let local = Provider::new(|_| Ok(0)).named("local");
    let parent = ProviderContainer::new();
    let shared_handle = parent.node(&shared).unwrap();

    let replacement = Provider::new(move |_| {
        shared_handle.set(7)?;
        Ok(1)
    });
    let child = parent
        .child()
        .overrides([local.override_with(replacement)])
        .build()
        .unwrap();

    let error = child.read(&local).unwrap_err();
    assert!(matches!(error.root(), GraphError::ProtocolViolation(_)));
    assert_eq!(parent.read(&shared).unwrap(), 1);
}

/// Test that derived nodes only notify when their value changes.
#[test]
fn derived_node_cancels_unchanged_values() {
    let count = Provider::new(|_| Ok(1)).named("count");
    let parity = {
        let count = count.clone();
        Provider::computed(move |ctx| Ok(ctx.watch(&count)? % 2)).named("parity")
    };

    let (container, recorder) = observed();
    let count_handle = container.node(&count).unwrap();
    let parity_handle = container.node(&parity).unwrap();

    let emissions = Arc::new(AtomicI32::new(0));
    let emissions_clone = emissions.clone();
    let mut subscription = container
        .listen(&parity, || {}, move |_| {
            emissions_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    count_handle.set(3).unwrap();
    assert!(parity_handle.is_dirty());
    assert!(!subscription.flush().unwrap());
    assert_eq!(parity_handle.generation(), 0);

    count_handle.set(4).unwrap();
    assert!(subscription.flush().unwrap());
    assert_eq!(container.read(&parity).unwrap(), 0);
    assert_eq!(emissions.load(Ordering::SeqCst), 2);
    assert_eq!(recorder.count("update:parity"), 1);
    assert_eq!(recorder.count("update:count"), 2);
}

/// Test that a change callback may not mark a dependency of the notifying
/// node when debug checks are on.
#[test]
fn notification_order_is_checked() {
    let run = |debug_checks: bool| {
        let source = Provider::new(|_| Ok(0)).named("source");
        let derived = {
            let source = source.clone();
            Provider::computed(move |ctx| ctx.watch(&source)).named("derived")
        };

        let config = GraphConfig::from_json(&format!(r#"{{ "debug_checks": {debug_checks} }}"#))
            .unwrap();
        let container = ProviderContainer::builder().config(config).build().unwrap();
        let source_handle = container.node(&source).unwrap();

        let outcome: Arc<Mutex<Option<Result<(), GraphError>>>> = Arc::default();
        let outcome_clone = outcome.clone();
        let marker = source_handle.clone();
        let mut subscription = container
            .listen(&derived, || {}, move |value| {
                if *value != 0 {
                    *outcome_clone.lock() = Some(marker.mark_may_have_changed());
                }
            })
            .unwrap();

        source_handle.set(1).unwrap();
        assert!(subscription.flush().unwrap());
        let outcome = outcome.lock().take();
        outcome.unwrap()
    };

    assert!(matches!(run(true), Err(GraphError::ProtocolViolation(_))));
    assert!(run(false).is_ok());
}

/// Test that a child container shares unoverridden nodes and shadows the
/// overridden ones.
#[test]
fn child_container_shares_and_shadows() {
    let config = Provider::new(|_| Ok("production".to_string())).named("config");
    let shared = Provider::new(|_| Ok(7)).named("shared");

    let parent = ProviderContainer::new();
    parent.read(&shared).unwrap();
    parent.read(&config).unwrap();

    let child = parent
        .child()
        .overrides([config.override_with_value("test".to_string())])
        .build()
        .unwrap();

    assert_eq!(child.read(&config).unwrap(), "test");
    assert_eq!(parent.read(&config).unwrap(), "production");
    assert!(child
        .node(&shared)
        .unwrap()
        .same_node(&parent.node(&shared).unwrap()));

    // Only the constructing container disposes a node.
    let planned: Vec<String> = child
        .nodes_in_disposal_order()
        .iter()
        .map(ToString::to_string)
        .collect();
    assert_eq!(planned, vec!["config"]);

    parent.dispose().unwrap();
    assert!(child.is_disposed());
    assert!(matches!(
        child.read(&shared),
        Err(GraphError::AlreadyDisposed { .. })
    ));
}

/// Test that derived nodes are private to each container.
#[test]
fn derived_nodes_are_not_inherited() {
    let base = Provider::new(|_| Ok(2i32)).named("base");
    let squared = {
        let base = base.clone();
        Provider::computed(move |ctx| Ok(ctx.watch(&base)?.pow(2))).named("squared")
    };

    let parent = ProviderContainer::new();
    assert_eq!(parent.read(&squared).unwrap(), 4);

    let child = parent
        .child()
        .overrides([base.override_with_value(5)])
        .build()
        .unwrap();
    assert_eq!(child.read(&squared).unwrap(), 25);
    assert!(!child
        .node(&squared)
        .unwrap()
        .same_node(&parent.node(&squared).unwrap()));
}
