//! Integration Tests for the Atom Graph
//!
//! These tests verify that state atoms, derived atoms, watches, effects,
//! hydration, and the observer hook work together correctly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use nucleus_core::{
    AtomError, AtomEvent, AtomRef, Cleanup, Context, DerivedAtomBuilder, StateAtomBuilder,
};

/// Test a small end-to-end graph: state feeds a derived value, listeners
/// observe synchronously, and equal writes stay invisible everywhere.
#[test]
fn name_graph_end_to_end() {
    let name = StateAtomBuilder::new("name", String::new()).build();

    let name_dep = name.clone();
    let full = DerivedAtomBuilder::new("full-name", move |api| {
        Ok(format!("{} Shiro", api.get(&name_dep)?))
    })
    .build();

    let context = Context::new();
    let full = context.load(&full).unwrap();
    assert_eq!(full.state(), " Shiro");

    let notifications = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = Arc::clone(&seen);
    let name_atom = context.load(&name).unwrap();
    let notifications_clone = Arc::clone(&notifications);
    name_atom.add(move |_: &String| {
        notifications_clone.fetch_add(1, Ordering::SeqCst);
    });
    full.add(move |state: &String| seen_clone.lock().push(state.clone()));

    name_atom.set_state("Ken".to_owned());
    assert_eq!(full.state(), "Ken Shiro");
    assert_eq!(*seen.lock(), vec!["Ken Shiro".to_owned()]);

    // An equal write notifies neither atom.
    name_atom.set_state("Ken".to_owned());
    assert_eq!(notifications.load(Ordering::SeqCst), 1);
    assert_eq!(seen.lock().len(), 1);
}

/// Test that a context seeded with a snapshot hydrates typed state without
/// running default factories, and that a later update reaches loaded atoms.
#[test]
fn session_rehydrates_from_a_snapshot() {
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        level: u32,
    }

    let ran_default = Arc::new(AtomicUsize::new(0));
    let ran_clone = Arc::clone(&ran_default);
    let profile = StateAtomBuilder::with_default_fn("profile", move |_| {
        ran_clone.fetch_add(1, Ordering::SeqCst);
        Ok(Profile {
            name: String::new(),
            level: 0,
        })
    })
    .build();

    let mut state = HashMap::new();
    state.insert("profile".to_owned(), json!({"name": "Ken", "level": 7}));
    let context = Context::with_state(state);

    let atom = context.load(&profile).unwrap();
    assert_eq!(
        atom.state(),
        Profile {
            name: "Ken".to_owned(),
            level: 7
        }
    );
    assert_eq!(ran_default.load(Ordering::SeqCst), 0);

    // A bulk update pushes into the already-loaded atom.
    let mut next = HashMap::new();
    next.insert("profile".to_owned(), json!({"name": "Ken", "level": 8}));
    context.update(next);
    assert_eq!(atom.state().level, 8);

    // A malformed value is skipped; the atom keeps its state.
    let mut bad = HashMap::new();
    bad.insert("profile".to_owned(), json!("not a profile"));
    context.update(bad);
    assert_eq!(atom.state().level, 8);
}

/// Test that a watch registered in setup propagates synchronously, inline
/// with the update that triggered it.
#[test]
fn watch_chain_propagates_synchronously() {
    let source = StateAtomBuilder::new("chain-source", 1).build();

    let source_for_setup = source.clone();
    let follower = StateAtomBuilder::new("chain-follower", 0)
        .setup(move |atom, api| {
            let source = source_for_setup.clone();
            let api_cb = api.clone();
            let atom = atom.clone();
            api.watch(&[source.dep()], move || {
                let value = api_cb.get(&source).expect("source resolves");
                atom.set_state(value * 2);
                None
            })?;
            Ok(None)
        })
        .build();

    let context = Context::new();
    let follower = context.load(&follower).unwrap();
    // The immediate invocation already ran against the source's default.
    assert_eq!(follower.state(), 2);

    context.load(&source).unwrap().set_state(5);
    assert_eq!(follower.state(), 10);
}

/// Test that one flush settles effects that enqueue further work, including
/// the lazy construction of atoms they write to.
#[test]
fn one_flush_settles_cascading_effects() {
    let runs = Arc::new(AtomicI32::new(0));
    let runs_clone = Arc::clone(&runs);

    let sink: AtomRef<i32> = StateAtomBuilder::new("cascade-sink", 0)
        .effect(move |_, _| {
            runs_clone.fetch_add(1, Ordering::SeqCst);
            None
        })
        .build();

    let source = StateAtomBuilder::new("cascade-source", 0).build();
    let source_for_setup = source.clone();
    let sink_for_setup = sink.clone();
    let forwarder = StateAtomBuilder::new("cascade-forwarder", 0)
        .setup(move |_, api| {
            let source = source_for_setup.clone();
            let sink = sink_for_setup.clone();
            let api_cb = api.clone();
            api.effect(&[source.dep()], move || {
                let value = api_cb.get(&source).expect("source resolves");
                api_cb.set(&sink, value + 1).expect("sink resolves");
                None
            })?;
            Ok(None)
        })
        .build();

    let context = Context::new();
    context.load(&forwarder).unwrap();
    assert!(!context.contains("cascade-sink"));

    context.flush();
    // The deferred effect constructed the sink and wrote 1 into it; the
    // sink's own startup effect and update effect both drained in the same
    // flush.
    assert_eq!(context.load(&sink).unwrap().state(), 1);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(context.queue_len(), 0);
}

/// Test that mutually-loading setups fail with a circular reference
/// reported against the atom that initiated the load.
#[test]
fn mutually_loading_setups_are_a_cycle() {
    let slot: Arc<RwLock<Option<AtomRef<i32>>>> = Arc::new(RwLock::new(None));

    let slot_clone = Arc::clone(&slot);
    let b = StateAtomBuilder::new("cycle-b", 0)
        .setup(move |_, api| {
            let a = slot_clone.read().clone().expect("ref installed");
            api.load(&a)?;
            Ok(None)
        })
        .build();

    let b_for_a = b.clone();
    let a = StateAtomBuilder::new("cycle-a", 0)
        .setup(move |_, api| {
            api.load(&b_for_a)?;
            Ok(None)
        })
        .build();
    *slot.write() = Some(a.clone());

    let context = Context::new();
    let error = context.load(&a).unwrap_err();
    assert!(
        matches!(&error, AtomError::CircularReference { key } if key == "cycle-a"),
        "unexpected error: {error}"
    );

    // Neither half of the cycle was registered.
    assert!(!context.contains("cycle-a"));
    assert!(!context.contains("cycle-b"));
}

/// Test that the observer hook receives a created event per first write and
/// an updated event per later write, with serialized snapshots.
#[test]
fn observer_mirrors_the_update_stream() {
    let count = StateAtomBuilder::new("obs-count", 1).build();
    let count_dep = count.clone();
    let doubled =
        DerivedAtomBuilder::new("obs-doubled", move |api| Ok(api.get(&count_dep)? * 2)).build();

    let context = Context::new();
    let events: Arc<Mutex<Vec<(String, AtomEvent, Value)>>> = Arc::new(Mutex::new(Vec::new()));
    let events_clone = Arc::clone(&events);
    context.set_observer(move |key, event, snapshot| {
        events_clone.lock().push((key.to_owned(), event, snapshot));
    });

    context.load(&doubled).unwrap();
    context.load(&count).unwrap().set_state(3);
    // An equal write emits nothing.
    context.load(&count).unwrap().set_state(3);

    assert_eq!(
        *events.lock(),
        vec![
            ("obs-count".to_owned(), AtomEvent::Created, json!(1)),
            ("obs-doubled".to_owned(), AtomEvent::Created, json!(2)),
            ("obs-count".to_owned(), AtomEvent::Updated, json!(3)),
            ("obs-doubled".to_owned(), AtomEvent::Updated, json!(6)),
        ]
    );
}

/// Test that a queue processor can drain immediately, giving effects
/// write-time semantics without explicit flush calls.
#[test]
fn queue_processor_can_drive_an_immediate_bridge() {
    let runs = Arc::new(AtomicI32::new(0));
    let runs_clone = Arc::clone(&runs);
    let count = StateAtomBuilder::new("bridge-count", 0)
        .effect(move |_, _| {
            runs_clone.fetch_add(1, Ordering::SeqCst);
            None
        })
        .build();

    let context = Context::new();
    let drain = context.clone();
    context.set_queue_processor(move || drain.flush());

    let atom = context.load(&count).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    atom.set_state(5);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(context.queue_len(), 0);
}

/// Test that a writable derived atom forwards writes upstream and settles
/// through recomputation.
#[test]
fn writable_derived_round_trip() {
    let celsius = StateAtomBuilder::new("trip-celsius", 20.0_f64).build();

    let celsius_read = celsius.clone();
    let celsius_write = celsius.clone();
    let fahrenheit = DerivedAtomBuilder::new("trip-fahrenheit", move |api| {
        Ok(api.get(&celsius_read)? * 9.0 / 5.0 + 32.0)
    })
    .set(move |next, api| api.set(&celsius_write, (next - 32.0) * 5.0 / 9.0))
    .build();

    let context = Context::new();
    let fahrenheit = context.load(&fahrenheit).unwrap();
    assert_eq!(fahrenheit.state(), 68.0);

    fahrenheit.set_state(32.0);
    assert_eq!(context.load(&celsius).unwrap().state(), 0.0);
    assert_eq!(fahrenheit.state(), 32.0);
}

/// Test that context teardown runs every outstanding cleanup and leaves the
/// graph inert.
#[test]
fn teardown_releases_the_whole_graph() {
    let log = Arc::new(Mutex::new(Vec::new()));

    let source = StateAtomBuilder::new("down-source", 0).build();
    let source_for_setup = source.clone();
    let log_for_effect = Arc::clone(&log);
    let log_for_setup = Arc::clone(&log);
    let watcher = StateAtomBuilder::new("down-watcher", 0)
        .effect(move |_, _| {
            let log = Arc::clone(&log_for_effect);
            Some(Box::new(move || log.lock().push("effect cleanup")) as Cleanup)
        })
        .setup(move |_, api| {
            let log = Arc::clone(&log_for_setup);
            let watch_log = Arc::clone(&log);
            api.watch(&[source_for_setup.dep()], move || {
                let log = Arc::clone(&watch_log);
                Some(Box::new(move || log.lock().push("watch cleanup")) as Cleanup)
            })?;
            Ok(Some(Box::new(move || log.lock().push("setup cleanup")) as Cleanup))
        })
        .build();

    let context = Context::new();
    let watcher = context.load(&watcher).unwrap();
    let source = context.load(&source).unwrap();
    context.flush();

    context.cleanup();
    {
        let log = log.lock();
        assert!(log.contains(&"effect cleanup"));
        assert!(log.contains(&"watch cleanup"));
        assert!(log.contains(&"setup cleanup"));
    }
    assert!(!context.contains("down-watcher"));

    // Torn-down atoms ignore writes and trigger nothing.
    watcher.set_state(9);
    source.set_state(9);
    assert_eq!(watcher.state(), 0);
    assert_eq!(context.queue_len(), 0);
}
