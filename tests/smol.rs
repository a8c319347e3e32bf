//! Tests for watchers driven by the smol runtime.
//!
//! Handlers are synchronous; watchers let async consumers wait for the
//! next change instead. These tests verify that watchers wake on genuine
//! changes only, and fail once the store disposes the channel.

use std::{thread, time::Duration};

use statecast::{NamedStore, Payload, RecvError, Topic, TypedStore};

struct Progress;
impl Topic for Progress {
    type Value = u32;
}

#[test]
fn changed_wakes_on_publish_from_another_thread() {
    smol::block_on(async {
        let store = std::sync::Arc::new(TypedStore::new());
        let mut watcher = store.watch::<Progress>();

        let publisher = {
            let store = store.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                store.dispatch::<Progress>(42).unwrap();
            })
        };

        assert!(watcher.changed().await.is_ok());
        let guard = watcher.borrow_and_update();
        assert!(guard.has_changed());
        assert_eq!(*guard, Some(42));
        drop(guard);
        publisher.join().unwrap();
    });
}

#[test]
fn changed_fails_after_dispose() {
    smol::block_on(async {
        let store = NamedStore::new();
        let watcher = store.watch("status").unwrap();
        store.dispose();

        let result = watcher.changed().await;
        assert!(matches!(result, Err(RecvError::Disposed)));
    });
}

#[test]
fn wait_for_condition() {
    smol::block_on(async {
        let store = std::sync::Arc::new(TypedStore::new());
        let mut watcher = store.watch::<Progress>();

        let publisher = {
            let store = store.clone();
            thread::spawn(move || {
                for i in 1..=5 {
                    thread::sleep(Duration::from_millis(5));
                    store.dispatch::<Progress>(i).unwrap();
                }
            })
        };

        let guard = watcher
            .wait_for(|value| value.is_some_and(|v| *v == 5))
            .await
            .unwrap();
        assert_eq!(*guard, Some(5));
        drop(guard);
        publisher.join().unwrap();
    });
}

#[test]
fn unchanged_publish_does_not_wake() {
    smol::block_on(async {
        let store = NamedStore::new();
        store.update_state("k", Payload::new(1)).unwrap();
        let watcher = store.watch("k").unwrap();

        store.update_state("K", Payload::new(1)).unwrap();
        assert!(!watcher.has_changed().unwrap());

        store.update_state("k", Payload::new(2)).unwrap();
        watcher.changed().await.unwrap();
    });
}
