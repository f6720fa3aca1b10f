use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use integration_tests_sync_collections::*;
use sync_collections::{CollectionConfig, HasLock, ListChange, LockingList};

fn changes(rx: &async_channel::Receiver<ListChange>) -> Vec<ListChange> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

#[test]
fn swapping_two_items_reports_two_changes() {
    let list: LockingList<u32> = vec![0, 1, 2, 3, 4, 5, 6, 8, 7, 9].into();
    let rx = list.subscribe().unwrap();

    list.sort_by(|a, b| a.cmp(b)).unwrap();

    assert_eq!(list.to_vec().unwrap(), (0..10).collect::<Vec<_>>());
    assert_eq!(
        changes(&rx),
        [
            ListChange::ItemChanged { index: 7 },
            ListChange::ItemChanged { index: 8 },
        ]
    );
}

#[test]
fn moving_most_items_collapses_to_reset() {
    let list: LockingList<u32> = vec![5, 4, 3, 0, 1, 2, 6, 7, 8, 9].into();
    let rx = list.subscribe().unwrap();

    list.sort_by(|a, b| a.cmp(b)).unwrap();

    assert_eq!(list.to_vec().unwrap(), (0..10).collect::<Vec<_>>());
    assert_eq!(changes(&rx), [ListChange::Reset]);
}

#[test]
fn reset_threshold_comes_from_config() {
    let config = CollectionConfig {
        sort_reset_ratio: 0.1,
        ..CollectionConfig::named("strict")
    };
    let list: LockingList<u32> = LockingList::with_config(&config);
    for item in [1, 0, 2, 3, 4, 5, 6, 7, 8, 9] {
        list.add(item).unwrap();
    }
    let rx = list.subscribe().unwrap();
    list.sort_by(|a, b| a.cmp(b)).unwrap();
    // Two of ten positions exceed a tenth.
    assert_eq!(changes(&rx), [ListChange::Reset]);
}

#[test]
fn enumeration_isolates_concurrent_add() {
    start_tracing();
    let list: Arc<LockingList<&str>> = Arc::new(vec!["a", "b", "c"].into());
    let mut items = list.enumerate().unwrap();
    let added = Arc::new(AtomicBool::new(false));

    let adder = {
        let (list, added) = (list.clone(), added.clone());
        thread::spawn(move || {
            list.add("d").unwrap();
            added.store(true, Ordering::SeqCst);
        })
    };
    wait_until("add to queue", || list.lock().status().waiting == 1);

    let seen: Vec<_> = items.by_ref().collect();
    assert_eq!(seen, ["a", "b", "c"]);
    thread::sleep(Duration::from_millis(20));
    assert!(!added.load(Ordering::SeqCst));

    items.dispose();
    adder.join().unwrap();
    assert_eq!(list.count().unwrap(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_enumeration_isolates_blocking_add() {
    let list: Arc<LockingList<&str>> = Arc::new(vec!["a", "b", "c"].into());
    let mut items = list.enumerate_async(None).await.unwrap();

    let adder = {
        let list = list.clone();
        thread::spawn(move || list.add("d").unwrap())
    };
    eventually("add to queue", || list.lock().status().waiting == 1).await;
    assert_eq!(items.by_ref().count(), 3);

    items.dispose_async().await;
    let index = tokio::task::spawn_blocking(move || adder.join().unwrap())
        .await
        .unwrap();
    assert_eq!(index, 3);
    assert_eq!(list.count_async(None).await.unwrap(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn subscriber_can_read_the_list_on_every_change() {
    let list = Arc::new(LockingList::new());
    let rx = list.subscribe().unwrap();

    // Changes arrive after the writer let go, so reading back never blocks on
    // the mutation that produced them.
    let reader = {
        let list = list.clone();
        tokio::spawn(async move {
            let mut lengths = Vec::new();
            while lengths.len() < 100 {
                let ListChange::ItemAdded { index } = rx.recv().await.unwrap() else {
                    panic!("only additions were made");
                };
                let len = list.count_async(None).await.unwrap();
                assert!(len > index);
                lengths.push(len);
            }
            lengths
        })
    };
    let writers: Vec<_> = (0..4)
        .map(|w| {
            let list = list.clone();
            thread::spawn(move || {
                for i in 0..25 {
                    list.add(w * 100 + i).unwrap();
                }
            })
        })
        .collect();
    tokio::task::spawn_blocking(move || writers.into_iter().for_each(|t| t.join().unwrap()))
        .await
        .unwrap();

    let lengths = within_patience("subscriber", reader).await.unwrap();
    assert_eq!(lengths.len(), 100);
    assert_eq!(list.count().unwrap(), 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pinned_sort_orders_entities_while_they_are_edited() {
    start_tracing();
    let list = Arc::new(LockingList::from(roster(&[5, 3, 9, 1, 7, 2])));
    let snapshot = list.to_vec_async(None).await.unwrap();
    let stop = Arc::new(AtomicBool::new(false));

    // Editors take each character's own lock for writing, the way gameplay
    // code would, while the roster gets sorted.
    let editors: Vec<_> = snapshot
        .iter()
        .map(|character| {
            let (character, stop) = (character.clone(), stop.clone());
            thread::spawn(move || {
                let mut edits = 0_usize;
                let lock = character.lock_core().expect("characters own a lock");
                loop {
                    drop(lock.enter_write().unwrap());
                    edits += 1;
                    if stop.load(Ordering::SeqCst) {
                        break edits;
                    }
                    thread::yield_now();
                }
            })
        })
        .collect();

    for _ in 0..20 {
        list.sort_by_pinned_async(|a, b| a.level.cmp(&b.level), None)
            .await
            .unwrap();
        list.sort_by_pinned_async(|a, b| b.level.cmp(&a.level), None)
            .await
            .unwrap();
    }
    list.sort_by_pinned_async(|a, b| a.level.cmp(&b.level), None)
        .await
        .unwrap();

    stop.store(true, Ordering::SeqCst);
    let edits: usize = tokio::task::spawn_blocking(move || {
        editors.into_iter().map(|t| t.join().unwrap()).sum()
    })
    .await
    .unwrap();
    assert!(edits > 0);

    let levels: Vec<_> = list
        .to_vec_async(None)
        .await
        .unwrap()
        .iter()
        .map(|c| c.level)
        .collect();
    assert_eq!(levels, [1, 2, 3, 5, 7, 9]);
    for character in &snapshot {
        assert!(character.lock_core().unwrap().status().is_free());
    }
}

#[test]
fn replaced_element_keeps_identity_lock() {
    let list = LockingList::from(roster(&[1, 2]));
    let first = list.get(0).unwrap();
    list.set(0, first.with_level(4)).unwrap();
    let replaced = list.get(0).unwrap();
    assert_eq!(replaced.level, 4);
    assert!(replaced
        .lock_core()
        .unwrap()
        .same_lock(first.lock_core().unwrap()));
    assert!(list.contains(&replaced).unwrap());
    assert!(!list.contains(&first).unwrap());
}
