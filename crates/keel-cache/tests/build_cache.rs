use keel_cache::{
    remote_cache_for_url, BuildCache, CacheEntry, CacheOrigin, FileSnapshotter, HashCode,
    LocalCachePolicy, LocalCacheStore,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};

fn origin() -> CacheOrigin {
    CacheOrigin {
        identity: "jar".to_string(),
        display_name: "Assemble jar".to_string(),
        execution_millis: 40,
        created_at_millis: keel_cache::now_millis(),
    }
}

fn locations(root: &Path) -> BTreeMap<String, PathBuf> {
    BTreeMap::from([
        ("classes".to_string(), root.join("build/classes")),
        ("manifest".to_string(), root.join("build/MANIFEST.MF")),
    ])
}

fn capture(root: &Path, key: HashCode) -> CacheEntry {
    let snapshotter = FileSnapshotter::default();
    let locations = locations(root);
    let outputs = locations
        .iter()
        .map(|(name, path)| (name.clone(), snapshotter.snapshot(path).unwrap()))
        .collect();
    CacheEntry::capture(key, origin(), &locations, outputs).unwrap()
}

#[test]
fn entry_restores_outputs_in_another_checkout() {
    let tmp = tempfile::tempdir().unwrap();
    let producer = tmp.path().join("producer");
    std::fs::create_dir_all(producer.join("build/classes/a")).unwrap();
    std::fs::write(producer.join("build/classes/a/A.class"), b"class A").unwrap();
    std::fs::write(producer.join("build/MANIFEST.MF"), b"Main-Class: A").unwrap();

    let remote = remote_cache_for_url(tmp.path().join("shared").to_str().unwrap()).unwrap();
    let key = HashCode::of_bytes(b"jar-key");
    let producer_cache = BuildCache::new(
        LocalCacheStore::new(tmp.path().join("producer-cache"), LocalCachePolicy::default()),
        Some(Arc::clone(&remote)),
    );
    producer_cache.store(&capture(&producer, key));

    let consumer = tmp.path().join("consumer");
    std::fs::create_dir_all(consumer.join("build/classes")).unwrap();
    std::fs::write(consumer.join("build/classes/Stale.class"), b"old").unwrap();
    let consumer_cache = BuildCache::new(
        LocalCacheStore::new(tmp.path().join("consumer-cache"), LocalCachePolicy::default()),
        Some(remote),
    );

    let entry = consumer_cache.load(&key).unwrap();
    assert_eq!(entry.origin.display_name, "Assemble jar");
    assert!(entry
        .restore(&locations(&consumer), &FileSnapshotter::default())
        .unwrap());
    assert_eq!(
        std::fs::read(consumer.join("build/classes/a/A.class")).unwrap(),
        b"class A"
    );
    assert!(!consumer.join("build/classes/Stale.class").exists());
}

#[test]
fn restore_detects_entry_that_does_not_match_its_snapshots() {
    let tmp = tempfile::tempdir().unwrap();
    let producer = tmp.path().join("producer");
    std::fs::create_dir_all(producer.join("build/classes")).unwrap();
    std::fs::write(producer.join("build/MANIFEST.MF"), b"v1").unwrap();

    let mut entry = capture(&producer, HashCode::of_bytes(b"k"));
    // Pretend the recorded snapshot was taken from different content.
    std::fs::write(producer.join("build/MANIFEST.MF"), b"v2").unwrap();
    let other = capture(&producer, HashCode::of_bytes(b"k"));
    entry.outputs = other.outputs;

    let consumer = tmp.path().join("consumer");
    assert!(!entry
        .restore(&locations(&consumer), &FileSnapshotter::default())
        .unwrap());
}

#[test]
fn concurrent_stores_of_one_key_leave_a_readable_entry() {
    let tmp = tempfile::tempdir().unwrap();
    let producer = tmp.path().join("producer");
    std::fs::create_dir_all(producer.join("build/classes")).unwrap();
    std::fs::write(producer.join("build/MANIFEST.MF"), b"same").unwrap();
    let entry = Arc::new(capture(&producer, HashCode::of_bytes(b"race")));
    let store = Arc::new(LocalCacheStore::new(
        tmp.path().join("cache"),
        LocalCachePolicy::default(),
    ));

    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let entry = Arc::clone(&entry);
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                store.store(&entry).unwrap();
                assert!(store.load(&entry.cache_key).is_some());
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(store.load(&entry.cache_key).as_ref(), Some(entry.as_ref()));
}
