use std::sync::Mutex;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use geo_harvester::cache::{CacheKey, CacheStore};
use geo_harvester::domain::EntityKind;
use geo_harvester::error::PipelineError;

fn store() -> (tempfile::TempDir, CacheStore) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().join("cache")).unwrap();
    (temp, CacheStore::new(root))
}

#[test]
fn different_params_never_collide() {
    let a = CacheKey::with_params(EntityKind::PubMedSearch, "placenta", &[("retmax", "5")]);
    let b = CacheKey::with_params(EntityKind::PubMedSearch, "placenta", &[("retmax", "20")]);
    let c = CacheKey::with_params(EntityKind::PubMedSummary, "placenta", &[("retmax", "5")]);
    assert_ne!(a.signature(), b.signature());
    assert_ne!(a.signature(), c.signature());
}

#[test]
fn hit_skips_fetch() {
    let (_temp, store) = store();
    let key = CacheKey::new(EntityKind::GeoSeries, "GSE1");
    let calls = Mutex::new(0usize);
    let fetch = || {
        *calls.lock().unwrap() += 1;
        Ok("payload".to_string())
    };
    assert_eq!(store.fetch_through(&key, fetch).unwrap(), "payload");
    assert_eq!(store.fetch_through(&key, fetch).unwrap(), "payload");
    assert_eq!(*calls.lock().unwrap(), 1);

    let stats = store.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.writes, 1);
}

#[test]
fn identical_put_is_noop() {
    let (_temp, store) = store();
    let key = CacheKey::new(EntityKind::SraExperiment, "SRX1");
    store.put(&key, "same").unwrap();
    store.put(&key, "same").unwrap();
    assert_eq!(store.stats().writes, 1);
    store.put(&key, "changed").unwrap();
    assert_eq!(store.get(&key).unwrap().payload, "changed");
}

#[test]
fn corrupt_entry_is_a_miss() {
    let (_temp, store) = store();
    let key = CacheKey::new(EntityKind::PubMedArticle, "123");
    store.put(&key, "<xml/>").unwrap();
    std::fs::write(store.entry_path(&key).as_std_path(), b"{ truncated").unwrap();
    assert!(store.get(&key).is_none());

    let refetched = store
        .fetch_through(&key, || Ok("<xml>fresh</xml>".to_string()))
        .unwrap();
    assert_eq!(refetched, "<xml>fresh</xml>");
    assert_eq!(store.get(&key).unwrap().payload, "<xml>fresh</xml>");
}

#[test]
fn invalid_payloads_are_not_stored() {
    let (_temp, store) = store();
    let key = CacheKey::new(EntityKind::PubMedSearch, "term");
    let payload = store
        .fetch_validated(&key, || Ok("not json".to_string()), |text| text.starts_with('{'))
        .unwrap();
    assert_eq!(payload, "not json");
    assert!(store.get(&key).is_none());
}

#[test]
fn fetch_errors_propagate_without_writing() {
    let (_temp, store) = store();
    let key = CacheKey::new(EntityKind::GeoSeries, "GSE404");
    let result = store.fetch_through(&key, || Err(PipelineError::not_found("geo", "GSE404")));
    assert_matches!(result, Err(PipelineError::NotFound { .. }));
    assert_eq!(store.stats().writes, 0);
    assert!(!store.entry_path(&key).exists());
}

#[test]
fn removed_entry_is_refetched_once() {
    let (_temp, store) = store();
    let key = CacheKey::new(EntityKind::GeoSeries, "GSE7");
    let calls = Mutex::new(0usize);
    let fetch = || {
        *calls.lock().unwrap() += 1;
        Ok("soft".to_string())
    };
    store.fetch_through(&key, fetch).unwrap();
    store.remove(&key).unwrap();
    store.fetch_through(&key, fetch).unwrap();
    store.fetch_through(&key, fetch).unwrap();
    assert_eq!(*calls.lock().unwrap(), 2);
}
