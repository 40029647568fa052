use std::time::Duration;

use futures::StreamExt;

use crate::error::StoreError;
use crate::store::KeyValueStore;

/// Run the full store conformance test suite.
///
/// Call this from your backend's test module with a fresh store instance.
///
/// # Errors
///
/// Returns an error if any conformance test fails.
pub async fn run_store_conformance_tests(store: &dyn KeyValueStore) -> Result<(), StoreError> {
    test_set_if_absent_fresh(store).await?;
    test_set_if_absent_held(store).await?;
    test_delete_idempotent(store).await?;
    test_ttl_expiry(store).await?;
    test_publish_subscribe(store).await?;
    test_unsubscribe_stops_delivery(store).await?;
    Ok(())
}

async fn test_set_if_absent_fresh(store: &dyn KeyValueStore) -> Result<(), StoreError> {
    let set = store
        .set_if_absent("conf-fresh", "1", Duration::from_secs(10))
        .await?;
    assert!(set, "set_if_absent on a fresh key should succeed");
    store.delete("conf-fresh").await?;
    Ok(())
}

async fn test_set_if_absent_held(store: &dyn KeyValueStore) -> Result<(), StoreError> {
    let set = store
        .set_if_absent("conf-held", "1", Duration::from_secs(10))
        .await?;
    assert!(set);

    let set = store
        .set_if_absent("conf-held", "1", Duration::from_secs(10))
        .await?;
    assert!(!set, "set_if_absent on a held key should fail");

    store.delete("conf-held").await?;
    let set = store
        .set_if_absent("conf-held", "1", Duration::from_secs(10))
        .await?;
    assert!(set, "set_if_absent should succeed again after delete");
    store.delete("conf-held").await?;
    Ok(())
}

async fn test_delete_idempotent(store: &dyn KeyValueStore) -> Result<(), StoreError> {
    store
        .set_if_absent("conf-del", "1", Duration::from_secs(10))
        .await?;

    let removed = store.delete("conf-del").await?;
    assert_eq!(removed, 1, "delete should remove the held key");

    let removed = store.delete("conf-del").await?;
    assert_eq!(removed, 0, "delete on an absent key should remove nothing");
    Ok(())
}

async fn test_ttl_expiry(store: &dyn KeyValueStore) -> Result<(), StoreError> {
    let set = store
        .set_if_absent("conf-ttl", "1", Duration::from_millis(50))
        .await?;
    assert!(set);

    tokio::time::sleep(Duration::from_millis(150)).await;

    let set = store
        .set_if_absent("conf-ttl", "1", Duration::from_secs(10))
        .await?;
    assert!(set, "key should be acquirable again after its TTL elapsed");
    store.delete("conf-ttl").await?;
    Ok(())
}

async fn test_publish_subscribe(store: &dyn KeyValueStore) -> Result<(), StoreError> {
    let (mut control, mut stream) = store.subscriber().await?;
    control.subscribe("conf-notify").await?;

    let receivers = store.publish("conf-notify", "released").await?;
    assert!(receivers >= 1, "publish should reach the subscriber");

    let msg = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("message should arrive within a second")
        .expect("stream should not end");
    assert_eq!(msg.channel, "conf-notify");
    assert_eq!(msg.payload, "released");
    Ok(())
}

async fn test_unsubscribe_stops_delivery(store: &dyn KeyValueStore) -> Result<(), StoreError> {
    let (mut control, mut stream) = store.subscriber().await?;
    control.subscribe("conf-quiet").await?;
    control.unsubscribe("conf-quiet").await?;

    store.publish("conf-quiet", "released").await?;

    let delivery = tokio::time::timeout(Duration::from_millis(200), stream.next()).await;
    assert!(
        delivery.is_err(),
        "no message should arrive after unsubscribe"
    );
    Ok(())
}
