use herald_common::{dlq_name, EnqueueOptions, HeraldError, Message, QueueOptions};
use herald_storage::MemoryDatabase;
use std::time::Duration;

fn msg(n: u32) -> Message {
    Message::command("jobs.run", serde_json::json!({"n": n}))
}

fn queue_options(visibility: Duration) -> QueueOptions {
    QueueOptions {
        visibility_timeout: visibility,
        ..QueueOptions::default()
    }
}

#[tokio::test]
async fn enqueue_dequeue_acknowledge_round_trip() {
    let store = MemoryDatabase::new().queue_store();
    store
        .create_queue("q", queue_options(Duration::from_secs(30)))
        .await
        .unwrap();

    let entry = store.enqueue("q", &msg(1), None).await.unwrap();
    assert_eq!(store.queue_depth("q").await.unwrap(), 1);

    let claimed = store.dequeue("q").await.unwrap().unwrap();
    assert_eq!(claimed.id, entry.id);
    assert_eq!(claimed.dequeue_count, 1);

    // Claimed entries are hidden from other consumers.
    assert!(store.dequeue("q").await.unwrap().is_none());

    assert!(store.acknowledge("q", claimed.id).await.unwrap());
    assert_eq!(store.queue_depth("q").await.unwrap(), 0);
}

#[tokio::test]
async fn unacknowledged_entries_become_visible_again() {
    let store = MemoryDatabase::new().queue_store();
    store
        .create_queue("q", queue_options(Duration::from_millis(100)))
        .await
        .unwrap();
    store.enqueue("q", &msg(1), None).await.unwrap();

    let first = store.dequeue("q").await.unwrap().unwrap();
    assert!(store.dequeue("q").await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(150)).await;
    let second = store.dequeue("q").await.unwrap().unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.dequeue_count, 2);
}

#[tokio::test]
async fn ordering_is_priority_then_fifo() {
    let store = MemoryDatabase::new().queue_store();
    store
        .create_queue("q", queue_options(Duration::from_secs(30)))
        .await
        .unwrap();

    let low_first = store
        .enqueue("q", &msg(1), Some(EnqueueOptions::default().with_priority(1)))
        .await
        .unwrap();
    let low_second = store
        .enqueue("q", &msg(2), Some(EnqueueOptions::default().with_priority(1)))
        .await
        .unwrap();
    let high = store
        .enqueue("q", &msg(3), Some(EnqueueOptions::default().with_priority(5)))
        .await
        .unwrap();

    assert_eq!(store.dequeue("q").await.unwrap().unwrap().id, high.id);
    assert_eq!(store.dequeue("q").await.unwrap().unwrap().id, low_first.id);
    assert_eq!(store.dequeue("q").await.unwrap().unwrap().id, low_second.id);
}

#[tokio::test]
async fn priority_is_ignored_when_disabled() {
    let store = MemoryDatabase::new().queue_store();
    let mut options = queue_options(Duration::from_secs(30));
    options.priority_enabled = false;
    store.create_queue("q", options).await.unwrap();

    let first = store
        .enqueue("q", &msg(1), Some(EnqueueOptions::default().with_priority(0)))
        .await
        .unwrap();
    store
        .enqueue("q", &msg(2), Some(EnqueueOptions::default().with_priority(9)))
        .await
        .unwrap();

    assert_eq!(store.dequeue("q").await.unwrap().unwrap().id, first.id);
}

#[tokio::test]
async fn reject_with_requeue_makes_the_entry_immediately_visible() {
    let store = MemoryDatabase::new().queue_store();
    store
        .create_queue("q", queue_options(Duration::from_secs(30)))
        .await
        .unwrap();
    store.enqueue("q", &msg(1), None).await.unwrap();

    let claimed = store.dequeue("q").await.unwrap().unwrap();
    assert!(store.reject("q", claimed.id, true).await.unwrap());

    let again = store.dequeue("q").await.unwrap().unwrap();
    assert_eq!(again.id, claimed.id);
}

#[tokio::test]
async fn reject_without_requeue_drops_the_entry() {
    let store = MemoryDatabase::new().queue_store();
    store
        .create_queue("q", queue_options(Duration::from_secs(30)))
        .await
        .unwrap();
    store.enqueue("q", &msg(1), None).await.unwrap();

    let claimed = store.dequeue("q").await.unwrap().unwrap();
    assert!(store.reject("q", claimed.id, false).await.unwrap());
    assert_eq!(store.queue_depth("q").await.unwrap(), 0);
    assert!(!store.queue_exists(&dlq_name("q")).await.unwrap());
}

#[tokio::test]
async fn exhausted_entries_route_to_the_dead_letter_sibling() {
    let store = MemoryDatabase::new().queue_store();
    let mut options = queue_options(Duration::from_millis(50));
    options.max_dequeue_count = Some(2);
    store.create_queue("q", options).await.unwrap();

    let entry = store.enqueue("q", &msg(1), None).await.unwrap();
    for expected in 1..=2u32 {
        let claimed = store.dequeue("q").await.unwrap().unwrap();
        assert_eq!(claimed.dequeue_count, expected);
        tokio::time::sleep(Duration::from_millis(80)).await;
    }

    // The third claim exceeds the budget: the entry is returned once more
    // and moves to the sibling.
    let last = store.dequeue("q").await.unwrap().unwrap();
    assert_eq!(last.id, entry.id);
    assert_eq!(last.dequeue_count, 3);

    assert_eq!(store.queue_depth("q").await.unwrap(), 0);
    assert_eq!(store.queue_depth(&dlq_name("q")).await.unwrap(), 1);
    let parked = store.peek(&dlq_name("q"), 1).await.unwrap();
    assert_eq!(parked[0].id, entry.id);
}

#[tokio::test]
async fn expired_entries_are_discarded_on_observation() {
    let store = MemoryDatabase::new().queue_store();
    let mut options = queue_options(Duration::from_secs(30));
    options.message_ttl = Some(Duration::from_millis(40));
    store.create_queue("q", options).await.unwrap();
    store.enqueue("q", &msg(1), None).await.unwrap();

    tokio::time::sleep(Duration::from_millis(70)).await;
    assert!(store.dequeue("q").await.unwrap().is_none());
    assert_eq!(store.queue_depth("q").await.unwrap(), 0);
}

#[tokio::test]
async fn entry_ttl_overrides_the_queue_default() {
    let store = MemoryDatabase::new().queue_store();
    let mut options = queue_options(Duration::from_secs(30));
    options.message_ttl = Some(Duration::from_secs(3600));
    store.create_queue("q", options).await.unwrap();

    store
        .enqueue(
            "q",
            &msg(1),
            Some(EnqueueOptions::default().with_ttl(Duration::from_millis(40))),
        )
        .await
        .unwrap();
    let durable = store.enqueue("q", &msg(2), None).await.unwrap();

    tokio::time::sleep(Duration::from_millis(70)).await;
    let claimed = store.dequeue("q").await.unwrap().unwrap();
    assert_eq!(claimed.id, durable.id);
    assert_eq!(store.queue_depth("q").await.unwrap(), 1);
}

#[tokio::test]
async fn delayed_entries_stay_hidden_until_due() {
    let store = MemoryDatabase::new().queue_store();
    store
        .create_queue("q", queue_options(Duration::from_secs(30)))
        .await
        .unwrap();
    store
        .enqueue(
            "q",
            &msg(1),
            Some(EnqueueOptions::default().with_delay(Duration::from_millis(60))),
        )
        .await
        .unwrap();

    assert!(store.dequeue("q").await.unwrap().is_none());
    tokio::time::sleep(Duration::from_millis(90)).await;
    assert!(store.dequeue("q").await.unwrap().is_some());
}

#[tokio::test]
async fn full_queue_applies_backpressure() {
    let store = MemoryDatabase::new().queue_store();
    let mut options = queue_options(Duration::from_secs(30));
    options.max_size = Some(1);
    store.create_queue("q", options).await.unwrap();

    store.enqueue("q", &msg(1), None).await.unwrap();
    assert!(matches!(
        store.enqueue("q", &msg(2), None).await,
        Err(HeraldError::QueueFull(_))
    ));
}

#[tokio::test]
async fn queues_are_created_lazily_and_deleted_with_contents() {
    let store = MemoryDatabase::new().queue_store();
    store.enqueue("lazy", &msg(1), None).await.unwrap();
    assert!(store.queue_exists("lazy").await.unwrap());

    assert!(store.delete_queue("lazy").await.unwrap());
    assert!(!store.queue_exists("lazy").await.unwrap());
    assert_eq!(store.queue_depth("lazy").await.unwrap(), 0);
}

#[tokio::test]
async fn queue_names_must_be_printable_ascii() {
    let store = MemoryDatabase::new().queue_store();
    assert!(matches!(
        store.create_queue("has space", QueueOptions::default()).await,
        Err(HeraldError::Validation(_))
    ));
    assert!(matches!(
        store.create_queue("", QueueOptions::default()).await,
        Err(HeraldError::Validation(_))
    ));
    assert!(store.create_queue("ok-name.v2", QueueOptions::default()).await.is_ok());
    // Names are case-sensitive.
    assert!(store.create_queue("OK-NAME.v2", QueueOptions::default()).await.is_ok());
}

#[tokio::test]
async fn creating_an_existing_queue_is_a_conflict() {
    let store = MemoryDatabase::new().queue_store();
    store.create_queue("q", QueueOptions::default()).await.unwrap();
    assert!(matches!(
        store.create_queue("q", QueueOptions::default()).await,
        Err(HeraldError::Conflict(_))
    ));
}

#[tokio::test]
async fn peek_does_not_claim() {
    let store = MemoryDatabase::new().queue_store();
    store
        .create_queue("q", queue_options(Duration::from_secs(30)))
        .await
        .unwrap();
    store.enqueue("q", &msg(1), None).await.unwrap();
    store.enqueue("q", &msg(2), None).await.unwrap();

    let peeked = store.peek("q", 5).await.unwrap();
    assert_eq!(peeked.len(), 2);
    assert_eq!(peeked[0].dequeue_count, 0);

    assert!(store.dequeue("q").await.unwrap().is_some());
}
