use std::time::Duration;

use tandem_core::{EntityKey, EntityState, FieldValue, Intent, OperationStatus};
use tandem_engine::PipelineConfig;
use tandem_harness::{CallEvent, Fault, TestPipeline};

fn rating(n: i64) -> EntityState {
    EntityState::new().with_field("rating", n)
}

fn rating_of(state: Option<EntityState>) -> Option<i64> {
    state?.get("rating").and_then(FieldValue::as_integer)
}

#[tokio::test]
async fn distinct_entities_are_in_flight_together() -> Result<(), Box<dyn std::error::Error>> {
    let pipeline = TestPipeline::new()?;
    let a = EntityKey::item("A")?;
    let b = EntityKey::item("B")?;
    pipeline.executor.hold(&a);
    pipeline.executor.hold(&b);

    pipeline.manager.submit(Intent::add(a.clone(), rating(1)))?;
    pipeline.manager.submit(Intent::add(b.clone(), rating(2)))?;
    pipeline.executor.wait_for_calls(2).await;

    let status = pipeline.manager.get_queue_status();
    assert_eq!(status.processing_items, 2);
    assert_eq!(status.total_queued, 2);

    pipeline.executor.open(&a);
    pipeline.executor.open(&b);
    pipeline.manager.wait_until_idle().await;

    let status = pipeline.manager.get_queue_status();
    assert_eq!(status.processing_items, 0);
    assert!(status.queues_by_item.is_empty());
    assert_eq!(rating_of(pipeline.remote_get(&a).await?), Some(1));
    assert_eq!(rating_of(pipeline.remote_get(&b).await?), Some(2));

    Ok(())
}

#[tokio::test]
async fn one_entity_never_has_overlapping_calls() -> Result<(), Box<dyn std::error::Error>> {
    let pipeline = TestPipeline::new()?;
    let x = EntityKey::item("X")?;
    pipeline.seed(&x, rating(0)).await?;
    pipeline.executor.hold(&x);

    let first = pipeline
        .manager
        .submit(Intent::update(x.clone(), rating(1), Some(rating(0))))?;
    pipeline.executor.wait_for_calls(1).await;

    // the in-flight record cannot absorb these; they collapse into one follow-up
    pipeline
        .manager
        .submit(Intent::update(x.clone(), rating(2), Some(rating(1))))?;
    let last = pipeline
        .manager
        .submit(Intent::update(x.clone(), rating(3), Some(rating(2))))?;
    assert_eq!(pipeline.manager.get_queue_status().queues_by_item.get(&x), Some(&2));
    assert_eq!(rating_of(pipeline.manager.read(&x)), Some(3));

    pipeline.executor.open(&x);
    pipeline.manager.wait_until_idle().await;

    let started: Vec<_> = pipeline.executor.started_for(&x).into_iter().map(|(id, _)| id).collect();
    assert_eq!(started, vec![first, last]);
    assert_eq!(pipeline.executor.max_overlap(&x), 1);
    assert_eq!(rating_of(pipeline.remote_get(&x).await?), Some(3));
    assert_eq!(rating_of(pipeline.manager.confirmed_state(&x)), Some(3));

    Ok(())
}

#[tokio::test]
async fn delete_behind_an_in_flight_add_still_deletes() -> Result<(), Box<dyn std::error::Error>> {
    let pipeline = TestPipeline::new()?;
    let x = EntityKey::item("X")?;
    pipeline.executor.hold(&x);

    pipeline.manager.submit(Intent::add(x.clone(), rating(5)))?;
    pipeline.executor.wait_for_calls(1).await;
    pipeline.manager.submit(Intent::delete(x.clone(), None))?;
    assert!(pipeline.manager.read(&x).is_none());

    pipeline.executor.open(&x);
    pipeline.manager.wait_until_idle().await;

    assert_eq!(pipeline.executor.started_count(), 2);
    assert!(pipeline.remote_get(&x).await?.is_none());
    assert!(pipeline.manager.read(&x).is_none());

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn panicking_entity_does_not_stall_others() -> Result<(), Box<dyn std::error::Error>> {
    let pipeline = TestPipeline::new()?;
    let boom = EntityKey::item("boom")?;
    let fine = EntityKey::item("fine")?;
    pipeline.executor.set_fault(&boom, Fault::Panic);

    let failed = pipeline.manager.submit(Intent::add(boom.clone(), rating(1)))?;
    let confirmed = pipeline.manager.submit(Intent::add(fine.clone(), rating(2)))?;
    pipeline.manager.wait_until_idle().await;

    let failed = pipeline.manager.get_operation(failed).ok_or("operation missing")?;
    assert_eq!(failed.status, OperationStatus::Failed);
    assert!(failed.last_error.unwrap_or_default().contains("panicked"));
    let confirmed = pipeline.manager.get_operation(confirmed).ok_or("operation missing")?;
    assert_eq!(confirmed.status, OperationStatus::Confirmed);
    assert_eq!(confirmed.attempts, 1);

    // rolled back: an add that never landed leaves nothing behind
    assert!(pipeline.manager.read(&boom).is_none());
    assert_eq!(rating_of(pipeline.remote_get(&fine).await?), Some(2));

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn hung_executor_times_out() -> Result<(), Box<dyn std::error::Error>> {
    let config = PipelineConfig::default()
        .with_max_attempts(2)
        .with_execution_timeout(Duration::from_millis(250));
    let pipeline = TestPipeline::with_config(config)?;
    let x = EntityKey::item("X")?;
    pipeline.executor.set_fault(&x, Fault::Hang);

    let op_id = pipeline.manager.submit(Intent::add(x.clone(), rating(1)))?;
    pipeline.manager.wait_until_idle().await;

    let op = pipeline.manager.get_operation(op_id).ok_or("operation missing")?;
    assert_eq!(op.status, OperationStatus::Failed);
    assert_eq!(op.attempts, 2);
    assert!(op.last_error.unwrap_or_default().contains("timed out"));
    // aborted calls never report completion
    assert!(!pipeline
        .executor
        .calls()
        .iter()
        .any(|event| matches!(event, CallEvent::Finished { .. })));
    assert_eq!(pipeline.executor.max_overlap(&x), 1);

    Ok(())
}
