use anyhow::Result;
use chrono::{Duration, Utc};

use super::{
    IgnoreReason, ProgressError, ProgressPayload, ProgressStage, ProgressTracker, ProgressUpdate,
    UpsertOutcome, store,
};

fn tracker() -> ProgressTracker {
    ProgressTracker::new(store::memory(), 4 * 60 * 60)
}

fn update(task_id: &str, stage: ProgressStage, sequence: u64, percent: u8) -> ProgressUpdate {
    ProgressUpdate {
        task_id: task_id.to_string(),
        stage,
        sequence,
        payload: ProgressPayload {
            percent,
            message: format!("{} {percent}%", stage.as_str()),
        },
    }
}

#[tokio::test]
async fn progress_expires_after_ttl() -> Result<()> {
    let tracker = tracker();
    let now = Utc::now();
    tracker
        .upsert(update("t1", ProgressStage::Running, 1, 10), None, now)
        .await?;

    let read = tracker.read("t1", now + Duration::hours(1)).await?;
    let record = read.expect("live record");
    assert_eq!(record.ttl_remaining_seconds(now + Duration::hours(1)), 3 * 60 * 60);

    assert!(tracker.read("t1", now + Duration::hours(5)).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn record_is_readable_at_its_expiry_instant() -> Result<()> {
    let tracker = tracker();
    let now = Utc::now();
    tracker
        .upsert(update("t1", ProgressStage::Running, 1, 10), None, now)
        .await?;
    let expires_at = now + Duration::hours(4);

    let record = tracker.read("t1", expires_at).await?;
    assert_eq!(record.map(|record| record.expires_at), Some(expires_at));
    assert_eq!(tracker.sweep_expired(expires_at).await?, 0);
    assert!(tracker.read("t1", expires_at).await?.is_some());

    let just_after = expires_at + Duration::milliseconds(1);
    assert!(tracker.read("t1", just_after).await?.is_none());
    assert_eq!(tracker.sweep_expired(just_after).await?, 1);
    Ok(())
}

#[tokio::test]
async fn stale_sequence_leaves_record_unchanged() -> Result<()> {
    let tracker = tracker();
    let now = Utc::now();
    tracker
        .upsert(update("t1", ProgressStage::Running, 5, 50), None, now)
        .await?;

    for sequence in [3, 5] {
        let outcome = tracker
            .upsert(
                update("t1", ProgressStage::Running, sequence, 20),
                None,
                now + Duration::seconds(1),
            )
            .await?;
        assert_eq!(
            outcome,
            UpsertOutcome::Ignored {
                reason: IgnoreReason::StaleSequence
            }
        );
    }

    let record = tracker.read("t1", now).await?.expect("record");
    assert_eq!(record.sequence, 5);
    assert_eq!(record.payload.percent, 50);
    assert_eq!(record.updated_at, now);
    Ok(())
}

#[tokio::test]
async fn terminal_stage_is_final() -> Result<()> {
    let tracker = tracker();
    let now = Utc::now();
    tracker
        .upsert(update("t2", ProgressStage::Completed, 3, 100), None, now)
        .await?;

    let outcome = tracker
        .upsert(update("t2", ProgressStage::Running, 4, 60), None, now)
        .await?;
    assert_eq!(
        outcome,
        UpsertOutcome::Ignored {
            reason: IgnoreReason::TerminalStage
        }
    );
    let record = tracker.read("t2", now).await?.expect("record");
    assert_eq!(record.stage, ProgressStage::Completed);
    Ok(())
}

#[tokio::test]
async fn stage_cannot_move_backwards() -> Result<()> {
    let tracker = tracker();
    let now = Utc::now();
    tracker
        .upsert(update("t3", ProgressStage::Running, 1, 5), None, now)
        .await?;
    let outcome = tracker
        .upsert(update("t3", ProgressStage::Queued, 2, 0), None, now)
        .await?;
    assert_eq!(
        outcome,
        UpsertOutcome::Ignored {
            reason: IgnoreReason::StageRegression
        }
    );

    let outcome = tracker
        .upsert(update("t3", ProgressStage::Errored, 3, 5), None, now)
        .await?;
    assert!(matches!(outcome, UpsertOutcome::Applied { .. }));
    Ok(())
}

#[tokio::test]
async fn expired_record_is_treated_as_absent_on_write() -> Result<()> {
    let tracker = tracker();
    let now = Utc::now();
    tracker
        .upsert(
            update("t4", ProgressStage::Completed, 9, 100),
            Some(Duration::minutes(1)),
            now,
        )
        .await?;

    let later = now + Duration::minutes(2);
    let outcome = tracker
        .upsert(update("t4", ProgressStage::Queued, 1, 0), None, later)
        .await?;
    assert!(matches!(outcome, UpsertOutcome::Applied { .. }));
    let record = tracker.read("t4", later).await?.expect("record");
    assert_eq!(record.stage, ProgressStage::Queued);
    assert_eq!(record.sequence, 1);
    Ok(())
}

#[tokio::test]
async fn sweep_removes_only_expired_records() -> Result<()> {
    let tracker = tracker();
    let now = Utc::now();
    tracker
        .upsert(
            update("short", ProgressStage::Running, 1, 1),
            Some(Duration::seconds(30)),
            now,
        )
        .await?;
    tracker
        .upsert(update("long", ProgressStage::Running, 1, 1), None, now)
        .await?;

    let removed = tracker.sweep_expired(now + Duration::minutes(1)).await?;
    assert_eq!(removed, 1);
    assert!(tracker.read("long", now + Duration::minutes(1)).await?.is_some());

    assert!(tracker.delete("long").await?);
    assert!(!tracker.delete("long").await?);
    Ok(())
}

#[tokio::test]
async fn invalid_updates_are_errors() {
    let tracker = tracker();
    let now = Utc::now();
    let result = tracker
        .upsert(update("t5", ProgressStage::Running, 1, 101), None, now)
        .await;
    assert!(matches!(result, Err(ProgressError::InvalidPayload(_))));

    let result = tracker
        .upsert(update(" ", ProgressStage::Running, 1, 1), None, now)
        .await;
    assert!(matches!(result, Err(ProgressError::InvalidTaskId)));
}
