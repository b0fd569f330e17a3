//! Integration tests for the Reveille host stack.
//!
//! These exercise the file-backed ledger together with the engine the way
//! the binary wires them, across simulated process restarts and reboots.

use std::path::Path;
use std::sync::Arc;

use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use reveille_engine::{
    AlarmService, Engine, EngineConfig, FireOutcome, InMemoryPlatform, NotificationId,
    NotificationRequest, NotificationSurface, PermissionPrompter, RecoveryEvent, RecoveryOutcome,
    ScheduleLedger, TriggerRoute,
};
use reveille_store::FileLedger;

/// A fresh process: new ledger handle and engine over the same files and platform.
fn start_process(ledger_path: &Path, platform: &Arc<InMemoryPlatform>) -> Engine {
    let ledger = Arc::new(FileLedger::open(Some(ledger_path.to_path_buf())));
    Engine::new(
        EngineConfig::default(),
        ledger as Arc<dyn ScheduleLedger>,
        Arc::clone(platform) as Arc<dyn AlarmService>,
        Arc::clone(platform) as Arc<dyn NotificationSurface>,
        Arc::clone(platform) as Arc<dyn PermissionPrompter>,
    )
}

fn user_ids(triggers: &[reveille_engine::TriggerRegistration]) -> Vec<i32> {
    let mut ids: Vec<i32> = triggers
        .iter()
        .filter(|t| !t.id.is_reserved())
        .map(|t| t.id.get())
        .collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn test_reminders_survive_restart_and_reboot() {
    let dir = TempDir::new().unwrap();
    let ledger_path = dir.path().join("ledger.json");
    let platform = Arc::new(InMemoryPlatform::new(true));

    {
        let engine = start_process(&ledger_path, &platform);
        for id in [1, 2, 3] {
            engine
                .create_or_update_reminder(NotificationRequest::once(
                    NotificationId::new(id),
                    format!("Reminder {id}"),
                    "body",
                    Utc::now() + Duration::hours(1),
                ))
                .await
                .unwrap();
        }
        engine.cancel_reminder(NotificationId::new(2)).await.unwrap();
    }

    platform.reboot().await;
    assert!(platform.snapshot().await.is_empty());

    let engine = start_process(&ledger_path, &platform);
    let outcome = engine.handle_event(RecoveryEvent::BootCompleted).await;
    let RecoveryOutcome::Completed(report) = outcome else {
        panic!("expected completed recovery, got {outcome:?}");
    };
    assert_eq!(report.registered, 3); // two reminders and the health check

    let live = platform.snapshot().await;
    assert_eq!(user_ids(&live), vec![1, 3]);
    assert!(live.iter().any(|t| t.id == NotificationId::HEALTH_CHECK));
    assert!(!live.iter().any(|t| t.id.is_fallback()));
}

#[tokio::test]
async fn test_fired_trigger_renders_after_process_death() {
    let dir = TempDir::new().unwrap();
    let ledger_path = dir.path().join("ledger.json");
    let platform = Arc::new(InMemoryPlatform::new(true));

    {
        let engine = start_process(&ledger_path, &platform);
        engine
            .create_or_update_reminder(NotificationRequest::once(
                NotificationId::new(5),
                "Stretch",
                "Stand up for a minute",
                Utc::now() + Duration::seconds(1),
            ))
            .await
            .unwrap();
    }

    // The trigger fires into a process that never scheduled it
    let due = platform.take_due(Utc::now() + Duration::minutes(1)).await;
    assert_eq!(due.len(), 1);

    let engine = start_process(&ledger_path, &platform);
    let outcome = engine.handle_fire(due[0].route, &due[0].payload).await;
    assert!(matches!(outcome, FireOutcome::Rendered(_)));

    let rendered = platform.rendered();
    assert_eq!(rendered.len(), 1);
    assert_eq!(rendered[0].title, "Stretch");
    assert_eq!(rendered[0].body, "Stand up for a minute");

    // Delivered one-shots leave the ledger, even for the next process
    let engine = start_process(&ledger_path, &platform);
    assert!(engine.reminders().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_health_check_fire_repairs_lost_trigger() {
    let dir = TempDir::new().unwrap();
    let ledger_path = dir.path().join("ledger.json");
    let platform = Arc::new(InMemoryPlatform::new(true));
    let engine = start_process(&ledger_path, &platform);

    engine
        .create_or_update_reminder(NotificationRequest::once(
            NotificationId::new(9),
            "Water plants",
            "",
            Utc::now() + Duration::hours(4),
        ))
        .await
        .unwrap();
    platform.reboot().await;

    let outcome = engine.handle_fire(TriggerRoute::HealthCheck, &[]).await;
    assert!(matches!(
        outcome,
        FireOutcome::Recovered(RecoveryOutcome::Completed(_))
    ));
    assert_eq!(user_ids(&platform.snapshot().await), vec![9]);
}

#[tokio::test]
async fn test_garbage_payload_still_renders() {
    let dir = TempDir::new().unwrap();
    let platform = Arc::new(InMemoryPlatform::new(true));
    let engine = start_process(&dir.path().join("ledger.json"), &platform);

    let outcome = engine
        .handle_fire(TriggerRoute::Render, b"\xff\x00not a payload")
        .await;
    let FireOutcome::Rendered(delivery) = outcome else {
        panic!("expected a rendered notification");
    };
    assert!(delivery.source.is_none());
    assert_eq!(delivery.notification.id, NotificationId::UNDECODABLE);
    assert_eq!(platform.rendered().len(), 1);
}
