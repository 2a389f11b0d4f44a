use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

/// Background task that rewrites a campus WAL once enough appends have
/// accumulated since the last compaction. Rejected bookings survive
/// compaction (audit trail); only the event churn is collapsed.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => tracing::warn!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use crate::wal::Wal;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("aula_test_maintenance");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compaction_collapses_status_churn() {
        let path = test_wal_path("compact_churn.wal");
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(path.clone(), notify).unwrap());

        let hall_id = Ulid::new();
        engine
            .create_hall(hall_id, "Lab 2".into(), HallKind::Lab, 24)
            .await
            .unwrap();

        let requester = Requester {
            user_id: Ulid::new(),
            role: Role::Student,
        };

        // Submit + reject a pile of bookings on the same slot
        for _ in 0..10 {
            let bid = Ulid::new();
            engine
                .submit_booking(
                    bid,
                    hall_id,
                    requester,
                    Span::new(1_000_000_000_000, 1_000_000_060_000),
                    "club meeting".into(),
                )
                .await
                .unwrap();
            engine
                .transition_booking(bid, Action::Reject, Role::Admin)
                .await
                .unwrap();
        }

        let before = std::fs::metadata(&path).unwrap().len();
        engine.compact_wal().await.unwrap();
        // Let the writer task process the swap before measuring
        tokio::time::sleep(Duration::from_millis(50)).await;
        let after = std::fs::metadata(&path).unwrap().len();

        // All bookings are kept (audit), but each now costs submit + one
        // terminal status change, with no redundant records. The file must
        // still replay to the same state.
        assert!(after <= before);
        let replayed = Wal::replay(&path).unwrap();
        assert!(replayed
            .iter()
            .any(|e| matches!(e, Event::HallCreated { id, .. } if *id == hall_id)));

        let _ = std::fs::remove_file(&path);
    }
}
