use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{Engine, now_ms};
use crate::observability;

/// Background task that returns abandoned holds to Open.
pub async fn run_reaper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let expired = engine.expire_sweep(now_ms()).await;
        if expired > 0 {
            debug!("reaper expired {expired} holds");
        }
    }
}

/// Background task that compacts the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
    }
}

/// Returns whether a compaction ran.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            metrics::counter!(observability::WAL_COMPACTIONS_TOTAL).increment(1);
            info!("compacted WAL after {appends} appends");
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineSettings;
    use crate::model::*;
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotlease_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn reaper_reopens_abandoned_slot() {
        let path = test_wal_path("reaper_abandon.wal");
        let settings = EngineSettings {
            lease_ms: 50,
            ..EngineSettings::default()
        };
        let engine = Arc::new(Engine::new(path, settings).unwrap());

        let start = now_ms() + DAY_MS;
        engine.insert_many(&[Span::slot_at(start)]).await.unwrap();
        let id = engine.list(now_ms()).await[0].id;
        let grant = engine.acquire(id).await.unwrap();

        tokio::spawn(run_reaper(engine.clone(), Duration::from_millis(20)));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let slot = engine.slot(&id).unwrap();
        assert_eq!(slot.read().await.state, SlotState::Open);
        assert!(matches!(
            engine.extend(id, grant.token).await,
            Err(crate::engine::EngineError::HoldNotFound(_))
        ));
    }

    #[tokio::test]
    async fn compaction_waits_for_threshold() {
        let path = test_wal_path("reaper_compact.wal");
        let engine = Engine::new(path, EngineSettings::default()).unwrap();
        let start = now_ms() + DAY_MS;
        engine.insert_many(&[Span::slot_at(start)]).await.unwrap();
        let id = engine.list(now_ms()).await[0].id;
        for _ in 0..3 {
            let grant = engine.acquire(id).await.unwrap();
            engine.release(id, grant.token).await.unwrap();
        }

        assert!(!compact_if_needed(&engine, 100).await);
        assert!(compact_if_needed(&engine, 5).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert_eq!(engine.slot_count(), 1);
    }
}
