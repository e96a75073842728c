//! # CursorStore
//!
//! Resumable positions of the streaming sources. Tokens are held in memory
//! and written through a [`CursorRepository`] at most once per flush
//! interval, unless forced.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::metrics_consts::{CURSOR_BLOCK_HEIGHT, CURSOR_FLUSHES, SOURCE_STALE};

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum CursorError {
    #[error("cursor storage failed: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorUpdate {
    pub service: String,
    pub token: String,
    pub block_height: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCursor {
    pub token: String,
    pub block_height: Option<u64>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait CursorRepository: Send + Sync {
    async fn latest(&self, service: &str) -> Result<Option<StoredCursor>, CursorError>;

    /// Stores the update, leaving it as the only row of its service.
    async fn save(&self, update: &CursorUpdate) -> Result<(), CursorError>;
}

#[derive(Debug, Clone)]
pub struct PgCursorRepository {
    pool: PgPool,
}

impl PgCursorRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CursorRepository for PgCursorRepository {
    async fn latest(&self, service: &str) -> Result<Option<StoredCursor>, CursorError> {
        let row: Option<(String, Option<String>, DateTime<Utc>)> = sqlx::query_as(
            r#"
SELECT cursor, block_height, updated_at
FROM cursors
WHERE service = $1
ORDER BY updated_at DESC
LIMIT 1
            "#,
        )
        .bind(service)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(token, block_height, updated_at)| StoredCursor {
            token,
            block_height: block_height.and_then(|height| height.parse().ok()),
            updated_at,
        }))
    }

    async fn save(&self, update: &CursorUpdate) -> Result<(), CursorError> {
        let mut txn = self.pool.begin().await?;

        sqlx::query(
            r#"
INSERT INTO cursors (service, cursor, block_height, created_at, updated_at)
VALUES ($1, $2, $3, NOW(), NOW())
ON CONFLICT (service, cursor) DO UPDATE SET
    block_height = EXCLUDED.block_height,
    updated_at = NOW()
            "#,
        )
        .bind(&update.service)
        .bind(&update.token)
        .bind(update.block_height.map(|height| height.to_string()))
        .execute(&mut *txn)
        .await?;

        sqlx::query("DELETE FROM cursors WHERE service = $1 AND cursor <> $2")
            .bind(&update.service)
            .bind(&update.token)
            .execute(&mut *txn)
            .await?;

        txn.commit().await?;
        Ok(())
    }
}

/// Keeps cursors in process memory, for tests and for sources that track
/// their position elsewhere.
#[derive(Debug, Default)]
pub struct MemoryCursorRepository {
    rows: Mutex<HashMap<String, StoredCursor>>,
}

impl MemoryCursorRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_row(service: &str, row: StoredCursor) -> Self {
        let repository = Self::default();
        if let Ok(mut rows) = repository.rows.lock() {
            rows.insert(service.to_owned(), row);
        }
        repository
    }
}

#[async_trait]
impl CursorRepository for MemoryCursorRepository {
    async fn latest(&self, service: &str) -> Result<Option<StoredCursor>, CursorError> {
        let rows = match self.rows.lock() {
            Ok(rows) => rows,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(rows.get(service).cloned())
    }

    async fn save(&self, update: &CursorUpdate) -> Result<(), CursorError> {
        let mut rows = match self.rows.lock() {
            Ok(rows) => rows,
            Err(poisoned) => poisoned.into_inner(),
        };
        rows.insert(
            update.service.clone(),
            StoredCursor {
                token: update.token.clone(),
                block_height: update.block_height,
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }
}

/// Called with the service name and how long it has been silent.
pub type StaleCallback = Arc<dyn Fn(&str, Duration) + Send + Sync>;

pub struct CursorStore {
    service: String,
    repository: Arc<dyn CursorRepository>,
    flush_interval: Duration,
    stale_after: Duration,
    on_stale: Option<StaleCallback>,
    pending: Option<CursorUpdate>,
    last_flush: Instant,
    last_received: Option<Instant>,
}

impl CursorStore {
    pub fn new(service: &str, repository: Arc<dyn CursorRepository>, stale_after: Duration) -> Self {
        Self {
            service: service.to_owned(),
            repository,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            stale_after,
            on_stale: None,
            pending: None,
            last_flush: Instant::now(),
            last_received: None,
        }
    }

    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    pub fn with_on_stale(mut self, on_stale: StaleCallback) -> Self {
        self.on_stale = Some(on_stale);
        self
    }

    /// The newest known token, pending or stored.
    pub async fn get_latest(&self) -> Result<Option<String>, CursorError> {
        if let Some(pending) = &self.pending {
            return Ok(Some(pending.token.clone()));
        }
        Ok(self
            .repository
            .latest(&self.service)
            .await?
            .map(|stored| stored.token))
    }

    /// Records a committed position. It is written out when forced or when the
    /// flush interval has passed since the last write.
    pub async fn update(
        &mut self,
        token: String,
        block_height: Option<u64>,
        force: bool,
    ) -> Result<(), CursorError> {
        let now = Instant::now();
        self.last_received = Some(now);
        self.pending = Some(CursorUpdate {
            service: self.service.clone(),
            token,
            block_height,
        });

        if force || now.duration_since(self.last_flush) >= self.flush_interval {
            self.flush().await?;
        }
        Ok(())
    }

    /// Writes the pending token now, if there is one.
    pub async fn flush(&mut self) -> Result<(), CursorError> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };

        if let Err(error) = self.repository.save(&pending).await {
            // Keep it for the next attempt unless a newer one arrived meanwhile.
            self.pending.get_or_insert(pending);
            return Err(error);
        }

        self.last_flush = Instant::now();
        metrics::counter!(CURSOR_FLUSHES, "service" => self.service.clone()).increment(1);
        if let Some(height) = pending.block_height {
            metrics::gauge!(CURSOR_BLOCK_HEIGHT, "service" => self.service.clone())
                .set(height as f64);
        }
        debug!(service = %self.service, token = %pending.token, "flushed cursor");
        Ok(())
    }

    /// Restarts the silence clock after a (re)connect.
    pub fn mark_connected(&mut self) {
        self.last_received = Some(Instant::now());
    }

    /// Whether the stream went silent for longer than the threshold since the
    /// last event or connect. Staleness fires the callback.
    pub fn is_stale(&self) -> bool {
        self.last_received
            .is_some_and(|received| self.exceeds_threshold(received.elapsed()))
    }

    fn exceeds_threshold(&self, silence: Duration) -> bool {
        if silence <= self.stale_after {
            return false;
        }

        warn!(
            service = %self.service,
            silent_for_secs = silence.as_secs(),
            "cursor is stale"
        );
        metrics::counter!(SOURCE_STALE, "service" => self.service.clone()).increment(1);
        if let Some(on_stale) = &self.on_stale {
            on_stale(&self.service, silence);
        }
        true
    }

    /// Returns the token to resume from, or `None` when there is none or it
    /// is too old to replay from. Staleness fires the callback.
    pub async fn check_staleness(&self) -> Result<Option<String>, CursorError> {
        let stored = match &self.pending {
            Some(_) => None,
            None => self.repository.latest(&self.service).await?,
        };

        let silence = match self.last_received {
            Some(received) => Some(received.elapsed()),
            None => stored.as_ref().map(|stored| {
                (Utc::now() - stored.updated_at)
                    .to_std()
                    .unwrap_or(Duration::ZERO)
            }),
        };

        if silence.is_some_and(|silence| self.exceeds_threshold(silence)) {
            return Ok(None);
        }

        let token = match &self.pending {
            Some(pending) => Some(pending.token.clone()),
            None => stored.map(|stored| stored.token),
        };
        if token.is_none() {
            info!(service = %self.service, "no stored cursor");
        }
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    const STALE_AFTER: Duration = Duration::from_secs(300);

    fn new_store(repository: Arc<MemoryCursorRepository>) -> CursorStore {
        CursorStore::new("geyser", repository, STALE_AFTER)
    }

    async fn stored_token(repository: &MemoryCursorRepository) -> Option<String> {
        repository
            .latest("geyser")
            .await
            .unwrap()
            .map(|stored| stored.token)
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_at_most_once_per_interval() {
        let repository = Arc::new(MemoryCursorRepository::new());
        let mut store = new_store(repository.clone());

        store.update("c1".to_owned(), Some(1), false).await.unwrap();
        assert_eq!(stored_token(&repository).await, None);
        assert_eq!(store.get_latest().await.unwrap(), Some("c1".to_owned()));

        tokio::time::advance(Duration::from_secs(10)).await;
        store.update("c2".to_owned(), Some(2), false).await.unwrap();
        assert_eq!(stored_token(&repository).await, None);

        tokio::time::advance(Duration::from_secs(20)).await;
        store.update("c3".to_owned(), Some(3), false).await.unwrap();
        assert_eq!(stored_token(&repository).await, Some("c3".to_owned()));

        store.update("c4".to_owned(), Some(4), true).await.unwrap();
        assert_eq!(stored_token(&repository).await, Some("c4".to_owned()));
    }

    #[tokio::test(start_paused = true)]
    async fn flush_writes_pending_token() {
        let repository = Arc::new(MemoryCursorRepository::new());
        let mut store = new_store(repository.clone());

        store.update("c1".to_owned(), None, false).await.unwrap();
        store.flush().await.unwrap();
        assert_eq!(stored_token(&repository).await, Some("c1".to_owned()));
        // Nothing pending, nothing to do.
        store.flush().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn silence_after_last_event_is_stale() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let repository = Arc::new(MemoryCursorRepository::new());
        let mut store = new_store(repository).with_on_stale(Arc::new(move |_: &str, _: Duration| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(store.check_staleness().await.unwrap(), None);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        store.update("c1".to_owned(), Some(1), true).await.unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(store.check_staleness().await.unwrap(), Some("c1".to_owned()));

        tokio::time::advance(STALE_AFTER).await;
        assert_eq!(store.check_staleness().await.unwrap(), None);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        assert!(store.is_stale());
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        store.mark_connected();
        assert!(!store.is_stale());
        assert_eq!(store.check_staleness().await.unwrap(), Some("c1".to_owned()));
    }

    #[tokio::test]
    async fn old_stored_row_is_stale_before_any_event() {
        let old = StoredCursor {
            token: "old".to_owned(),
            block_height: Some(1),
            updated_at: Utc::now() - chrono::Duration::hours(1),
        };
        let store = new_store(Arc::new(MemoryCursorRepository::with_row("geyser", old.clone())));
        assert_eq!(store.check_staleness().await.unwrap(), None);

        let fresh = StoredCursor {
            updated_at: Utc::now(),
            ..old
        };
        let store = new_store(Arc::new(MemoryCursorRepository::with_row("geyser", fresh)));
        assert_eq!(store.check_staleness().await.unwrap(), Some("old".to_owned()));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn postgres_keeps_one_row_per_service(db: PgPool) {
        let repository = Arc::new(PgCursorRepository::new(db.clone()));
        let mut store = CursorStore::new("substreams", repository.clone(), STALE_AFTER);

        for (i, token) in ["a", "b", "c", "b"].iter().enumerate() {
            store
                .update((*token).to_owned(), Some(i as u64), true)
                .await
                .unwrap();
        }
        repository
            .save(&CursorUpdate {
                service: "other".to_owned(),
                token: "x".to_owned(),
                block_height: None,
            })
            .await
            .unwrap();

        let rows: Vec<(String, Option<String>)> =
            sqlx::query_as("SELECT cursor, block_height FROM cursors WHERE service = 'substreams'")
                .fetch_all(&db)
                .await
                .unwrap();
        assert_eq!(rows, vec![("b".to_owned(), Some("3".to_owned()))]);

        let latest = repository.latest("substreams").await.unwrap().unwrap();
        assert_eq!(latest.block_height, Some(3));
        assert!(repository.latest("other").await.unwrap().is_some());
    }
}
