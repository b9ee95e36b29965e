//! Deduplicating market aggregator.
//!
//! One table, keyed by `(source, match key)`, holding the best-known state
//! per market. Merge policy is last-write-wins in arrival order — embedded
//! producer timestamps are informational only, because the producer
//! processes do not share a clock. Readers (dashboard views, the SSE
//! stream) take consistent snapshots while feeds keep writing; nothing
//! holds the lock across an await.
//!
//! Entries a source stops refreshing are evicted by the staleness sweep, so
//! a producer left running after its consumers are gone cannot grow the
//! table without bound.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::identity::MatchKey;
use crate::model::{NormalizedMarket, SourceId};

/// Change notification fanned out to subscribers. Slow or dropped
/// subscribers lag on their own channel; the table is unaffected.
#[derive(Debug, Clone)]
pub enum MarketChange {
    Updated(NormalizedMarket),
    Evicted {
        source: SourceId,
        match_key: MatchKey,
    },
}

struct Entry {
    market: NormalizedMarket,
    last_refresh: Instant,
}

/// Thread-safe handle to the aggregation table. Cheap to clone.
#[derive(Clone)]
pub struct Aggregator {
    inner: Arc<RwLock<HashMap<(SourceId, MatchKey), Entry>>>,
    changes: broadcast::Sender<MarketChange>,
    stale_after: Duration,
}

impl Aggregator {
    pub fn new(stale_after: Duration) -> Self {
        let (changes, _) = broadcast::channel(1024);
        Aggregator {
            inner: Arc::new(RwLock::new(HashMap::new())),
            changes,
            stale_after,
        }
    }

    /// Merge one normalized update. Re-delivery of an identical quote only
    /// refreshes liveness: the snapshot is unchanged and no notification
    /// goes out.
    pub async fn ingest(&self, market: NormalizedMarket) {
        let key = (market.source, market.match_key.clone());
        let mut table = self.inner.write().await;
        if let Some(entry) = table.get_mut(&key) {
            if entry.market.same_quote(&market) {
                entry.last_refresh = Instant::now();
                return;
            }
        }
        table.insert(
            key,
            Entry {
                market: market.clone(),
                last_refresh: Instant::now(),
            },
        );
        drop(table);
        // No receivers is fine; the dashboard may not be attached yet.
        let _ = self.changes.send(MarketChange::Updated(market));
    }

    /// Consistent point-in-time view, one record per (source, match key),
    /// sorted for deterministic output.
    pub async fn snapshot(&self) -> Vec<NormalizedMarket> {
        let table = self.inner.read().await;
        let mut markets: Vec<NormalizedMarket> =
            table.values().map(|e| e.market.clone()).collect();
        markets.sort_by(|a, b| {
            a.match_key
                .cmp(&b.match_key)
                .then_with(|| a.source.cmp(&b.source))
        });
        markets
    }

    /// Subscribe to change notifications. Dropping the receiver is a clean
    /// unsubscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<MarketChange> {
        self.changes.subscribe()
    }

    /// Evict entries whose source has stopped refreshing them. Returns the
    /// number removed. A later fresh update for an evicted key re-enters
    /// cleanly through `ingest`.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut evicted: Vec<(SourceId, MatchKey)> = Vec::new();
        {
            let mut table = self.inner.write().await;
            table.retain(|key, entry| {
                if now.duration_since(entry.last_refresh) > self.stale_after {
                    evicted.push(key.clone());
                    false
                } else {
                    true
                }
            });
        }
        for (source, match_key) in evicted.iter().cloned() {
            debug!("evicting stale market {} from {}", match_key, source);
            let _ = self.changes.send(MarketChange::Evicted { source, match_key });
        }
        evicted.len()
    }

    /// Spawn the background staleness sweep.
    pub fn spawn_sweeper(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let aggregator = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let evicted = aggregator.sweep().await;
                if evicted > 0 {
                    info!("staleness sweep evicted {} market entries", evicted);
                }
            }
        })
    }

    /// Number of live (source, match key) entries.
    #[allow(dead_code)]
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::match_key;
    use chrono::{NaiveDate, Utc};
    use tokio::sync::broadcast::error::TryRecvError;

    fn market(source: SourceId, prob: f64) -> NormalizedMarket {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        NormalizedMarket {
            source,
            match_key: match_key("Arsenal", "Chelsea", date),
            team1: "Arsenal".into(),
            team2: "Chelsea".into(),
            event_date: date,
            probability: prob,
            volume: Some(1000.0),
            ticker: None,
            last_updated: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_ingest_is_idempotent() {
        let agg = Aggregator::new(Duration::from_secs(600));
        let mut rx = agg.subscribe();

        let m = market(SourceId::Kalshi, 0.55);
        agg.ingest(m.clone()).await;
        // Re-delivery with a fresher receipt time is still the same quote.
        let mut dup = m.clone();
        dup.last_updated = m.last_updated + chrono::Duration::seconds(5);
        agg.ingest(dup).await;

        assert_eq!(agg.snapshot().await.len(), 1);
        assert!(matches!(rx.try_recv(), Ok(MarketChange::Updated(_))));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_last_write_wins_in_arrival_order() {
        let agg = Aggregator::new(Duration::from_secs(600));
        agg.ingest(market(SourceId::Kalshi, 0.55)).await;
        agg.ingest(market(SourceId::Kalshi, 0.61)).await;

        let snap = agg.snapshot().await;
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].probability, 0.61);
    }

    #[tokio::test]
    async fn test_sources_do_not_clobber_each_other() {
        let agg = Aggregator::new(Duration::from_secs(600));
        agg.ingest(market(SourceId::Kalshi, 0.55)).await;
        agg.ingest(market(SourceId::Manifold, 0.61)).await;
        assert_eq!(agg.snapshot().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_entries_evicted_and_reappear() {
        let agg = Aggregator::new(Duration::from_secs(60));
        let mut rx = agg.subscribe();

        agg.ingest(market(SourceId::Kalshi, 0.55)).await;
        let _ = rx.try_recv();

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(agg.sweep().await, 1);
        assert!(agg.snapshot().await.is_empty());
        assert!(matches!(rx.try_recv(), Ok(MarketChange::Evicted { .. })));

        // A fresh update for the same key re-enters cleanly.
        agg.ingest(market(SourceId::Kalshi, 0.58)).await;
        assert_eq!(agg.snapshot().await.len(), 1);
        assert!(matches!(rx.try_recv(), Ok(MarketChange::Updated(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_delivery_refreshes_liveness() {
        let agg = Aggregator::new(Duration::from_secs(60));
        let m = market(SourceId::Kalshi, 0.55);

        agg.ingest(m.clone()).await;
        tokio::time::advance(Duration::from_secs(40)).await;
        agg.ingest(m.clone()).await;
        tokio::time::advance(Duration::from_secs(40)).await;

        // 80s since first ingest, 40s since refresh: still live.
        assert_eq!(agg.sweep().await, 0);
        assert_eq!(agg.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_order_is_deterministic() {
        let agg = Aggregator::new(Duration::from_secs(600));
        agg.ingest(market(SourceId::Manifold, 0.61)).await;
        agg.ingest(market(SourceId::Kalshi, 0.55)).await;

        let snap = agg.snapshot().await;
        assert_eq!(snap[0].source, SourceId::Kalshi);
        assert_eq!(snap[1].source, SourceId::Manifold);
    }
}
