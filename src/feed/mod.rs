//! Producer feeds.
//!
//! One task per source drains that producer's stream independently — a stall
//! on one platform never delays another, and per-source ordering is
//! preserved because each stream has exactly one reader. Every feed runs the
//! same connection lifecycle: `Connecting → Streaming`, dropping to
//! `Degraded` with exponential backoff when the producer goes away, and
//! `Closed` only on explicit shutdown. Last-known data is left in the
//! aggregator while a feed is degraded; the staleness sweep reclaims it.

pub mod event;
pub mod transport;

use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::aggregator::Aggregator;
use crate::feed::event::{parse_line, ProducerEvent, RawMarket};
use crate::feed::transport::{ProducerConnection, ProducerTransport};
use crate::model::{FeedState, SourceHealth, SourceId};
use crate::normalize::Normalizer;

const INITIAL_BACKOFF_SECS: u64 = 1;
const MAX_BACKOFF_SECS: u64 = 30;

/// A source paired with the way to reach its producer.
pub struct FeedConfig {
    pub source: SourceId,
    pub transport: Box<dyn ProducerTransport>,
}

/// Shared per-source health counters, read by the dashboard.
#[derive(Clone)]
pub struct SourceRegistry {
    inner: Arc<RwLock<BTreeMap<SourceId, Status>>>,
}

#[derive(Debug, Clone)]
struct Status {
    state: FeedState,
    last_event_at: Option<DateTime<Utc>>,
    messages: u64,
    parse_errors: u64,
    unresolved_aliases: u64,
}

impl SourceRegistry {
    pub fn new(sources: &[SourceId]) -> Self {
        let inner = sources
            .iter()
            .map(|&source| {
                (
                    source,
                    Status {
                        state: FeedState::Connecting,
                        last_event_at: None,
                        messages: 0,
                        parse_errors: 0,
                        unresolved_aliases: 0,
                    },
                )
            })
            .collect();
        SourceRegistry {
            inner: Arc::new(RwLock::new(inner)),
        }
    }

    pub async fn set_state(&self, source: SourceId, state: FeedState) {
        if let Some(status) = self.inner.write().await.get_mut(&source) {
            status.state = state;
        }
    }

    pub async fn record_message(&self, source: SourceId) {
        if let Some(status) = self.inner.write().await.get_mut(&source) {
            status.messages += 1;
            status.last_event_at = Some(Utc::now());
        }
    }

    pub async fn record_parse_error(&self, source: SourceId) {
        if let Some(status) = self.inner.write().await.get_mut(&source) {
            status.parse_errors += 1;
        }
    }

    pub async fn record_unresolved(&self, source: SourceId, count: u64) {
        if let Some(status) = self.inner.write().await.get_mut(&source) {
            status.unresolved_aliases += count;
        }
    }

    pub async fn health(&self) -> Vec<SourceHealth> {
        self.inner
            .read()
            .await
            .iter()
            .map(|(&source, status)| SourceHealth {
                source,
                state: status.state,
                last_event_at: status.last_event_at,
                messages: status.messages,
                parse_errors: status.parse_errors,
                unresolved_aliases: status.unresolved_aliases,
            })
            .collect()
    }
}

/// Running feed tasks plus the switch that closes them.
pub struct FeedSet {
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl FeedSet {
    /// Spawn one feed task per configured source.
    pub fn spawn(
        feeds: Vec<FeedConfig>,
        normalizer: Arc<Normalizer>,
        aggregator: Aggregator,
        registry: SourceRegistry,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handles = feeds
            .into_iter()
            .map(|feed| {
                tokio::spawn(feed_loop(
                    feed.source,
                    feed.transport,
                    Arc::clone(&normalizer),
                    aggregator.clone(),
                    registry.clone(),
                    shutdown_rx.clone(),
                ))
            })
            .collect();
        FeedSet { handles, shutdown }
    }

    /// Transition every feed to `Closed`. Running producers are torn down
    /// with their connections.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Connection lifecycle for one source.
async fn feed_loop(
    source: SourceId,
    transport: Box<dyn ProducerTransport>,
    normalizer: Arc<Normalizer>,
    aggregator: Aggregator,
    registry: SourceRegistry,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff_secs = INITIAL_BACKOFF_SECS;

    loop {
        if *shutdown.borrow() {
            break;
        }
        registry.set_state(source, FeedState::Connecting).await;
        info!("[{}] attaching to {}", source, transport.describe());

        match transport.connect().await {
            Ok(mut conn) => {
                registry.set_state(source, FeedState::Streaming).await;
                backoff_secs = INITIAL_BACKOFF_SECS;
                let closed = drain(
                    source,
                    conn.as_mut(),
                    &normalizer,
                    &aggregator,
                    &registry,
                    &mut shutdown,
                )
                .await;
                if closed {
                    break;
                }
            }
            Err(e) => {
                warn!("[{}] connect failed: {:#}", source, e);
            }
        }
        if *shutdown.borrow() {
            break;
        }

        registry.set_state(source, FeedState::Degraded).await;
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
        let delay = Duration::from_secs(backoff_secs) + jitter;
        warn!("[{}] producer lost, reconnecting in {:?}", source, delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {}
        }
        backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
    }

    registry.set_state(source, FeedState::Closed).await;
    info!("[{}] feed closed", source);
}

/// Drain one connection until it ends. Returns true when shutdown was
/// requested, false when the producer went away and a reconnect is due.
async fn drain(
    source: SourceId,
    conn: &mut dyn ProducerConnection,
    normalizer: &Normalizer,
    aggregator: &Aggregator,
    registry: &SourceRegistry,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    loop {
        tokio::select! {
            line = conn.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        handle_line(source, &line, normalizer, aggregator, registry).await;
                    }
                    Ok(None) => {
                        warn!("[{}] producer stream ended", source);
                        return false;
                    }
                    Err(e) => {
                        warn!("[{}] stream error: {:#}", source, e);
                        return false;
                    }
                }
            }
            _ = shutdown.changed() => {
                return true;
            }
        }
    }
}

async fn handle_line(
    source: SourceId,
    line: &str,
    normalizer: &Normalizer,
    aggregator: &Aggregator,
    registry: &SourceRegistry,
) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    match parse_line(line) {
        ProducerEvent::Update(raw) => {
            registry.record_message(source).await;
            ingest_raw(source, &raw, normalizer, aggregator, registry).await;
        }
        ProducerEvent::Batch(markets) => {
            registry.record_message(source).await;
            debug!("[{}] unpacking batch of {} markets", source, markets.len());
            for raw in &markets {
                ingest_raw(source, raw, normalizer, aggregator, registry).await;
            }
        }
        ProducerEvent::Status(message) => {
            registry.record_message(source).await;
            info!("[{}] producer status: {}", source, message);
        }
        ProducerEvent::Error(message) => {
            registry.record_message(source).await;
            warn!("[{}] producer reported error: {}", source, message);
        }
        ProducerEvent::Raw(line) => {
            debug!("[{}] ignoring unparseable producer line: {}", source, line);
        }
    }
}

/// A bad record costs itself, never the stream.
async fn ingest_raw(
    source: SourceId,
    raw: &RawMarket,
    normalizer: &Normalizer,
    aggregator: &Aggregator,
    registry: &SourceRegistry,
) {
    match normalizer.normalize(source, raw, Utc::now()) {
        Ok(Some(update)) => {
            if !update.unresolved.is_empty() {
                registry
                    .record_unresolved(source, update.unresolved.len() as u64)
                    .await;
                warn!(
                    "[{}] unresolved team alias(es) {:?}, keeping raw names for {}",
                    source, update.unresolved, update.market.match_key
                );
            }
            aggregator.ingest(update.market).await;
        }
        Ok(None) => {
            debug!("[{}] filtered non-moneyline or closed market", source);
        }
        Err(e) => {
            registry.record_parse_error(source).await;
            warn!("[{}] skipping malformed record: {}", source, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::transport::CommandTransport;
    use crate::teams::TeamAliases;

    fn fixtures() -> (Arc<Normalizer>, Aggregator, SourceRegistry) {
        (
            Arc::new(Normalizer::new(Arc::new(TeamAliases::premier_league()))),
            Aggregator::new(Duration::from_secs(600)),
            SourceRegistry::new(&[SourceId::Model]),
        )
    }

    async fn state_of(registry: &SourceRegistry, source: SourceId) -> FeedState {
        registry
            .health()
            .await
            .into_iter()
            .find(|h| h.source == source)
            .map(|h| h.state)
            .unwrap()
    }

    #[tokio::test]
    async fn test_registry_counters() {
        let registry = SourceRegistry::new(&[SourceId::Model, SourceId::Kalshi]);
        registry.record_message(SourceId::Model).await;
        registry.record_message(SourceId::Model).await;
        registry.record_parse_error(SourceId::Kalshi).await;
        registry.record_unresolved(SourceId::Model, 2).await;

        let health = registry.health().await;
        assert_eq!(health.len(), 2);
        let model = health.iter().find(|h| h.source == SourceId::Model).unwrap();
        assert_eq!(model.messages, 2);
        assert_eq!(model.unresolved_aliases, 2);
        assert!(model.last_event_at.is_some());
        let kalshi = health.iter().find(|h| h.source == SourceId::Kalshi).unwrap();
        assert_eq!(kalshi.parse_errors, 1);
        assert!(kalshi.last_event_at.is_none());
    }

    #[tokio::test]
    async fn test_handle_line_mixes_data_and_noise() {
        let (normalizer, aggregator, registry) = fixtures();
        let lines = [
            r#"{"type":"status","message":"collector started","timestamp":1}"#,
            r#"{"type":"market_update","data":{"team1":"ARS","team2":"CHE","date":"2024-03-01","probability":0.55}}"#,
            "complete garbage",
            // Malformed record: no teams anywhere. Must not poison the rest.
            r#"{"type":"market_update","data":{"probability":0.5,"date":"2024-03-01"}}"#,
            r#"{"type":"market_update","data":{"team1":"LEE","team2":"FUL","date":"2024-03-02","probability":0.44}}"#,
        ];
        for line in lines {
            handle_line(SourceId::Model, line, &normalizer, &aggregator, &registry).await;
        }

        assert_eq!(aggregator.len().await, 2);
        let health = state_health(&registry).await;
        assert_eq!(health.messages, 4); // status + three updates; raw not counted
        assert_eq!(health.parse_errors, 1);
    }

    async fn state_health(registry: &SourceRegistry) -> SourceHealth {
        registry
            .health()
            .await
            .into_iter()
            .find(|h| h.source == SourceId::Model)
            .unwrap()
    }

    #[tokio::test]
    async fn test_subprocess_feed_end_to_end() {
        let (normalizer, aggregator, registry) = fixtures();

        let line = r#"{"type":"market_update","data":{"team1":"ARS","team2":"CHE","date":"2024-03-01","probability":0.55}}"#;
        let script = format!("echo '{}'", line);
        let feeds = vec![FeedConfig {
            source: SourceId::Model,
            transport: Box::new(CommandTransport::new("sh", vec!["-c".into(), script])),
        }];

        let set = FeedSet::spawn(
            feeds,
            Arc::clone(&normalizer),
            aggregator.clone(),
            registry.clone(),
        );

        // Wait for the update to flow through.
        for _ in 0..40 {
            if aggregator.len().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(aggregator.len().await, 1);

        set.shutdown();
        set.join().await;
        assert_eq!(state_of(&registry, SourceId::Model).await, FeedState::Closed);
    }
}
