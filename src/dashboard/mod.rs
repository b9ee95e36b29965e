use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use futures_util::stream::{self, Stream, StreamExt};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;

use crate::aggregator::{Aggregator, MarketChange};
use crate::compare::{compare, compare_one};
use crate::feed::SourceRegistry;

#[derive(Clone)]
pub struct AppState {
    pub aggregator: Aggregator,
    pub registry: SourceRegistry,
}

/// Build the Axum router for the dashboard.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/comparisons", get(comparisons_handler))
        .route("/api/markets", get(markets_handler))
        .route("/api/sources", get(sources_handler))
        .route("/api/stream", get(stream_handler))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// Serve the embedded dashboard page.
async fn index_handler() -> impl IntoResponse {
    Html(DASHBOARD_HTML)
}

/// GET /api/comparisons — per-fixture cross-source comparison (pull).
async fn comparisons_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.aggregator.snapshot().await;
    Json(compare(&snapshot))
}

/// GET /api/markets — the raw aggregator snapshot.
async fn markets_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.aggregator.snapshot().await)
}

/// GET /api/sources — per-source feed health.
async fn sources_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.registry.health().await)
}

/// GET /api/stream — comparison push channel as server-sent events.
///
/// A full `comparisons` list is sent on connect, then one `comparison`
/// (or `removed`) event per aggregator change. Dropping the connection just
/// drops a broadcast receiver; feeds and aggregator state are untouched.
async fn stream_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.aggregator.subscribe();
    let aggregator = state.aggregator.clone();

    let initial = sse_json("comparisons", &compare(&aggregator.snapshot().await));

    let updates = stream::unfold((rx, aggregator), |(mut rx, aggregator)| async move {
        loop {
            match rx.recv().await {
                Ok(MarketChange::Updated(market)) => {
                    let snapshot = aggregator.snapshot().await;
                    if let Some(record) = compare_one(&snapshot, &market.match_key) {
                        return Some((sse_json("comparison", &record), (rx, aggregator)));
                    }
                    // Evicted between notification and snapshot; the
                    // eviction event will carry the removal.
                }
                Ok(MarketChange::Evicted { match_key, .. }) => {
                    let snapshot = aggregator.snapshot().await;
                    let event = match compare_one(&snapshot, &match_key) {
                        // Remaining sources still carry the fixture.
                        Some(record) => sse_json("comparison", &record),
                        None => sse_json("removed", &match_key),
                    };
                    return Some((event, (rx, aggregator)));
                }
                Err(RecvError::Lagged(skipped)) => {
                    // Fell behind the broadcast; resync with a full list.
                    tracing::debug!("sse subscriber lagged {} changes, resyncing", skipped);
                    let records = compare(&aggregator.snapshot().await);
                    return Some((sse_json("comparisons", &records), (rx, aggregator)));
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    let stream = stream::once(async move { initial })
        .chain(updates)
        .map(Ok::<_, Infallible>);
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn sse_json(event: &str, payload: &impl Serialize) -> Event {
    match serde_json::to_string(payload) {
        Ok(body) => Event::default().event(event).data(body),
        Err(e) => Event::default().event("error").data(e.to_string()),
    }
}

/// Embedded single-file dashboard (HTML + CSS + JS)
const DASHBOARD_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>EPL Edge Dashboard</title>
<style>
  :root {
    --bg: #0f1117;
    --card: #1a1d27;
    --border: #2a2d3a;
    --accent: #6c63ff;
    --green: #00c896;
    --red: #ff4f6a;
    --amber: #ff9800;
    --text: #e0e0e0;
    --muted: #8888aa;
  }
  * { box-sizing: border-box; margin: 0; padding: 0; }
  body { background: var(--bg); color: var(--text); font-family: 'Segoe UI', system-ui, sans-serif; }
  header { display: flex; align-items: center; gap: 1rem; padding: 1rem 2rem; border-bottom: 1px solid var(--border); }
  header h1 { font-size: 1.4rem; font-weight: 700; }
  .status-dot { width: 10px; height: 10px; border-radius: 50%; background: var(--green); display: inline-block; animation: pulse 1.5s infinite; }
  @keyframes pulse { 0%,100% { opacity: 1; } 50% { opacity: .3; } }
  main { padding: 1.5rem 2rem; display: grid; gap: 1.5rem; }
  .sources { display: flex; gap: .8rem; flex-wrap: wrap; }
  .source-card { background: var(--card); border: 1px solid var(--border); border-radius: 10px; padding: .8rem 1.2rem; min-width: 180px; }
  .source-card .name { font-weight: 700; text-transform: capitalize; margin-bottom: .3rem; }
  .badge { padding: .15rem .55rem; border-radius: 4px; font-size: .72rem; font-weight: 700; text-transform: uppercase; }
  .badge.streaming { background: var(--green); color: #000; }
  .badge.connecting { background: var(--accent); color: #fff; }
  .badge.degraded { background: var(--amber); color: #000; }
  .badge.closed { background: var(--red); color: #000; }
  .source-card .meta { color: var(--muted); font-size: .75rem; margin-top: .4rem; }
  .panel { background: var(--card); border: 1px solid var(--border); border-radius: 10px; overflow: hidden; }
  .panel-header { padding: .9rem 1.2rem; border-bottom: 1px solid var(--border); font-weight: 600; }
  table { width: 100%; border-collapse: collapse; }
  th { padding: .7rem 1rem; text-align: left; font-size: .75rem; text-transform: uppercase; color: var(--muted); border-bottom: 1px solid var(--border); }
  td { padding: .65rem 1rem; font-size: .88rem; border-bottom: 1px solid #1e2130; }
  tr:last-child td { border-bottom: none; }
  .edge { font-weight: 700; }
  .edge.high { color: var(--red); }
  .edge.low { color: var(--muted); }
  .missing { color: var(--muted); }
  .empty { color: var(--muted); text-align: center; padding: 2rem; font-size: .9rem; }
</style>
</head>
<body>
<header>
  <span class="status-dot" id="dot"></span>
  <h1>⚽ EPL Edge</h1>
  <span style="margin-left:auto;color:var(--muted);font-size:.8rem;" id="last-updated"></span>
</header>

<main>
  <div class="sources" id="sources"></div>

  <div class="panel">
    <div class="panel-header">Fixture Comparison</div>
    <table>
      <thead><tr><th>Fixture</th><th>Date</th><th>Model</th><th>Kalshi</th><th>Manifold</th><th>Max Edge</th></tr></thead>
      <tbody id="comparisons-tbody"><tr><td colspan="6" class="empty">Waiting for market data…</td></tr></tbody>
    </table>
  </div>
</main>

<script>
const pct = v => v != null ? (v*100).toFixed(1)+'%' : null;
const EDGE_FLAG = 0.05;
const records = new Map();

function renderComparisons() {
  const tbody = document.getElementById('comparisons-tbody');
  const rows = Array.from(records.values()).sort((a, b) => a.match_key < b.match_key ? -1 : 1);
  if (!rows.length) {
    tbody.innerHTML = '<tr><td colspan="6" class="empty">Waiting for market data…</td></tr>';
    return;
  }
  tbody.innerHTML = rows.map(r => {
    const cell = src => {
      const p = pct(r.probabilities[src]);
      return p == null ? '<span class="missing">–</span>' : p;
    };
    const edgeClass = r.max_discrepancy >= EDGE_FLAG ? 'high' : 'low';
    return `<tr>
      <td>${r.team1} vs ${r.team2}</td>
      <td>${r.event_date}</td>
      <td>${cell('model')}</td>
      <td>${cell('kalshi')}</td>
      <td>${cell('manifold')}</td>
      <td class="edge ${edgeClass}">${pct(r.max_discrepancy)}</td>
    </tr>`;
  }).join('');
  document.getElementById('last-updated').textContent = 'Updated ' + new Date().toLocaleTimeString();
}

async function loadSources() {
  const r = await fetch('/api/sources');
  if (!r.ok) return;
  const sources = await r.json();
  document.getElementById('sources').innerHTML = sources.map(s => `
    <div class="source-card">
      <div class="name">${s.source} <span class="badge ${s.state}">${s.state}</span></div>
      <div class="meta">${s.messages} msgs · ${s.parse_errors} parse errors · ${s.unresolved_aliases} unresolved</div>
    </div>`).join('');
}

function connectStream() {
  const es = new EventSource('/api/stream');
  es.addEventListener('comparisons', e => {
    records.clear();
    for (const rec of JSON.parse(e.data)) records.set(rec.match_key, rec);
    renderComparisons();
  });
  es.addEventListener('comparison', e => {
    const rec = JSON.parse(e.data);
    records.set(rec.match_key, rec);
    renderComparisons();
  });
  es.addEventListener('removed', e => {
    records.delete(JSON.parse(e.data));
    renderComparisons();
  });
  es.onerror = () => {
    // EventSource reconnects on its own; keep the page alive meanwhile.
    document.getElementById('dot').style.background = 'var(--amber)';
  };
  es.onopen = () => {
    document.getElementById('dot').style.background = 'var(--green)';
  };
}

connectStream();
loadSources();
setInterval(loadSources, 5000);
</script>
</body>
</html>"#;
