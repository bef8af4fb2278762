//! Admin JSON API (spec §6): `GET /status`, `/countries`, `/proxies`,
//! `/waiting`, `/history`, and `POST /action`. The HTML shell at
//! `/superproxy/` is out of scope (spec §1); these are the JSON endpoints
//! that back it.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Redirect};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::checker::Checker;
use crate::error::{Result, SuperproxyError};
use crate::fetcher::Fetcher;
use crate::model::Proxy;
use crate::pool::ProxyPool;

#[derive(Clone)]
pub struct AdminState {
    pub pool: Arc<ProxyPool>,
    pub fetcher: Option<Arc<Fetcher>>,
    pub checker: Option<Arc<Checker>>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/", get(|| async { Redirect::permanent("/superproxy/") }))
        .route("/superproxy", get(|| async { Redirect::permanent("/superproxy/") }))
        .route("/status", get(status))
        .route("/countries", get(countries))
        .route("/proxies", get(proxies))
        .route("/waiting", get(waiting))
        .route("/history", get(history))
        .route("/action", post(action))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

const ACTIONS: &[&str] = &[
    "fetch",
    "forget_blacklist",
    "blacklist",
    "unblacklist",
    "reset_rest_till",
    "recheck",
    "clear_pool_manager",
];

async fn status(State(state): State<AdminState>) -> impl IntoResponse {
    let counters = state.pool.status_counters();
    Json(json!({
        "active": counters.active,
        "resting": counters.resting,
        "blacklisted": counters.blacklisted,
        "in_use": counters.in_use,
        "waiting": counters.waiting,
        "need_update": counters.need_update,
        "checker": state.checker.is_some(),
        "fetcher": state.fetcher.is_some(),
        "fetcher_ready": state.fetcher.as_ref().map(|f| f.ready()),
        "started_at": counters.started_at,
        "updated_at": counters.updated_at,
        "fetcher_started_at": state.fetcher.as_ref().and_then(|f| f.started_at()),
        "actions": ACTIONS,
    }))
}

async fn countries(State(state): State<AdminState>) -> impl IntoResponse {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for proxy in state.pool.list_active() {
        if let Some(country) = proxy.country {
            *counts.entry(country).or_insert(0) += 1;
        }
    }
    Json(counts)
}

#[derive(Debug, Deserialize)]
struct ProxiesQuery {
    status: Option<String>,
    search: Option<String>,
    sort: Option<String>,
    page: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusFilter {
    Active,
    Resting,
    Blacklisted,
}

fn parse_status_filter(raw: &str) -> Vec<StatusFilter> {
    raw.split(',')
        .filter_map(|s| match s.trim().to_lowercase().as_str() {
            "active" => Some(StatusFilter::Active),
            "resting" | "rest" => Some(StatusFilter::Resting),
            "blacklist" | "blacklisted" => Some(StatusFilter::Blacklisted),
            _ => None,
        })
        .collect()
}

fn matches_search(proxy: &Proxy, needle: &str) -> bool {
    let needle = needle.to_lowercase();
    proxy.addr.to_lowercase().contains(&needle)
        || proxy
            .country
            .as_deref()
            .map(|c| c.to_lowercase().contains(&needle))
            .unwrap_or(false)
        || proxy.fetch_sources.iter().any(|s| s.to_lowercase().contains(&needle))
        || proxy.types.iter().any(|t| format!("{t:?}").to_lowercase().contains(&needle))
}

#[derive(Debug, Serialize)]
struct Page<T> {
    items: Vec<T>,
    page: usize,
    per_page: usize,
    total: usize,
}

fn paginate<T>(mut items: Vec<T>, page: usize, per_page: usize) -> Page<T> {
    let total = items.len();
    let page = page.max(1);
    let per_page = per_page.clamp(1, 500);
    let start = (page - 1).saturating_mul(per_page).min(total);
    let end = start.saturating_add(per_page).min(total);
    items = items.split_off(start);
    items.truncate(end - start);
    Page {
        items,
        page,
        per_page,
        total,
    }
}

async fn proxies(State(state): State<AdminState>, Query(q): Query<ProxiesQuery>) -> impl IntoResponse {
    let now = Utc::now();
    let statuses = q
        .status
        .as_deref()
        .map(parse_status_filter)
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| vec![StatusFilter::Active, StatusFilter::Resting, StatusFilter::Blacklisted]);

    let mut all: Vec<Proxy> = Vec::new();
    if statuses.contains(&StatusFilter::Active) || statuses.contains(&StatusFilter::Resting) {
        for p in state.pool.list_active() {
            let is_resting = p.is_resting(now);
            let wants_active = statuses.contains(&StatusFilter::Active) && !is_resting;
            let wants_resting = statuses.contains(&StatusFilter::Resting) && is_resting;
            if wants_active || wants_resting {
                all.push(p);
            }
        }
    }
    if statuses.contains(&StatusFilter::Blacklisted) {
        all.extend(state.pool.list_blacklisted());
    }

    if let Some(search) = q.search.as_deref().filter(|s| !s.is_empty()) {
        all.retain(|p| matches_search(p, search));
    }

    match q.sort.as_deref() {
        Some("speed") => all.sort_by(|a, b| a.speed.partial_cmp(&b.speed).unwrap_or(std::cmp::Ordering::Equal)),
        Some("-speed") => all.sort_by(|a, b| b.speed.partial_cmp(&a.speed).unwrap_or(std::cmp::Ordering::Equal)),
        Some("used_at") => all.sort_by(|a, b| a.used_at().cmp(&b.used_at())),
        Some("-used_at") => all.sort_by(|a, b| b.used_at().cmp(&a.used_at())),
        _ => {}
    }

    Json(paginate(all, q.page.unwrap_or(1), q.per_page.unwrap_or(50)))
}

async fn waiting(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.pool.list_waiting())
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    result: Option<String>,
    search: Option<String>,
    page: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Debug, Serialize, Clone)]
struct HistoryRow {
    addr: String,
    time: DateTime<Utc>,
    kind: crate::model::HistoryKind,
    reason: Option<String>,
    request_ident: Option<String>,
}

async fn history(State(state): State<AdminState>, Query(q): Query<HistoryQuery>) -> impl IntoResponse {
    let wanted_kinds: Option<Vec<String>> = q
        .result
        .as_deref()
        .map(|s| s.split(',').map(|k| k.trim().to_uppercase()).collect());

    let mut rows: Vec<HistoryRow> = Vec::new();
    for proxy in state.pool.list_active().into_iter().chain(state.pool.list_blacklisted()) {
        for entry in &proxy.history {
            if let Some(kinds) = &wanted_kinds {
                let kind_name = format!("{:?}", entry.kind).to_uppercase();
                if !kinds.iter().any(|k| k == &kind_name) {
                    continue;
                }
            }
            rows.push(HistoryRow {
                addr: proxy.addr.clone(),
                time: entry.time,
                kind: entry.kind,
                reason: entry.reason.clone(),
                request_ident: entry.request_ident.clone(),
            });
        }
    }

    if let Some(search) = q.search.as_deref().filter(|s| !s.is_empty()) {
        let needle = search.to_lowercase();
        rows.retain(|r| {
            r.addr.to_lowercase().contains(&needle)
                || r.reason.as_deref().unwrap_or("").to_lowercase().contains(&needle)
        });
    }

    rows.sort_by(|a, b| b.time.cmp(&a.time));
    Json(paginate(rows, q.page.unwrap_or(1), q.per_page.unwrap_or(50)))
}

#[derive(Debug, Deserialize)]
struct ActionRequest {
    action: String,
    addr: Option<String>,
    status: Option<String>,
    used_at_before: Option<String>,
}

/// Parses simple English duration phrases used by `forget_blacklist`
/// (spec §6 example: `"1 day"`), grounded on the same coarse grammar the
/// Python CLI's `-o`/duration flags use: `<number> <unit>`.
fn parse_duration_phrase(phrase: &str) -> Option<Duration> {
    let mut parts = phrase.split_whitespace();
    let amount: i64 = parts.next()?.parse().ok()?;
    let unit = parts.next()?.to_lowercase();
    let unit = unit.trim_end_matches('s');
    match unit {
        "second" | "sec" => Some(Duration::seconds(amount)),
        "minute" | "min" => Some(Duration::minutes(amount)),
        "hour" | "hr" => Some(Duration::hours(amount)),
        "day" => Some(Duration::days(amount)),
        "week" => Some(Duration::weeks(amount)),
        _ => None,
    }
}

async fn action(State(state): State<AdminState>, Json(req): Json<ActionRequest>) -> Result<impl IntoResponse> {
    match req.action.as_str() {
        "fetch" => {
            if let Some(fetcher) = &state.fetcher {
                let fetcher = Arc::clone(fetcher);
                tokio::spawn(async move {
                    fetcher.run(false).await;
                });
            }
        }
        "forget_blacklist" => {
            let phrase = req
                .used_at_before
                .ok_or_else(|| SuperproxyError::InvalidRequest("used_at_before is required".into()))?;
            let delta = parse_duration_phrase(&phrase)
                .ok_or_else(|| SuperproxyError::InvalidRequest(format!("unparseable duration: {phrase}")))?;
            state.pool.forget_blacklist(Utc::now() - delta);
        }
        "blacklist" => {
            for addr in target_addrs(&state, &req) {
                state.pool.blacklist(&addr, false);
            }
        }
        "unblacklist" => {
            for addr in target_addrs(&state, &req) {
                state.pool.unblacklist(&addr);
            }
        }
        "reset_rest_till" => {
            for addr in target_addrs(&state, &req) {
                state.pool.reset_rest_till(&addr);
            }
        }
        "recheck" => {
            if let Some(checker) = &state.checker {
                for addr in target_addrs(&state, &req) {
                    if let Some(proxy) = state.pool.get_by_addr(&addr) {
                        let checker = Arc::clone(checker);
                        tokio::spawn(async move {
                            checker.check(proxy).await;
                        });
                    }
                }
            }
        }
        "clear_pool_manager" => {
            for addr in target_addrs(&state, &req) {
                if let Some(proxy) = state.pool.get_by_addr(&addr) {
                    state.pool.clear_pool_manager(&proxy.url());
                }
            }
        }
        other => return Err(SuperproxyError::InvalidRequest(format!("unknown action: {other}"))),
    }

    Ok(Json(json!({"status": "ok"})))
}

/// Resolves an action's target set: an explicit `addr`, or every proxy
/// matching a `status` selector (spec §6's `POST /action`).
fn target_addrs(state: &AdminState, req: &ActionRequest) -> Vec<String> {
    if let Some(addr) = &req.addr {
        return vec![addr.clone()];
    }
    let Some(status) = &req.status else {
        return Vec::new();
    };
    let now = Utc::now();
    let statuses = parse_status_filter(status);
    let mut out = Vec::new();
    if statuses.contains(&StatusFilter::Active) || statuses.contains(&StatusFilter::Resting) {
        for p in state.pool.list_active() {
            let is_resting = p.is_resting(now);
            if (statuses.contains(&StatusFilter::Active) && !is_resting)
                || (statuses.contains(&StatusFilter::Resting) && is_resting)
            {
                out.push(p.addr);
            }
        }
    }
    if statuses.contains(&StatusFilter::Blacklisted) {
        out.extend(state.pool.list_blacklisted().into_iter().map(|p| p.addr));
    }
    out
}
