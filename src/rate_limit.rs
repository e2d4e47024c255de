use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, warn};

use crate::error::ApiError;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    hits: u32,
    reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_after_seconds: u64,
}

const MIN_PRUNE_PERIOD: std::time::Duration = std::time::Duration::from_secs(1);
const MAX_PRUNE_PERIOD: std::time::Duration = std::time::Duration::from_secs(60 * 60);

/// Fixed-window request counter keyed by client identity.
pub struct RateLimiter {
    max_requests: u32,
    window: chrono::Duration,
    trust_proxy_headers: bool,
    clock: Arc<dyn Clock>,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(
        max_requests: u32,
        window: chrono::Duration,
        trust_proxy_headers: bool,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            max_requests,
            window,
            trust_proxy_headers,
            clock,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub async fn hit(&self, client: &str) -> Decision {
        let now = self.clock.now();
        let mut windows = self.windows.lock().await;
        let window = windows
            .entry(client.to_string())
            .and_modify(|window| {
                if window.reset_at <= now {
                    *window = Window {
                        hits: 0,
                        reset_at: self.window_end(now),
                    };
                }
            })
            .or_insert_with(|| Window {
                hits: 0,
                reset_at: self.window_end(now),
            });

        window.hits = window.hits.saturating_add(1);

        Decision {
            allowed: window.hits <= self.max_requests,
            limit: self.max_requests,
            remaining: self.max_requests.saturating_sub(window.hits),
            reset_after_seconds: seconds_until(now, window.reset_at),
        }
    }

    fn window_end(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        start
            .checked_add_signed(self.window)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Drops windows that have already expired.
    pub async fn prune(&self) {
        let now = self.clock.now();
        let mut windows = self.windows.lock().await;
        let before = windows.len();
        windows.retain(|_, window| window.reset_at > now);
        let pruned = before - windows.len();
        if pruned > 0 {
            debug!("Pruned {pruned} expired rate-limit window(s)");
        }
    }

    pub fn spawn_pruner(self: &Arc<Self>) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        let period = limiter
            .window
            .to_std()
            .unwrap_or(MIN_PRUNE_PERIOD)
            .clamp(MIN_PRUNE_PERIOD, MAX_PRUNE_PERIOD);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                limiter.prune().await;
            }
        })
    }

    fn policy_header(&self) -> String {
        format!("{};w={}", self.max_requests, self.window.num_seconds())
    }

    fn client_identity(&self, request: &Request) -> String {
        let socket_ip = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());

        let forwarded = if self.trust_proxy_headers {
            extract_client_ip(request.headers())
        } else {
            None
        };

        forwarded
            .or(socket_ip)
            .unwrap_or_else(|| "unknown".to_string())
    }
}

fn seconds_until(now: DateTime<Utc>, reset_at: DateTime<Utc>) -> u64 {
    let millis = (reset_at - now).num_milliseconds().max(0) as u64;
    millis.div_ceil(1000)
}

fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let check_header = |key: &str| {
        headers
            .get(key)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
    };

    if let Some(forwarded) = check_header("x-forwarded-for") {
        let first_ip = forwarded
            .split(',')
            .next()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string);

        if first_ip.is_some() {
            return first_ip;
        }
    }

    check_header("cf-connecting-ip").or_else(|| check_header("x-real-ip"))
}

pub async fn enforce(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let client = limiter.client_identity(&request);
    let decision = limiter.hit(&client).await;

    let mut response = if decision.allowed {
        next.run(request).await
    } else {
        warn!("Rate limit exceeded for {client}");
        ApiError::too_many_requests(decision.reset_after_seconds).into_response()
    };

    let headers = response.headers_mut();
    for (name, value) in [
        ("ratelimit-policy", limiter.policy_header()),
        ("ratelimit-limit", decision.limit.to_string()),
        ("ratelimit-remaining", decision.remaining.to_string()),
        ("ratelimit-reset", decision.reset_after_seconds.to_string()),
    ] {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }

    response
}
