use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::transport::LinkState;

/// Observational view of the link. Never consulted before sending.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityHealth {
    pub score: f64,
    pub link: LinkState,
    pub consecutive_failures: u32,
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl ConnectivityHealth {
    pub fn evaluate(
        link: LinkState,
        consecutive_failures: u32,
        last_sync_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Self {
        Self {
            score: score(link, consecutive_failures, last_sync_at, now, stale_after),
            link,
            consecutive_failures,
            last_sync_at,
        }
    }
}

/// Starts from 1.0 and subtracts a penalty per missing capability, for
/// recent failures (capped) and for a stale or missing last sync.
pub fn score(
    link: LinkState,
    consecutive_failures: u32,
    last_sync_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    stale_after: Duration,
) -> f64 {
    let mut score = 1.0;

    if !link.activated {
        score -= 0.5;
    }
    if !link.reachable {
        score -= 0.3;
    }
    if !link.paired {
        score -= 0.7;
    }
    if !link.counterpart_installed {
        score -= 0.6;
    }

    score -= (f64::from(consecutive_failures) * 0.1).min(0.5);

    let stale = match last_sync_at {
        Some(at) => (now - at)
            .to_std()
            .map(|age| age > stale_after)
            .unwrap_or(false),
        None => true,
    };
    if stale {
        score -= 0.2;
    }

    f64::clamp(score, 0.0, 1.0)
}
