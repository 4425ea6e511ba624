//! Network throughput sampling
//!
//! Rates are derived from interface byte counters. The previous reading is
//! kept in the result cache under `("network-speed", "counters")`, so even
//! separate one-shot runs of the binary produce a rate. In watch mode the
//! engine runs a [`NetworkMonitor`] that publishes the latest sample under
//! `("network-speed", "sample")`.

use chrono::Utc;
use std::time::Duration;
use sysinfo::Networks;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::cache::{ CacheKey, ResultCache };
use super::result::Placeholders;
use crate::log_debug;

pub const NETWORK_PLUGIN: &str = "network-speed";
pub const SAMPLE_SCOPE: &str = "sample";
pub const COUNTERS_SCOPE: &str = "counters";

const COUNTERS_TTL: Duration = Duration::from_secs(3600);
/// Gap between the two readings when no previous counters exist
const FIRST_SAMPLE_GAP: Duration = Duration::from_millis(500);
const PHYSICAL_PREFIXES: &[&str] = &["eth", "wlan", "en", "wl", "rmnet"];
const ALL_INTERFACES: &str = "all";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceCounters {
    pub interface: String,
    pub received: u64,
    pub transmitted: u64,
}

/// Read byte counters for `preference`, or pick an active physical interface
/// for `"auto"`. Falls back to the sum over all interfaces.
pub fn read_counters(preference: &str) -> Option<InterfaceCounters> {
    let networks = Networks::new_with_refreshed_list();
    let list = networks.list();
    if list.is_empty() {
        return None;
    }

    let counters = |name: &str, data: &sysinfo::NetworkData| InterfaceCounters {
        interface: name.to_string(),
        received: data.total_received(),
        transmitted: data.total_transmitted(),
    };

    if preference != "auto" {
        if let Some(data) = list.get(preference) {
            return Some(counters(preference, data));
        }
    } else {
        let mut names: Vec<&String> = list.keys().collect();
        names.sort();
        let active = names.into_iter().find(|name| {
            let data = &list[*name];
            PHYSICAL_PREFIXES.iter().any(|prefix| name.starts_with(prefix)) &&
                data.total_received() + data.total_transmitted() > 0
        });
        if let Some(name) = active {
            return Some(counters(name, &list[name]));
        }
    }

    Some(InterfaceCounters {
        interface: ALL_INTERFACES.to_string(),
        received: list.values().map(|data| data.total_received()).sum(),
        transmitted: list.values().map(|data| data.total_transmitted()).sum(),
    })
}

/// Bytes per second plus traffic accumulated since the first sample
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkSample {
    pub interface: String,
    pub download_bps: f64,
    pub upload_bps: f64,
    pub session_received: u64,
    pub session_transmitted: u64,
}

impl NetworkSample {
    pub fn to_placeholders(&self) -> Placeholders {
        Placeholders::from([
            ("interface".to_string(), self.interface.clone()),
            ("download_bps".to_string(), self.download_bps.to_string()),
            ("upload_bps".to_string(), self.upload_bps.to_string()),
            ("session_received".to_string(), self.session_received.to_string()),
            ("session_transmitted".to_string(), self.session_transmitted.to_string()),
        ])
    }

    pub fn from_placeholders(values: &Placeholders) -> Option<Self> {
        Some(Self {
            interface: values.get("interface")?.clone(),
            download_bps: values.get("download_bps")?.parse().ok()?,
            upload_bps: values.get("upload_bps")?.parse().ok()?,
            session_received: values.get("session_received")?.parse().ok()?,
            session_transmitted: values.get("session_transmitted")?.parse().ok()?,
        })
    }
}

/// Previous reading as stored in the cache
struct StoredCounters {
    counters: InterfaceCounters,
    session_received: u64,
    session_transmitted: u64,
    at: chrono::DateTime<Utc>,
}

fn counters_key() -> CacheKey {
    CacheKey::new(NETWORK_PLUGIN, COUNTERS_SCOPE)
}

pub fn sample_key() -> CacheKey {
    CacheKey::new(NETWORK_PLUGIN, SAMPLE_SCOPE)
}

fn load_counters(cache: &ResultCache) -> Option<StoredCounters> {
    let entry = cache.lookup(&counters_key())?;
    let values = &entry.placeholders;
    Some(StoredCounters {
        counters: InterfaceCounters {
            interface: values.get("interface")?.clone(),
            received: values.get("received")?.parse().ok()?,
            transmitted: values.get("transmitted")?.parse().ok()?,
        },
        session_received: values.get("session_received")?.parse().ok()?,
        session_transmitted: values.get("session_transmitted")?.parse().ok()?,
        at: entry.produced_at,
    })
}

fn store_counters(cache: &ResultCache, counters: &InterfaceCounters, sample: &NetworkSample) {
    let values = Placeholders::from([
        ("interface".to_string(), counters.interface.clone()),
        ("received".to_string(), counters.received.to_string()),
        ("transmitted".to_string(), counters.transmitted.to_string()),
        ("session_received".to_string(), sample.session_received.to_string()),
        ("session_transmitted".to_string(), sample.session_transmitted.to_string()),
    ]);
    cache.insert(counters_key(), values, COUNTERS_TTL);
}

/// Rate between two readings `elapsed` apart
///
/// Counter resets, an interface switch or a zero interval yield a zero rate
/// and restart the session totals.
pub fn compute_sample(
    previous: Option<(&InterfaceCounters, u64, u64)>,
    current: &InterfaceCounters,
    elapsed: Duration
) -> NetworkSample {
    let secs = elapsed.as_secs_f64();
    let usable = previous.filter(|(prev, _, _)| {
        prev.interface == current.interface &&
            current.received >= prev.received &&
            current.transmitted >= prev.transmitted &&
            secs > 0.0
    });

    match usable {
        Some((prev, session_received, session_transmitted)) => {
            let down = current.received - prev.received;
            let up = current.transmitted - prev.transmitted;
            NetworkSample {
                interface: current.interface.clone(),
                download_bps: (down as f64) / secs,
                upload_bps: (up as f64) / secs,
                session_received: session_received.saturating_add(down),
                session_transmitted: session_transmitted.saturating_add(up),
            }
        }
        None =>
            NetworkSample {
                interface: current.interface.clone(),
                download_bps: 0.0,
                upload_bps: 0.0,
                session_received: 0,
                session_transmitted: 0,
            },
    }
}

/// Take one sample against the counters persisted in `cache`
pub async fn sample_network(cache: &ResultCache, preference: &str) -> Option<NetworkSample> {
    let previous = match load_counters(cache) {
        Some(stored) => stored,
        None => {
            let first = read_counters(preference)?;
            let at = Utc::now();
            tokio::time::sleep(FIRST_SAMPLE_GAP).await;
            StoredCounters {
                counters: first,
                session_received: 0,
                session_transmitted: 0,
                at,
            }
        }
    };

    let current = read_counters(preference)?;
    let elapsed = (Utc::now() - previous.at).to_std().unwrap_or_default();
    let sample = compute_sample(
        Some((&previous.counters, previous.session_received, previous.session_transmitted)),
        &current,
        elapsed
    );

    store_counters(cache, &current, &sample);
    Some(sample)
}

/// Engine-owned background sampler
pub struct NetworkMonitor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl NetworkMonitor {
    /// Sample every `interval` and publish with a TTL of three intervals
    pub fn start(cache: ResultCache, interval: Duration, interface: String) -> Self {
        let interval = interval.max(Duration::from_millis(500));
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Some(sample) = sample_network(&cache, &interface).await {
                            cache.insert(sample_key(), sample.to_placeholders(), interval * 3);
                        }
                    }
                }
            }

            log_debug!("Network monitor stopped");
        });

        log_debug!("Network monitor started ({:?} interval)", interval);
        Self { cancel, handle }
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}
