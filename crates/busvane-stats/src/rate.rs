use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::store::{StatsStore, StoreSnapshot};

/// Decimal unit a window byte count is displayed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BandwidthUnit {
    #[serde(rename = "B/s")]
    BytesPerSec,
    #[serde(rename = "KB/s")]
    KilobytesPerSec,
    #[serde(rename = "MB/s")]
    MegabytesPerSec,
}

impl BandwidthUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            BandwidthUnit::BytesPerSec => "B/s",
            BandwidthUnit::KilobytesPerSec => "KB/s",
            BandwidthUnit::MegabytesPerSec => "MB/s",
        }
    }
}

/// Scale a window byte count into a display value. Thresholds are decimal,
/// not binary: exactly 1000 bytes already lands in the KB bracket.
pub fn scale_bandwidth(window_bytes: u64) -> (f64, BandwidthUnit) {
    if window_bytes < 1_000 {
        (window_bytes as f64, BandwidthUnit::BytesPerSec)
    } else if window_bytes < 1_000_000 {
        (window_bytes as f64 / 1_000.0, BandwidthUnit::KilobytesPerSec)
    } else {
        (window_bytes as f64 / 1_000_000.0, BandwidthUnit::MegabytesPerSec)
    }
}

/// One topic's presentation values for a single one-second window.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RateSample {
    /// Messages in the window; the window is one second, so this is Hz.
    pub hz: u64,
    pub bandwidth: f64,
    pub unit: BandwidthUnit,
    pub total_messages: u64,
}

impl RateSample {
    fn from_window(window_messages: u64, window_bytes: u64, total_messages: u64) -> Self {
        let (bandwidth, unit) = scale_bandwidth(window_bytes);
        Self {
            hz: window_messages,
            bandwidth,
            unit,
            total_messages,
        }
    }

    /// Bandwidth as shown to users, e.g. "500 B/s", "1.5 KB/s".
    pub fn display_bandwidth(&self) -> String {
        format!("{} {}", trim_decimal(self.bandwidth), self.unit.as_str())
    }
}

fn trim_decimal(value: f64) -> String {
    let text = format!("{:.2}", value);
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// All topics' samples from one tick.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RateReport {
    /// RFC 3339 timestamp of the tick; empty before the first tick.
    pub generated: String,
    pub topics: BTreeMap<String, RateSample>,
    pub orphan_messages: u64,
}

impl RateReport {
    pub fn get(&self, topic: &str) -> Option<&RateSample> {
        self.topics.get(topic)
    }
}

/// Derives per-second display rates from the store's windows. `tick` reads
/// the windows, builds a report, then resets them; `latest` hands
/// presenters the most recent report without touching any counter.
#[derive(Default)]
pub struct RateComputer {
    latest: Mutex<RateReport>,
}

impl RateComputer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&self, store: &StatsStore) -> RateReport {
        let report = build_report(&store.snapshot());
        store.reset_windows();
        if let Ok(mut latest) = self.latest.lock() {
            *latest = report.clone();
        }
        report
    }

    pub fn latest(&self) -> RateReport {
        self.latest
            .lock()
            .map(|report| report.clone())
            .unwrap_or_default()
    }
}

fn build_report(snapshot: &StoreSnapshot) -> RateReport {
    let topics = snapshot
        .topics
        .iter()
        .map(|(name, stats)| {
            (
                name.clone(),
                RateSample::from_window(
                    stats.window_messages,
                    stats.window_bytes,
                    stats.total_messages,
                ),
            )
        })
        .collect();
    RateReport {
        generated: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        topics,
        orphan_messages: snapshot.orphan_messages,
    }
}
