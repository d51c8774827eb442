use crate::metrics::ACTIVE_SENSORS;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSensor {
    pub mac: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_seen: DateTime<Utc>,
}

/// Liveness table: sensor MAC -> last time any frame arrived from it.
#[derive(Debug)]
pub struct ActiveSensors {
    seen: DashMap<String, DateTime<Utc>>,
    idle: Duration,
}

impl ActiveSensors {
    pub fn new(idle: std::time::Duration) -> Self {
        Self {
            seen: DashMap::new(),
            idle: Duration::from_std(idle).unwrap_or(Duration::seconds(10)),
        }
    }

    pub fn touch(&self, mac: &str, now: DateTime<Utc>) {
        self.seen
            .entry(mac.to_string())
            .and_modify(|last| {
                if now > *last {
                    *last = now;
                }
            })
            .or_insert(now);
    }

    /// Drops every sensor idle for longer than the threshold and returns the rest, sorted by MAC.
    pub fn evict_stale(&self, now: DateTime<Utc>) -> Vec<ActiveSensor> {
        self.seen.retain(|_, last| now - *last <= self.idle);
        ACTIVE_SENSORS.set(self.seen.len() as f64);

        let mut roster: Vec<ActiveSensor> = self
            .seen
            .iter()
            .filter(|entry| now - *entry.value() <= self.idle)
            .map(|entry| ActiveSensor {
                mac: entry.key().clone(),
                last_seen: *entry.value(),
            })
            .collect();
        roster.sort_by(|a, b| a.mac.cmp(&b.mac));
        roster
    }

    pub fn idle(&self) -> Duration {
        self.idle
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.seen.len()
    }
}
