//! In-memory metric history, bounded by age and count per repository.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use runnergrid_state::MetricSnapshot;

#[derive(Debug)]
pub struct MetricsHistory {
    retention: Duration,
    capacity: usize,
    series: HashMap<String, VecDeque<MetricSnapshot>>,
}

impl MetricsHistory {
    pub fn new(retention: Duration, capacity: usize) -> Self {
        Self {
            retention,
            capacity: capacity.max(1),
            series: HashMap::new(),
        }
    }

    /// Append a snapshot and evict what fell out of the window.
    pub fn record(&mut self, snapshot: MetricSnapshot) {
        let now_ms = snapshot.timestamp_ms;
        let series = self.series.entry(snapshot.repository.clone()).or_default();
        series.push_back(snapshot);
        while series.len() > self.capacity {
            series.pop_front();
        }
        prune(series, now_ms, self.retention);
    }

    /// Snapshots at or after `since_ms`, oldest first, keeping the newest `limit`.
    pub fn query(&self, repository: &str, since_ms: Option<u64>, limit: Option<usize>) -> Vec<MetricSnapshot> {
        let Some(series) = self.series.get(repository) else {
            return Vec::new();
        };
        let matching: Vec<&MetricSnapshot> = series
            .iter()
            .filter(|s| since_ms.is_none_or(|since| s.timestamp_ms >= since))
            .collect();
        let skip = limit.map_or(0, |l| matching.len().saturating_sub(l));
        matching.into_iter().skip(skip).cloned().collect()
    }

    pub fn latest(&self, repository: &str) -> Option<&MetricSnapshot> {
        self.series.get(repository).and_then(|s| s.back())
    }

    /// Drop samples older than the retention window relative to `now_ms`.
    pub fn prune_all(&mut self, now_ms: u64) {
        for series in self.series.values_mut() {
            prune(series, now_ms, self.retention);
        }
        self.series.retain(|_, s| !s.is_empty());
    }

    pub fn forget(&mut self, repository: &str) {
        self.series.remove(repository);
    }

    pub fn len(&self, repository: &str) -> usize {
        self.series.get(repository).map_or(0, VecDeque::len)
    }
}

fn prune(series: &mut VecDeque<MetricSnapshot>, now_ms: u64, retention: Duration) {
    let cutoff = now_ms.saturating_sub(retention.as_millis() as u64);
    while series.front().is_some_and(|s| s.timestamp_ms < cutoff) {
        series.pop_front();
    }
}
