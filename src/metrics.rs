//! Display-only throughput numbers for a stream and for a whole session.
//!
//! Nothing in the session depends on these values for correctness.

use std::time::{Duration, Instant};

use serde::Serialize;

/// Timing and delta count of one streamed turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamMetrics {
    /// When the request was issued.
    pub started: Instant,
    /// When the first body chunk arrived.
    pub first_byte: Option<Instant>,
    /// When the stream reached a terminal state.
    pub finished: Option<Instant>,
    /// Number of non-empty deltas delivered.
    pub deltas: usize,
}

impl StreamMetrics {
    pub fn start() -> Self {
        Self::started_at(Instant::now())
    }

    pub fn started_at(started: Instant) -> Self {
        Self { started, first_byte: None, finished: None, deltas: 0 }
    }

    /// Record the first body byte. Later calls are ignored.
    pub fn mark_first_byte(&mut self, at: Instant) {
        self.first_byte.get_or_insert(at);
    }

    pub fn mark_finished(&mut self, at: Instant) {
        self.finished.get_or_insert(at);
    }

    pub fn record_delta(&mut self) {
        self.deltas += 1;
    }

    /// Time from request start to first byte, if a byte has arrived.
    pub fn time_to_first_byte(&self) -> Option<Duration> {
        self.first_byte.map(|fb| fb.saturating_duration_since(self.started))
    }

    /// Streaming time: first byte until finish (or until now while live).
    pub fn elapsed(&self) -> Duration {
        self.elapsed_at(Instant::now())
    }

    pub fn elapsed_at(&self, now: Instant) -> Duration {
        match self.first_byte {
            Some(fb) => self.finished.unwrap_or(now).saturating_duration_since(fb),
            None => Duration::ZERO,
        }
    }

    pub fn tokens_per_second(&self) -> f64 {
        self.tokens_per_second_at(Instant::now())
    }

    /// `deltas / elapsed_seconds`; zero until any time has elapsed.
    pub fn tokens_per_second_at(&self, now: Instant) -> f64 {
        let secs = self.elapsed_at(now).as_secs_f64();
        if secs > 0.0 {
            self.deltas as f64 / secs
        } else {
            0.0
        }
    }
}

/// Running totals across the completed turns of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SessionStats {
    pub requests: u64,
    pub total_tokens: u64,
    #[serde(serialize_with = "serialize_millis")]
    pub total_time: Duration,
}

impl SessionStats {
    /// Fold a finished stream into the totals.
    pub fn record(&mut self, metrics: &StreamMetrics) {
        self.requests += 1;
        self.total_tokens += metrics.deltas as u64;
        self.total_time += metrics.finished.map_or(Duration::ZERO, |f| {
            f.saturating_duration_since(metrics.started)
        });
    }

    pub fn average_tps(&self) -> f64 {
        let secs = self.total_time.as_secs_f64();
        if secs > 0.0 {
            self.total_tokens as f64 / secs
        } else {
            0.0
        }
    }
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}
