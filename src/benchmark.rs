use std::path::Path;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use crate::error::{Result, StudioError};
use crate::session::{ChatOptions, SessionConfig, StreamEvent, StreamingChatSession};

#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkRun {
    pub run_index: u32,
    pub success: bool,
    #[serde(serialize_with = "serialize_millis")]
    pub latency: Duration,
    #[serde(serialize_with = "serialize_opt_millis")]
    pub time_to_first_byte: Option<Duration>,
    pub deltas: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkAggregate {
    pub total_runs: u32,
    pub successful: u32,
    /// Percentage of failed runs, 0..=100.
    pub error_rate: f64,
    pub mean_latency_ms: f64,
    pub mean_ttfb_ms: Option<f64>,
    pub total_deltas: usize,
    /// Deltas per second over the summed latency of successful runs.
    pub tokens_per_second: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkReport {
    pub schema_version: u8,
    pub base_url: String,
    pub prompt: String,
    pub runs: Vec<BenchmarkRun>,
    pub aggregate: BenchmarkAggregate,
}

impl BenchmarkReport {
    /// Human-readable summary for the terminal.
    pub fn render(&self) -> String {
        let a = &self.aggregate;
        let mut out = String::new();
        out.push_str(&format!("Benchmark against {}\n", self.base_url));
        out.push_str(&format!("  runs:          {}\n", a.total_runs));
        out.push_str(&format!("  successful:    {}\n", a.successful));
        out.push_str(&format!("  error rate:    {:.1}%\n", a.error_rate));
        out.push_str(&format!("  mean latency:  {:.0} ms\n", a.mean_latency_ms));
        if let Some(ttfb) = a.mean_ttfb_ms {
            out.push_str(&format!("  mean TTFB:     {ttfb:.0} ms\n"));
        }
        out.push_str(&format!("  tokens:        {}\n", a.total_deltas));
        out.push_str(&format!("  tokens/sec:    {:.2}\n", a.tokens_per_second));
        out
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, &json)
            .map_err(|source| StudioError::Io { path: path.to_path_buf(), source })?;
        info!(bytes = json.len(), path = %path.display(), "benchmark report written");
        Ok(())
    }
}

/// Send `prompt` `iterations` times, each on a fresh session, and collect timings.
pub async fn run_benchmark(
    config: &SessionConfig,
    options: &ChatOptions,
    prompt: &str,
    iterations: u32,
) -> BenchmarkReport {
    info!(iterations, url = %config.base_url, "starting benchmark");
    let mut runs = Vec::with_capacity(iterations as usize);

    for i in 0..iterations {
        let run = run_once(i, config, options, prompt).await;
        if let Some(err) = &run.error {
            warn!(run = i + 1, error = %err, "benchmark run failed");
        } else {
            info!(run = i + 1, latency_ms = run.latency.as_millis() as u64, deltas = run.deltas, "benchmark run");
        }
        runs.push(run);
    }

    let aggregate = build_aggregate(iterations, &runs);
    BenchmarkReport {
        schema_version: 1,
        base_url: config.base_url.clone(),
        prompt: prompt.to_string(),
        runs,
        aggregate,
    }
}

async fn run_once(
    run_index: u32,
    config: &SessionConfig,
    options: &ChatOptions,
    prompt: &str,
) -> BenchmarkRun {
    let session = StreamingChatSession::new(config.clone());
    let started = Instant::now();
    let mut run = BenchmarkRun {
        run_index,
        success: false,
        latency: Duration::ZERO,
        time_to_first_byte: None,
        deltas: 0,
        error: None,
    };

    let Some(mut stream) = session.send(prompt, options) else {
        run.error = Some("empty prompt".into());
        return run;
    };

    while let Some(event) = stream.next().await {
        match event {
            StreamEvent::Delta { .. } => {}
            StreamEvent::Final { metrics, .. } => {
                run.success = true;
                run.deltas = metrics.deltas;
                run.time_to_first_byte = metrics.time_to_first_byte();
            }
            StreamEvent::Cancelled { .. } => run.error = Some("cancelled".into()),
            StreamEvent::Error { error, .. } => run.error = Some(error.to_string()),
        }
    }
    run.latency = started.elapsed();
    run
}

fn build_aggregate(total_runs: u32, runs: &[BenchmarkRun]) -> BenchmarkAggregate {
    let ok: Vec<&BenchmarkRun> = runs.iter().filter(|r| r.success).collect();
    let successful = ok.len() as u32;

    let error_rate = if total_runs == 0 {
        0.0
    } else {
        (total_runs - successful) as f64 / total_runs as f64 * 100.0
    };

    if ok.is_empty() {
        return BenchmarkAggregate {
            total_runs,
            successful,
            error_rate,
            mean_latency_ms: 0.0,
            mean_ttfb_ms: None,
            total_deltas: 0,
            tokens_per_second: 0.0,
        };
    }

    let total_latency: Duration = ok.iter().map(|r| r.latency).sum();
    let mean_latency_ms = total_latency.as_secs_f64() * 1000.0 / ok.len() as f64;

    let ttfbs: Vec<f64> = ok
        .iter()
        .filter_map(|r| r.time_to_first_byte.map(|d| d.as_secs_f64() * 1000.0))
        .collect();
    let mean_ttfb_ms = if ttfbs.is_empty() {
        None
    } else {
        Some(ttfbs.iter().sum::<f64>() / ttfbs.len() as f64)
    };

    let total_deltas: usize = ok.iter().map(|r| r.deltas).sum();
    let secs = total_latency.as_secs_f64();
    let tokens_per_second = if secs > 0.0 { total_deltas as f64 / secs } else { 0.0 };

    BenchmarkAggregate {
        total_runs,
        successful,
        error_rate,
        mean_latency_ms,
        mean_ttfb_ms,
        total_deltas,
        tokens_per_second,
    }
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

fn serialize_opt_millis<S: serde::Serializer>(
    d: &Option<Duration>,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_some(&(d.as_millis() as u64)),
        None => s.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(i: u32, success: bool, latency_ms: u64, deltas: usize) -> BenchmarkRun {
        BenchmarkRun {
            run_index: i,
            success,
            latency: Duration::from_millis(latency_ms),
            time_to_first_byte: success.then(|| Duration::from_millis(100)),
            deltas,
            error: (!success).then(|| "boom".to_string()),
        }
    }

    #[test]
    fn test_aggregate_empty() {
        let a = build_aggregate(0, &[]);
        assert_eq!(a.total_runs, 0);
        assert_eq!(a.error_rate, 0.0);
        assert_eq!(a.tokens_per_second, 0.0);
        assert!(a.mean_ttfb_ms.is_none());
    }

    #[test]
    fn test_aggregate_all_failed() {
        let runs = vec![run(0, false, 50, 0), run(1, false, 70, 0)];
        let a = build_aggregate(2, &runs);
        assert_eq!(a.successful, 0);
        assert_eq!(a.error_rate, 100.0);
        assert_eq!(a.mean_latency_ms, 0.0);
    }

    #[test]
    fn test_aggregate_mixed() {
        let runs = vec![
            run(0, true, 1000, 20),
            run(1, false, 5, 0),
            run(2, true, 3000, 60),
            run(3, true, 2000, 40),
        ];
        let a = build_aggregate(4, &runs);
        assert_eq!(a.successful, 3);
        assert!((a.error_rate - 25.0).abs() < 1e-9);
        assert!((a.mean_latency_ms - 2000.0).abs() < 1e-6);
        assert_eq!(a.total_deltas, 120);
        assert!((a.tokens_per_second - 20.0).abs() < 1e-9);
        assert!((a.mean_ttfb_ms.expect("ttfb") - 100.0).abs() < 1e-6);
    }

    #[test]
    fn test_report_render_and_json() {
        let runs = vec![run(0, true, 500, 10)];
        let report = BenchmarkReport {
            schema_version: 1,
            base_url: "http://localhost:16070".into(),
            prompt: "hi".into(),
            aggregate: build_aggregate(1, &runs),
            runs,
        };
        let text = report.render();
        assert!(text.contains("successful:    1"));
        assert!(text.contains("tokens/sec:    20.00"));

        let v = serde_json::to_value(&report).expect("json");
        assert_eq!(v["runs"][0]["latency"], 500);
        assert_eq!(v["runs"][0]["time_to_first_byte"], 100);
        assert_eq!(v["aggregate"]["successful"], 1);
    }

    #[tokio::test]
    async fn test_benchmark_against_unreachable_backend() {
        let config = SessionConfig { base_url: "http://127.0.0.1:1".into(), history_limit: 10 };
        let report = run_benchmark(&config, &ChatOptions::default(), "ping", 2).await;
        assert_eq!(report.runs.len(), 2);
        assert_eq!(report.aggregate.successful, 0);
        assert_eq!(report.aggregate.error_rate, 100.0);
        assert!(report.runs.iter().all(|r| r.error.is_some()));
    }
}
