use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{CallRecord, LoadTestConfig, LoadTestRun};
use crate::core::{CallOutcome, DispatchError, Result};
use crate::stats::percentile;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSummary {
    pub total_calls: usize,
    pub successful_calls: usize,
    pub failed_calls: usize,
    pub timed_out_calls: usize,
    pub success_rate_percent: f64,
    pub test_duration_seconds: f64,
    pub target_calls: u64,
    pub ramp_up_seconds: f64,
    pub sustain_seconds: f64,
    pub max_concurrent: usize,
    pub latency_target_met: bool,
    pub passed: bool,
}

/// Latency over successful calls only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub samples: usize,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceAssessment {
    pub latency_threshold_ms: f64,
    pub achieved_p95_ms: f64,
    pub latency_target_met: bool,
    pub success_threshold_percent: f64,
    pub achieved_success_rate_percent: f64,
    pub success_target_met: bool,
    pub verdict: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadTestReport {
    pub test_summary: TestSummary,
    pub dispatch_latency_ms: LatencySummary,
    /// Failure and timeout counts keyed by error prefix.
    pub error_analysis: BTreeMap<String, usize>,
    pub performance_assessment: PerformanceAssessment,
}

impl LoadTestReport {
    pub fn from_run(run: &LoadTestRun) -> Self {
        Self::from_records(&run.config, &run.records, run.duration.as_secs_f64())
    }

    pub fn from_records(
        config: &LoadTestConfig,
        records: &[CallRecord],
        duration_seconds: f64,
    ) -> Self {
        let total = records.len();
        let count = |outcome: CallOutcome| records.iter().filter(|r| r.outcome == outcome).count();
        let successful = count(CallOutcome::Success);
        let failed = count(CallOutcome::Failure);
        let timed_out = count(CallOutcome::Timeout);

        let success_rate = if total == 0 {
            0.0
        } else {
            successful as f64 * 100.0 / total as f64
        };

        let mut latencies: Vec<f64> = records
            .iter()
            .filter(|record| record.outcome == CallOutcome::Success)
            .filter_map(|record| record.latency_ms)
            .collect();
        latencies.sort_by(f64::total_cmp);
        let latency = summarize(&latencies);

        // No successful call means nothing was measured, which cannot meet a target.
        let latency_target_met = latency.samples > 0 && latency.p95 < config.latency_threshold_ms;
        let success_target_met = total > 0 && success_rate >= config.success_threshold_percent;
        let passed = latency_target_met && success_target_met;

        let mut error_analysis = BTreeMap::new();
        for record in records.iter().filter(|r| r.outcome != CallOutcome::Success) {
            let key = match record.error.as_deref() {
                Some(error) => error_prefix(error),
                None => format!("{:?}", record.outcome).to_lowercase(),
            };
            *error_analysis.entry(key).or_insert(0) += 1;
        }

        Self {
            test_summary: TestSummary {
                total_calls: total,
                successful_calls: successful,
                failed_calls: failed,
                timed_out_calls: timed_out,
                success_rate_percent: round2(success_rate),
                test_duration_seconds: round2(duration_seconds),
                target_calls: config.target_calls,
                ramp_up_seconds: config.ramp_up.as_secs_f64(),
                sustain_seconds: config.sustain.as_secs_f64(),
                max_concurrent: config.max_concurrent,
                latency_target_met,
                passed,
            },
            performance_assessment: PerformanceAssessment {
                latency_threshold_ms: config.latency_threshold_ms,
                achieved_p95_ms: latency.p95,
                latency_target_met,
                success_threshold_percent: config.success_threshold_percent,
                achieved_success_rate_percent: round2(success_rate),
                success_target_met,
                verdict: if passed { "PASS" } else { "FAIL" }.to_string(),
            },
            dispatch_latency_ms: latency,
            error_analysis,
        }
    }

    pub fn passed(&self) -> bool {
        self.test_summary.passed
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|err| DispatchError::IoError(format!("encode report: {}", err)))
    }
}

fn summarize(sorted: &[f64]) -> LatencySummary {
    if sorted.is_empty() {
        return LatencySummary::default();
    }
    let mean = sorted.iter().sum::<f64>() / sorted.len() as f64;
    LatencySummary {
        samples: sorted.len(),
        mean: round2(mean),
        p50: round2(percentile(sorted, 0.50)),
        p95: round2(percentile(sorted, 0.95)),
        p99: round2(percentile(sorted, 0.99)),
        min: round2(sorted[0]),
        max: round2(sorted[sorted.len() - 1]),
    }
}

/// `"HTTP 503: saturated"` → `"HTTP 503"`, `"timeout: ..."` → `"timeout"`.
fn error_prefix(error: &str) -> String {
    let prefix = error.split(':').next().unwrap_or(error).trim();
    if prefix.is_empty() {
        "unknown".to_string()
    } else {
        prefix.to_string()
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;

    fn record(outcome: CallOutcome, latency_ms: Option<f64>, error: Option<&str>) -> CallRecord {
        CallRecord {
            call_id: "load-test-0-abcdef".into(),
            scheduled_at: Utc::now(),
            dispatch_sent_at: Some(Utc::now()),
            outcome,
            latency_ms,
            error: error.map(str::to_string),
        }
    }

    fn config() -> LoadTestConfig {
        LoadTestConfig {
            target_calls: 100,
            ramp_up: Duration::from_secs(30),
            max_concurrent: 100,
            ..LoadTestConfig::default()
        }
    }

    #[test]
    fn healthy_run_passes() {
        let mut records = Vec::new();
        records.extend((0..90).map(|_| record(CallOutcome::Success, Some(300.0), None)));
        records.extend((0..8).map(|_| record(CallOutcome::Success, Some(520.0), None)));
        records.push(record(CallOutcome::Failure, None, Some("HTTP 503: saturated")));
        records.push(record(CallOutcome::Timeout, None, Some("timeout: no acknowledgement")));

        let report = LoadTestReport::from_records(&config(), &records, 42.0);
        assert_eq!(report.test_summary.total_calls, 100);
        assert_eq!(report.test_summary.success_rate_percent, 98.0);
        assert_eq!(report.dispatch_latency_ms.p95, 520.0);
        assert!(report.test_summary.latency_target_met);
        assert!(report.test_summary.passed);
        assert_eq!(report.performance_assessment.verdict, "PASS");
    }

    #[test]
    fn low_success_rate_fails_even_with_fast_latency() {
        let mut records = Vec::new();
        records.extend((0..90).map(|_| record(CallOutcome::Success, Some(300.0), None)));
        records.extend((0..10).map(|_| record(CallOutcome::Timeout, None, Some("timeout: slow"))));

        let report = LoadTestReport::from_records(&config(), &records, 42.0);
        assert_eq!(report.test_summary.success_rate_percent, 90.0);
        assert!(report.test_summary.latency_target_met);
        assert!(!report.test_summary.passed);
        assert_eq!(report.test_summary.timed_out_calls, 10);
    }

    #[test]
    fn slow_p95_fails_the_latency_target() {
        let records: Vec<_> = (0..100)
            .map(|i| record(CallOutcome::Success, Some(if i < 90 { 200.0 } else { 900.0 }), None))
            .collect();
        let report = LoadTestReport::from_records(&config(), &records, 10.0);
        assert_eq!(report.test_summary.success_rate_percent, 100.0);
        assert!(!report.test_summary.latency_target_met);
        assert!(!report.passed());
    }

    #[test]
    fn errors_are_grouped_by_prefix() {
        let records = vec![
            record(CallOutcome::Failure, None, Some("HTTP 503: saturated")),
            record(CallOutcome::Failure, None, Some("HTTP 503: busy")),
            record(CallOutcome::Failure, None, Some("transport: connection reset")),
            record(CallOutcome::Timeout, None, None),
        ];
        let report = LoadTestReport::from_records(&config(), &records, 1.0);
        assert_eq!(report.error_analysis.get("HTTP 503"), Some(&2));
        assert_eq!(report.error_analysis.get("transport"), Some(&1));
        assert_eq!(report.error_analysis.get("timeout"), Some(&1));
    }

    #[test]
    fn empty_run_does_not_pass() {
        let report = LoadTestReport::from_records(&config(), &[], 0.0);
        assert_eq!(report.dispatch_latency_ms, LatencySummary::default());
        assert!(!report.test_summary.latency_target_met);
        assert!(!report.passed());
    }

    #[test]
    fn report_serializes_with_expected_sections() {
        let records = vec![record(CallOutcome::Success, Some(120.0), None)];
        let json = LoadTestReport::from_records(&config(), &records, 1.0)
            .to_json_pretty()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        for section in [
            "test_summary",
            "dispatch_latency_ms",
            "error_analysis",
            "performance_assessment",
        ] {
            assert!(value.get(section).is_some(), "missing {section}");
        }
        assert_eq!(value["test_summary"]["passed"], serde_json::json!(true));
    }
}
