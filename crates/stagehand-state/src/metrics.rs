//! Dashboard aggregates over execution records.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::record::{BuildStatus, ExecutionRecord};

/// Aggregate build metrics for a time range.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DashboardMetrics {
    pub total_builds: u64,
    pub passed_builds: u64,
    pub failed_builds: u64,
    /// Builds still pending (running or paused).
    pub active_builds: u64,
    /// Distinct pull requests that triggered a build.
    pub pull_requests: u64,
    /// Failed share of finished builds, in percent.
    pub failure_rate: f64,
    /// Mean duration of finished builds, in minutes.
    pub avg_build_time: f64,
}

impl DashboardMetrics {
    pub fn from_records(records: &[ExecutionRecord]) -> Self {
        let mut metrics = DashboardMetrics {
            total_builds: records.len() as u64,
            ..Default::default()
        };

        let mut prs = HashSet::new();
        let mut total_ms: u64 = 0;
        let mut timed: u64 = 0;

        for record in records {
            match record.status {
                BuildStatus::Passed => metrics.passed_builds += 1,
                BuildStatus::Failed => metrics.failed_builds += 1,
                BuildStatus::Pending => metrics.active_builds += 1,
            }
            if let Some(number) = record.pr_number {
                prs.insert((record.repository.as_str(), number));
            }
            if let (true, Some(ms)) = (record.status.is_terminal(), record.duration_ms) {
                total_ms += ms;
                timed += 1;
            }
        }

        metrics.pull_requests = prs.len() as u64;

        let finished = metrics.passed_builds + metrics.failed_builds;
        if finished > 0 {
            metrics.failure_rate =
                round2(metrics.failed_builds as f64 * 100.0 / finished as f64);
        }
        if timed > 0 {
            metrics.avg_build_time = round2(total_ms as f64 / timed as f64 / 60_000.0);
        }

        metrics
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::BuildId;
    use chrono::{Duration, Utc};

    fn finished(id: &str, pr: u64, status: BuildStatus, minutes: i64) -> ExecutionRecord {
        let mut rec = ExecutionRecord::new(BuildId::from(id), "acme/widgets", "main", "sha", "PR")
            .with_pr_number(pr);
        let end = rec.created_at + Duration::minutes(minutes);
        rec.finish(status, end);
        rec
    }

    #[test]
    fn test_empty_metrics() {
        let metrics = DashboardMetrics::from_records(&[]);
        assert_eq!(metrics, DashboardMetrics::default());
    }

    #[test]
    fn test_counts_rate_and_mean() {
        let records = vec![
            finished("a", 1, BuildStatus::Passed, 2),
            finished("b", 1, BuildStatus::Failed, 4),
            finished("c", 2, BuildStatus::Failed, 6),
            ExecutionRecord::new(BuildId::from("d"), "acme/widgets", "main", "sha", "PR")
                .with_pr_number(3)
                .with_created_at(Utc::now()),
        ];

        let metrics = DashboardMetrics::from_records(&records);
        assert_eq!(metrics.total_builds, 4);
        assert_eq!(metrics.passed_builds, 1);
        assert_eq!(metrics.failed_builds, 2);
        assert_eq!(metrics.active_builds, 1);
        assert_eq!(metrics.pull_requests, 3);
        assert_eq!(metrics.failure_rate, 66.67);
        assert_eq!(metrics.avg_build_time, 4.0);
    }
}
