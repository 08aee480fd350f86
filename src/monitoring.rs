//! Heart-rate monitoring sessions
//!
//! Listens to one athlete's live tick events for a bounded number of samples
//! and summarizes them: average and peak heart rate, steps, session length,
//! and samples that sit more than two standard deviations from the mean.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{PublishError, Result, TwinError};
use crate::models::TickEvent;
use crate::publisher::{AthleteSubscription, BroadcastPublisher};

/// Deviations from the mean, in standard deviations, that count as anomalous
pub const ANOMALY_SIGMA: f64 = 2.0;

/// One received reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringSample {
    pub heart_rate: u16,
    pub steps: u64,
    pub timestamp: DateTime<Utc>,
}

impl MonitoringSample {
    pub fn from_event(event: &TickEvent, timestamp: DateTime<Utc>) -> Self {
        Self {
            heart_rate: event.snapshot().heart_rate,
            steps: event.snapshot().steps,
            timestamp,
        }
    }
}

/// A reading far from the session mean
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartRateAnomaly {
    pub heart_rate: u16,
    /// Signed distance from the mean in bpm
    pub deviation: f64,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Statistics over a finished session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringSummary {
    pub athlete_id: String,
    pub sample_count: usize,
    pub avg_heart_rate: f64,
    pub max_heart_rate: u16,
    /// Highest step count seen
    pub total_steps: u64,
    pub duration_minutes: f64,
    pub anomalies: Vec<HeartRateAnomaly>,
}

impl MonitoringSummary {
    /// Summarize samples taken `interval` apart; None when there are none
    pub fn from_samples(
        athlete_id: impl Into<String>,
        samples: &[MonitoringSample],
        interval: Duration,
    ) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }

        let heart_rates: Vec<f64> = samples.iter().map(|s| f64::from(s.heart_rate)).collect();
        let mean = heart_rates.iter().mean();
        let std_dev = heart_rates.iter().population_std_dev();

        let anomalies = samples
            .iter()
            .filter_map(|s| {
                let deviation = f64::from(s.heart_rate) - mean;
                (deviation.abs() > ANOMALY_SIGMA * std_dev).then(|| HeartRateAnomaly {
                    heart_rate: s.heart_rate,
                    deviation,
                    message: format!("Unusual heart rate detected: {} BPM", s.heart_rate),
                    timestamp: s.timestamp,
                })
            })
            .collect();

        Some(Self {
            athlete_id: athlete_id.into(),
            sample_count: samples.len(),
            avg_heart_rate: mean,
            max_heart_rate: samples.iter().map(|s| s.heart_rate).max().unwrap_or(0),
            total_steps: samples.iter().map(|s| s.steps).max().unwrap_or(0),
            duration_minutes: interval.as_secs_f64() * samples.len() as f64 / 60.0,
            anomalies,
        })
    }
}

/// Collects a bounded run of live samples for one athlete
pub struct MonitoringSession {
    subscription: AthleteSubscription,
    max_samples: usize,
    timeout: Duration,
    interval: Duration,
}

impl MonitoringSession {
    /// Subscribe now; only events published after this call are collected
    pub fn new(
        publisher: &BroadcastPublisher,
        athlete_id: impl Into<String>,
        max_samples: usize,
        interval: Duration,
    ) -> Self {
        Self {
            subscription: publisher.subscribe_athlete(athlete_id),
            max_samples: max_samples.max(1),
            // room for every sample plus a few missed ticks
            timeout: interval.saturating_mul((max_samples as u32).saturating_add(5)),
            interval,
        }
    }

    /// Give up after this long even if fewer samples arrived
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn run(self) -> Result<Option<MonitoringSummary>> {
        self.run_with_progress(|_| {}).await
    }

    /// Collect samples, calling `on_sample` with the running count
    pub async fn run_with_progress<F>(mut self, mut on_sample: F) -> Result<Option<MonitoringSummary>>
    where
        F: FnMut(usize),
    {
        let athlete_id = self.subscription.athlete_id().to_string();
        let deadline = Instant::now() + self.timeout;
        let mut samples = Vec::with_capacity(self.max_samples);

        info!(athlete_id = %athlete_id, max_samples = self.max_samples, "Monitoring session started");
        while samples.len() < self.max_samples {
            match tokio::time::timeout_at(deadline, self.subscription.recv()).await {
                Ok(Ok(event)) => {
                    samples.push(MonitoringSample::from_event(&event, Utc::now()));
                    on_sample(samples.len());
                }
                Ok(Err(PublishError::Closed)) => {
                    return Err(TwinError::Publish(PublishError::Closed));
                }
                Ok(Err(e)) => debug!(error = %e, "Skipping undeliverable event"),
                Err(_) => {
                    debug!(collected = samples.len(), "Monitoring session timed out");
                    break;
                }
            }
        }

        let summary = MonitoringSummary::from_samples(&athlete_id, &samples, self.interval);
        if let Some(summary) = &summary {
            info!(
                athlete_id = %athlete_id,
                samples = summary.sample_count,
                avg_heart_rate = summary.avg_heart_rate,
                anomalies = summary.anomalies.len(),
                "Monitoring session finished"
            );
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulatorConfig;
    use crate::engine::SimulationEngine;
    use std::sync::Arc;

    fn samples(heart_rates: &[u16]) -> Vec<MonitoringSample> {
        heart_rates
            .iter()
            .enumerate()
            .map(|(i, hr)| MonitoringSample {
                heart_rate: *hr,
                steps: i as u64 * 10,
                timestamp: Utc::now(),
            })
            .collect()
    }

    #[test]
    fn test_empty_session_has_no_summary() {
        assert!(MonitoringSummary::from_samples("A1", &[], Duration::from_secs(1)).is_none());
    }

    #[test]
    fn test_summary_statistics() {
        let data = samples(&[60, 70, 80, 70]);
        let summary = MonitoringSummary::from_samples("A1", &data, Duration::from_secs(15)).unwrap();

        assert_eq!(summary.sample_count, 4);
        assert!((summary.avg_heart_rate - 70.0).abs() < 1e-9);
        assert_eq!(summary.max_heart_rate, 80);
        assert_eq!(summary.total_steps, 30);
        assert!((summary.duration_minutes - 1.0).abs() < 1e-9);
        assert!(summary.anomalies.is_empty());
    }

    #[test]
    fn test_outlier_flagged() {
        let mut rates = vec![70u16; 20];
        rates.push(150);
        let summary =
            MonitoringSummary::from_samples("A1", &samples(&rates), Duration::from_secs(1)).unwrap();

        assert_eq!(summary.anomalies.len(), 1);
        assert_eq!(summary.anomalies[0].heart_rate, 150);
        assert!(summary.anomalies[0].deviation > 0.0);
        assert!(summary.anomalies[0].message.contains("150 BPM"));
    }

    #[test]
    fn test_constant_heart_rate_has_no_anomalies() {
        let summary =
            MonitoringSummary::from_samples("A1", &samples(&[72; 10]), Duration::from_secs(1)).unwrap();
        assert!(summary.anomalies.is_empty());
    }

    #[tokio::test]
    async fn test_session_collects_live_samples() {
        let config = SimulatorConfig {
            tick_interval_ms: 10,
            seed: Some(3),
            ..SimulatorConfig::default()
        };
        let publisher = BroadcastPublisher::new(64);
        let engine = SimulationEngine::new(config, Arc::new(publisher.clone())).unwrap();

        let session = MonitoringSession::new(&publisher, "A1", 3, engine.tick_interval())
            .with_timeout(Duration::from_secs(5));
        engine.start("A1").unwrap();
        engine.start("B2").unwrap();

        let mut seen = Vec::new();
        let summary = session
            .run_with_progress(|n| seen.push(n))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(summary.athlete_id, "A1");
        assert_eq!(summary.sample_count, 3);
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_session_times_out_without_events() {
        let publisher = BroadcastPublisher::new(8);
        let session = MonitoringSession::new(&publisher, "idle", 5, Duration::from_millis(10))
            .with_timeout(Duration::from_millis(50));

        assert!(session.run().await.unwrap().is_none());
    }
}
