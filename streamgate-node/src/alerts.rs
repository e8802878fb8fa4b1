//! # Alert Engine
//!
//! Periodic rule evaluation over the metric registry. Each tick reads every
//! rule's selected series, compares it to the threshold, and drives the
//! firing/resolved state machine. Transitions notify the rule's channels;
//! within the suppression window after a notification further notifications
//! for the same rule are dropped while the state keeps updating.
//!
//! Notifications are best-effort: a failed channel is logged and counted,
//! never retried synchronously.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use streamgate_fabric::duration_serde;
use tokio_util::sync::CancellationToken;

use crate::metrics::{labels as mk_labels, Labels, MetricRegistry, ALERT_NOTIFY_FAILURES};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = "<")]
    Less,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = "==")]
    Equal,
}

impl Comparator {
    fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            Comparator::Greater => value > threshold,
            Comparator::Less => value < threshold,
            Comparator::GreaterOrEqual => value >= threshold,
            Comparator::LessOrEqual => value <= threshold,
            Comparator::Equal => (value - threshold).abs() < f64::EPSILON,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// One configured rule: a metric selector, a comparison, and channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRuleConfig {
    pub name: String,
    /// Metric name to read.
    pub metric: String,
    /// Optional label selector; without it, all series of the metric are
    /// summed.
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub comparator: Comparator,
    pub threshold: f64,
    pub severity: Severity,
    /// `"log"` or `"webhook:<url>"`.
    pub channels: Vec<String>,
    #[serde(with = "duration_serde")]
    pub suppress_for: Duration,
}

/// Live state of one rule.
#[derive(Debug, Clone, Serialize)]
pub struct AlertState {
    pub firing: bool,
    pub last_transition: DateTime<Utc>,
    /// Transitions seen so far.
    pub count: u64,
    #[serde(skip)]
    last_notified: Option<Instant>,
}

impl Default for AlertState {
    fn default() -> Self {
        Self {
            firing: false,
            last_transition: Utc::now(),
            count: 0,
            last_notified: None,
        }
    }
}

pub struct AlertEngine {
    rules: Vec<AlertRuleConfig>,
    metrics: Arc<MetricRegistry>,
    states: DashMap<String, AlertState>,
    http: reqwest::Client,
}

impl AlertEngine {
    pub fn new(rules: Vec<AlertRuleConfig>, metrics: Arc<MetricRegistry>) -> Arc<Self> {
        Arc::new(Self {
            rules,
            metrics,
            states: DashMap::new(),
            http: reqwest::Client::new(),
        })
    }

    /// Spawn the evaluation loop at `interval`, stopping when `cancel`
    /// fires.
    pub fn spawn(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => engine.evaluate_all().await,
                }
            }
        });
    }

    /// One evaluation pass over every rule. Public for tests.
    pub async fn evaluate_all(&self) {
        for rule in &self.rules {
            let value = self.read_selector(rule);
            self.evaluate_rule(rule, value).await;
        }
    }

    /// Current state per rule, for the monitor surface.
    pub fn states(&self) -> Vec<(String, AlertState)> {
        let mut out: Vec<(String, AlertState)> = self
            .states
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    fn read_selector(&self, rule: &AlertRuleConfig) -> Option<f64> {
        if rule.labels.is_empty() {
            self.metrics.scalar_sum(&rule.metric)
        } else {
            let selector: Labels = {
                let mut pairs: Labels = rule
                    .labels
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                pairs.sort();
                pairs
            };
            self.metrics.scalar_value(&rule.metric, &selector)
        }
    }

    async fn evaluate_rule(&self, rule: &AlertRuleConfig, value: Option<f64>) {
        // An absent series never fires.
        let holds = value.map_or(false, |v| rule.comparator.holds(v, rule.threshold));

        let transition = {
            let mut state = self.states.entry(rule.name.clone()).or_default();
            if holds == state.firing {
                None
            } else {
                state.firing = holds;
                state.last_transition = Utc::now();
                state.count += 1;
                let suppressed = state
                    .last_notified
                    .is_some_and(|at| at.elapsed() < rule.suppress_for);
                if suppressed {
                    None
                } else {
                    state.last_notified = Some(Instant::now());
                    Some(holds)
                }
            }
        };

        if let Some(firing) = transition {
            self.notify(rule, firing, value.unwrap_or(0.0)).await;
        }
    }

    async fn notify(&self, rule: &AlertRuleConfig, firing: bool, value: f64) {
        let status = if firing { "firing" } else { "resolved" };
        for channel in &rule.channels {
            if channel == "log" {
                tracing::warn!(
                    rule = %rule.name,
                    status,
                    value,
                    threshold = rule.threshold,
                    severity = ?rule.severity,
                    "alert transition"
                );
            } else if let Some(url) = channel.strip_prefix("webhook:") {
                let body = json!({
                    "rule": rule.name,
                    "status": status,
                    "value": value,
                    "threshold": rule.threshold,
                    "severity": rule.severity,
                    "at": Utc::now().to_rfc3339(),
                });
                let sent = self
                    .http
                    .post(url)
                    .json(&body)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status());
                if let Err(e) = sent {
                    tracing::warn!(rule = %rule.name, url, error = %e, "alert webhook failed");
                    let _ = self.metrics.incr_counter(
                        ALERT_NOTIFY_FAILURES,
                        mk_labels([("rule", rule.name.as_str())]),
                        1.0,
                    );
                }
            } else {
                tracing::warn!(rule = %rule.name, channel, "unknown alert channel");
            }
        }
    }
}
