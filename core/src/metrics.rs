use crate::dispatcher::{AlertStatus, TerminationStatus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

// Simple histogram for latency tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<(f64, AtomicU64)>, // (upper_bound, count), non-cumulative
    count: AtomicU64,               // all observations, including above the last bound
    sum_micros: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        let bounds = vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];
        Self {
            buckets: bounds.into_iter().map(|b| (b, AtomicU64::new(0))).collect(),
            count: AtomicU64::new(0),
            sum_micros: AtomicU64::new(0),
        }
    }

    fn record(&self, value: f64) {
        let value = value.max(0.0);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((value * 1_000_000.0).round() as u64, Ordering::Relaxed);
        if let Some((_, count)) = self.buckets.iter().find(|(bound, _)| value <= *bound) {
            count.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn to_prometheus(&self, name: &str) -> String {
        let mut output = format!("# HELP {}_seconds Duration histogram.\n", name);
        output.push_str(&format!("# TYPE {}_seconds histogram\n", name));
        let mut cumulative = 0;
        for (bound, count) in &self.buckets {
            cumulative += count.load(Ordering::Relaxed);
            output.push_str(&format!(
                "{}_seconds_bucket{{le=\"{}\"}} {}\n",
                name, bound, cumulative
            ));
        }
        let total = self.count.load(Ordering::Relaxed);
        output.push_str(&format!(
            "{}_seconds_bucket{{le=\"+Inf\"}} {}\n",
            name, total
        ));
        output.push_str(&format!(
            "{}_seconds_sum {}\n",
            name,
            self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
        ));
        output.push_str(&format!("{}_seconds_count {}\n", name, total));
        output
    }
}

pub struct SystemMetrics {
    pub evaluations_total: AtomicU64,
    pub rules_fired_total: AtomicU64,
    pub checks_missing_total: AtomicU64,
    pub alerts_sent: AtomicU64,
    pub alerts_skipped: AtomicU64,
    pub alerts_failed: AtomicU64,
    pub terminations_succeeded: AtomicU64,
    pub terminations_not_found: AtomicU64,
    pub terminations_failed: AtomicU64,
    pub refreshes_total: AtomicU64,
    pub fetch_failures: AtomicU64,
    pub rule_fires: Mutex<HashMap<String, u64>>,
    pub dispatch_duration: Histogram,
}

impl SystemMetrics {
    pub fn new() -> Self {
        Self {
            evaluations_total: AtomicU64::new(0),
            rules_fired_total: AtomicU64::new(0),
            checks_missing_total: AtomicU64::new(0),
            alerts_sent: AtomicU64::new(0),
            alerts_skipped: AtomicU64::new(0),
            alerts_failed: AtomicU64::new(0),
            terminations_succeeded: AtomicU64::new(0),
            terminations_not_found: AtomicU64::new(0),
            terminations_failed: AtomicU64::new(0),
            refreshes_total: AtomicU64::new(0),
            fetch_failures: AtomicU64::new(0),
            rule_fires: Mutex::new(HashMap::new()),
            dispatch_duration: Histogram::new(),
        }
    }

    pub fn record_evaluation(&self, fired: bool, missing_check: bool) {
        self.evaluations_total.fetch_add(1, Ordering::Relaxed);
        if fired {
            self.rules_fired_total.fetch_add(1, Ordering::Relaxed);
        }
        if missing_check {
            self.checks_missing_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_rule_fired(&self, rule_id: &str) {
        let mut map = self.rule_fires.lock().unwrap_or_else(PoisonError::into_inner);
        *map.entry(rule_id.to_string()).or_insert(0) += 1;
    }

    pub fn record_alert(&self, status: AlertStatus) {
        let counter = match status {
            AlertStatus::Sent => &self.alerts_sent,
            AlertStatus::Skipped => &self.alerts_skipped,
            AlertStatus::Failed => &self.alerts_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_termination(&self, status: TerminationStatus) {
        let counter = match status {
            TerminationStatus::NotApplicable => return,
            TerminationStatus::Succeeded => &self.terminations_succeeded,
            TerminationStatus::NotFound => &self.terminations_not_found,
            TerminationStatus::Failed => &self.terminations_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refresh(&self, ok: bool) {
        if ok {
            self.refreshes_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.fetch_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_dispatch_duration(&self, duration_secs: f64) {
        self.dispatch_duration.record(duration_secs);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            evaluations_total: self.evaluations_total.load(Ordering::Relaxed),
            rules_fired_total: self.rules_fired_total.load(Ordering::Relaxed),
            checks_missing_total: self.checks_missing_total.load(Ordering::Relaxed),
            alerts_sent: self.alerts_sent.load(Ordering::Relaxed),
            alerts_skipped: self.alerts_skipped.load(Ordering::Relaxed),
            alerts_failed: self.alerts_failed.load(Ordering::Relaxed),
            terminations_succeeded: self.terminations_succeeded.load(Ordering::Relaxed),
            terminations_not_found: self.terminations_not_found.load(Ordering::Relaxed),
            terminations_failed: self.terminations_failed.load(Ordering::Relaxed),
            refreshes_total: self.refreshes_total.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            rule_fires: self
                .rule_fires
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        let counters = [
            ("dqguard_evaluations_total", "Rule evaluations performed.", s.evaluations_total),
            ("dqguard_rules_fired_total", "Rule evaluations that fired.", s.rules_fired_total),
            ("dqguard_checks_missing_total", "Evaluations whose check was absent from the snapshot.", s.checks_missing_total),
            ("dqguard_alerts_sent_total", "Alerts delivered.", s.alerts_sent),
            ("dqguard_alerts_skipped_total", "Alerts skipped.", s.alerts_skipped),
            ("dqguard_alerts_failed_total", "Alerts that failed to deliver.", s.alerts_failed),
            ("dqguard_terminations_succeeded_total", "Workflows terminated.", s.terminations_succeeded),
            ("dqguard_terminations_not_found_total", "Terminations of already absent workflows.", s.terminations_not_found),
            ("dqguard_terminations_failed_total", "Failed workflow terminations.", s.terminations_failed),
            ("dqguard_refreshes_total", "Successful snapshot refreshes.", s.refreshes_total),
            ("dqguard_fetch_failures_total", "Failed lineage or outcome fetches.", s.fetch_failures),
        ];

        let mut output = String::new();
        for (name, help, value) in counters {
            output.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"
            ));
        }

        output.push_str("# HELP dqguard_rule_fires_total Fires per rule.\n");
        output.push_str("# TYPE dqguard_rule_fires_total counter\n");
        let mut fires: Vec<_> = s.rule_fires.iter().collect();
        fires.sort();
        for (rule_id, count) in fires {
            output.push_str(&format!(
                "dqguard_rule_fires_total{{rule_id=\"{}\"}} {}\n",
                rule_id, count
            ));
        }

        output.push_str(&self.dispatch_duration.to_prometheus("dqguard_dispatch_duration"));
        output
    }
}

impl Default for SystemMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub evaluations_total: u64,
    pub rules_fired_total: u64,
    pub checks_missing_total: u64,
    pub alerts_sent: u64,
    pub alerts_skipped: u64,
    pub alerts_failed: u64,
    pub terminations_succeeded: u64,
    pub terminations_not_found: u64,
    pub terminations_failed: u64,
    pub refreshes_total: u64,
    pub fetch_failures: u64,
    pub rule_fires: HashMap<String, u64>,
}

lazy_static::lazy_static! {
    pub static ref METRICS: SystemMetrics = SystemMetrics::new();
}
