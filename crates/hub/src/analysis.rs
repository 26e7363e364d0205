//! On-demand health assessment for one machine over a recent window.
//!
//! Two detection passes run over the same slice: absolute thresholds
//! (warn/crit, inclusive) and standardized scores against the slice's own
//! mean.  A reading can legitimately appear in both; nothing is
//! deduplicated.  All arithmetic is IEEE-754 double; the standard
//! deviation is the sample (n−1) form.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::config::AnalysisSettings;
use crate::db::{ReadingStore, StoreError, StoredReading};

/// Upper bound on the slice pulled for one assessment.
const ANALYSIS_SCAN_CAP: i64 = 10_000;

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    InsufficientData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalyKind {
    HighTemperature,
    HighVibration,
    TemperatureDeviation,
    VibrationDeviation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Anomaly {
    #[serde(rename = "type")]
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub value: f64,
    pub threshold: f64,
    pub message: String,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SliceStatistics {
    pub avg_temperature: f64,
    pub max_temperature: f64,
    pub avg_vibration: f64,
    pub max_vibration: f64,
    pub data_points_analyzed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub machine_id: String,
    pub analyzed_at: DateTime<Utc>,
    pub health_score: Option<i32>,
    pub status: HealthStatus,
    pub anomalies: Vec<Anomaly>,
    pub statistics: SliceStatistics,
}

// ---------------------------------------------------------------------------
// Descriptive statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleStats {
    pub mean: f64,
    pub max: f64,
    pub min: f64,
    pub std_dev: f64,
}

/// Sample statistics over a non-empty series.  With a single point the
/// deviation is 0, which the z-score pass treats as a constant series.
pub fn sample_stats(values: &[f64]) -> SampleStats {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let std_dev = if values.len() < 2 {
        0.0
    } else {
        let ss: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
        (ss / (n - 1.0)).sqrt()
    };
    SampleStats {
        mean,
        max,
        min,
        std_dev,
    }
}

// ---------------------------------------------------------------------------
// Detection passes
// ---------------------------------------------------------------------------

struct MetricSpec {
    label: &'static str,
    value: fn(&StoredReading) -> f64,
    threshold_kind: AnomalyKind,
    deviation_kind: AnomalyKind,
    warn: f64,
    crit: f64,
}

fn threshold_pass(readings: &[StoredReading], spec: &MetricSpec, out: &mut Vec<Anomaly>) {
    for r in readings {
        let value = (spec.value)(r);
        // Inclusive at both boundaries; critical wins over warning.
        let (severity, threshold) = if value >= spec.crit {
            (Severity::Critical, spec.crit)
        } else if value >= spec.warn {
            (Severity::Warning, spec.warn)
        } else {
            continue;
        };
        out.push(Anomaly {
            kind: spec.threshold_kind,
            severity,
            value,
            threshold,
            message: format!(
                "{} {:.2} at or above {} threshold {:.2}",
                spec.label,
                value,
                match severity {
                    Severity::Critical => "critical",
                    Severity::Warning => "warning",
                },
                threshold
            ),
            detected_at: r.timestamp,
        });
    }
}

fn zscore_pass(
    readings: &[StoredReading],
    spec: &MetricSpec,
    stats: &SampleStats,
    z_threshold: f64,
    out: &mut Vec<Anomaly>,
) {
    // A constant series has no meaningful standardized score.
    if stats.std_dev == 0.0 {
        return;
    }
    for r in readings {
        let value = (spec.value)(r);
        let z = ((value - stats.mean) / stats.std_dev).abs();
        if z > z_threshold {
            out.push(Anomaly {
                kind: spec.deviation_kind,
                severity: Severity::Warning,
                value,
                threshold: stats.mean + z_threshold * stats.std_dev,
                message: format!(
                    "{} {:.2} deviates from mean {:.2} (z-score {:.2})",
                    spec.label, value, stats.mean, z
                ),
                detected_at: r.timestamp,
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Assessment
// ---------------------------------------------------------------------------

fn insufficient(machine_id: &str, analyzed_at: DateTime<Utc>, points: usize) -> AnalysisReport {
    AnalysisReport {
        machine_id: machine_id.to_string(),
        analyzed_at,
        health_score: None,
        status: HealthStatus::InsufficientData,
        anomalies: Vec::new(),
        statistics: SliceStatistics {
            avg_temperature: 0.0,
            max_temperature: 0.0,
            avg_vibration: 0.0,
            max_vibration: 0.0,
            data_points_analyzed: points,
        },
    }
}

pub fn health_score(criticals: usize, warnings: usize) -> i32 {
    (100 - 20 * criticals as i32 - 5 * warnings as i32).clamp(0, 100)
}

fn bucket(score: i32) -> HealthStatus {
    if score >= 80 {
        HealthStatus::Healthy
    } else if score >= 50 {
        HealthStatus::Warning
    } else {
        HealthStatus::Critical
    }
}

/// Deterministic assessment of a slice: the result is a function of the
/// slice and the configured thresholds alone.
pub fn analyze(
    machine_id: &str,
    readings: &[StoredReading],
    settings: &AnalysisSettings,
    analyzed_at: DateTime<Utc>,
) -> AnalysisReport {
    if readings.len() < settings.min_points {
        return insufficient(machine_id, analyzed_at, readings.len());
    }

    let temps: Vec<f64> = readings.iter().map(|r| r.temperature).collect();
    let vibs: Vec<f64> = readings.iter().map(|r| r.vibration).collect();
    let temp_stats = sample_stats(&temps);
    let vib_stats = sample_stats(&vibs);

    let temp_spec = MetricSpec {
        label: "temperature",
        value: |r| r.temperature,
        threshold_kind: AnomalyKind::HighTemperature,
        deviation_kind: AnomalyKind::TemperatureDeviation,
        warn: settings.temp_warn,
        crit: settings.temp_crit,
    };
    let vib_spec = MetricSpec {
        label: "vibration",
        value: |r| r.vibration,
        threshold_kind: AnomalyKind::HighVibration,
        deviation_kind: AnomalyKind::VibrationDeviation,
        warn: settings.vib_warn,
        crit: settings.vib_crit,
    };

    let mut anomalies = Vec::new();
    threshold_pass(readings, &temp_spec, &mut anomalies);
    threshold_pass(readings, &vib_spec, &mut anomalies);
    zscore_pass(readings, &temp_spec, &temp_stats, settings.z_threshold, &mut anomalies);
    zscore_pass(readings, &vib_spec, &vib_stats, settings.z_threshold, &mut anomalies);
    anomalies.sort_by_key(|a| a.detected_at);

    let criticals = anomalies
        .iter()
        .filter(|a| a.severity == Severity::Critical)
        .count();
    let warnings = anomalies.len() - criticals;
    let score = health_score(criticals, warnings);

    AnalysisReport {
        machine_id: machine_id.to_string(),
        analyzed_at,
        health_score: Some(score),
        status: bucket(score),
        anomalies,
        statistics: SliceStatistics {
            avg_temperature: temp_stats.mean,
            max_temperature: temp_stats.max,
            avg_vibration: vib_stats.mean,
            max_vibration: vib_stats.max,
            data_points_analyzed: readings.len(),
        },
    }
}

/// Pull the slice and assess it.  Runs on the caller's task; store failure
/// fails the whole analysis (no partial result).
pub async fn run(
    machine_id: &str,
    hours: u32,
    store: &dyn ReadingStore,
    settings: &AnalysisSettings,
) -> Result<AnalysisReport, StoreError> {
    let analyzed_at = Utc::now();
    let since = analyzed_at - Duration::hours(i64::from(hours));
    let slice = store
        .scan_machine(machine_id, Some(since), ANALYSIS_SCAN_CAP)
        .await?;
    Ok(analyze(machine_id, &slice, settings, analyzed_at))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::MachineStatus;
    use chrono::TimeZone;

    fn settings() -> AnalysisSettings {
        AnalysisSettings::default()
    }

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 10, minute, 0).unwrap()
    }

    fn slice(temps: &[f64]) -> Vec<StoredReading> {
        slice_with_vib(temps, &vec![0.4; temps.len()])
    }

    fn slice_with_vib(temps: &[f64], vibs: &[f64]) -> Vec<StoredReading> {
        temps
            .iter()
            .zip(vibs)
            .enumerate()
            .map(|(i, (&temperature, &vibration))| StoredReading {
                id: i as i64 + 1,
                machine_id: "M001".into(),
                timestamp: ts(i as u32),
                temperature,
                vibration,
                pressure: None,
                humidity: None,
                power_consumption: None,
                rotation_speed: None,
                status: MachineStatus::Running,
                location: None,
                metadata: None,
                ingested_at: ts(i as u32),
            })
            .collect()
    }

    // -- sample statistics --------------------------------------------------

    #[test]
    fn stats_of_known_series() {
        let s = sample_stats(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert!((s.mean - 5.0).abs() < 1e-12);
        assert_eq!(s.max, 9.0);
        assert_eq!(s.min, 2.0);
        // Sample (n−1) form: sum of squares 32, n−1 = 7.
        assert!((s.std_dev - (32.0f64 / 7.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn stats_of_single_point() {
        let s = sample_stats(&[42.0]);
        assert_eq!(s.mean, 42.0);
        assert_eq!(s.std_dev, 0.0);
    }

    #[test]
    fn stats_of_constant_series() {
        let s = sample_stats(&[7.0; 20]);
        assert_eq!(s.mean, 7.0);
        assert_eq!(s.std_dev, 0.0);
    }

    // -- health score arithmetic --------------------------------------------

    #[test]
    fn score_formula() {
        assert_eq!(health_score(0, 0), 100);
        assert_eq!(health_score(1, 0), 80);
        assert_eq!(health_score(0, 1), 95);
        assert_eq!(health_score(2, 3), 45);
        assert_eq!(health_score(6, 0), 0); // clamped
        assert_eq!(health_score(0, 25), 0);
    }

    #[test]
    fn status_buckets_at_boundaries() {
        assert_eq!(bucket(100), HealthStatus::Healthy);
        assert_eq!(bucket(80), HealthStatus::Healthy);
        assert_eq!(bucket(79), HealthStatus::Warning);
        assert_eq!(bucket(50), HealthStatus::Warning);
        assert_eq!(bucket(49), HealthStatus::Critical);
        assert_eq!(bucket(0), HealthStatus::Critical);
    }

    // -- insufficient data --------------------------------------------------

    #[test]
    fn small_slice_is_insufficient() {
        let report = analyze("M002", &slice(&[75.0, 75.0, 75.0]), &settings(), ts(30));
        assert_eq!(report.status, HealthStatus::InsufficientData);
        assert_eq!(report.health_score, None);
        assert!(report.anomalies.is_empty());
        assert_eq!(report.statistics.data_points_analyzed, 3);
    }

    #[test]
    fn empty_slice_is_insufficient() {
        let report = analyze("M002", &[], &settings(), ts(30));
        assert_eq!(report.status, HealthStatus::InsufficientData);
        assert_eq!(report.statistics.data_points_analyzed, 0);
    }

    #[test]
    fn min_points_is_exclusive_below() {
        let report = analyze("M001", &slice(&[75.0; 10]), &settings(), ts(30));
        assert_ne!(report.status, HealthStatus::InsufficientData);
    }

    // -- threshold pass -----------------------------------------------------

    #[test]
    fn critical_temperatures_detected() {
        // Ten quiet readings, then two over the critical line.
        let mut temps = vec![75.0; 10];
        temps.extend([105.0, 106.0]);
        let report = analyze("M001", &slice(&temps), &settings(), ts(30));

        let criticals: Vec<&Anomaly> = report
            .anomalies
            .iter()
            .filter(|a| a.severity == Severity::Critical)
            .collect();
        assert_eq!(criticals.len(), 2);
        assert!(criticals
            .iter()
            .all(|a| a.kind == AnomalyKind::HighTemperature && a.threshold == 100.0));
        // 2 × −20: the z pass stays silent here (z ≈ 2.1 and 2.2 < 2.5).
        assert_eq!(report.health_score, Some(60));
        assert_eq!(report.status, HealthStatus::Warning);
    }

    #[test]
    fn threshold_boundaries_are_inclusive() {
        let mut temps = vec![75.0; 10];
        temps.extend([90.0, 100.0]);
        let report = analyze("M001", &slice(&temps), &settings(), ts(30));

        let threshold_anoms: Vec<&Anomaly> = report
            .anomalies
            .iter()
            .filter(|a| a.kind == AnomalyKind::HighTemperature)
            .collect();
        assert_eq!(threshold_anoms.len(), 2);
        assert_eq!(threshold_anoms[0].severity, Severity::Warning);
        assert_eq!(threshold_anoms[0].threshold, 90.0);
        assert_eq!(threshold_anoms[1].severity, Severity::Critical);
        assert_eq!(threshold_anoms[1].threshold, 100.0);
    }

    #[test]
    fn vibration_thresholds_detected() {
        let mut vibs = vec![0.3; 10];
        vibs.extend([0.7, 0.85]);
        let temps = vec![75.0; 12];
        let report = analyze("M001", &slice_with_vib(&temps, &vibs), &settings(), ts(30));

        let vib_anoms: Vec<&Anomaly> = report
            .anomalies
            .iter()
            .filter(|a| a.kind == AnomalyKind::HighVibration)
            .collect();
        assert_eq!(vib_anoms.len(), 2);
        assert_eq!(vib_anoms[0].severity, Severity::Warning);
        assert_eq!(vib_anoms[1].severity, Severity::Critical);
    }

    // -- z-score pass -------------------------------------------------------

    #[test]
    fn zscore_only_anomaly_detected() {
        // 88 °C is well under temp_warn=90 but 3+ deviations off the mean.
        let mut temps = vec![75.0; 11];
        temps.push(88.0);
        let report = analyze("M001", &slice(&temps), &settings(), ts(30));

        assert!(report
            .anomalies
            .iter()
            .all(|a| a.kind != AnomalyKind::HighTemperature));
        let deviations: Vec<&Anomaly> = report
            .anomalies
            .iter()
            .filter(|a| a.kind == AnomalyKind::TemperatureDeviation)
            .collect();
        assert_eq!(deviations.len(), 1);
        assert_eq!(deviations[0].severity, Severity::Warning);
        assert_eq!(deviations[0].value, 88.0);
        // The z value is carried in the message, two decimals.
        assert!(
            deviations[0].message.contains("z-score 3."),
            "message: {}",
            deviations[0].message
        );
        assert!(report.health_score.unwrap() >= 95);
        assert_eq!(report.status, HealthStatus::Healthy);
    }

    #[test]
    fn constant_series_produces_no_zscore_anomalies() {
        let report = analyze("M001", &slice(&[75.0; 12]), &settings(), ts(30));
        assert!(report.anomalies.is_empty());
        assert_eq!(report.health_score, Some(100));
        assert_eq!(report.status, HealthStatus::Healthy);
    }

    #[test]
    fn zscore_cutoff_is_exclusive() {
        // With an unreachable cutoff the deviation pass must stay silent.
        let mut settings = settings();
        settings.z_threshold = 1_000.0;
        let mut temps = vec![75.0; 11];
        temps.push(88.0);
        let report = analyze("M001", &slice(&temps), &settings, ts(30));
        assert!(report.anomalies.is_empty());
    }

    // -- ordering and no dedup ----------------------------------------------

    #[test]
    fn anomalies_ordered_by_detection_time() {
        let mut temps = vec![75.0; 10];
        temps.extend([105.0, 104.0]);
        let report = analyze("M001", &slice(&temps), &settings(), ts(30));
        let times: Vec<DateTime<Utc>> = report.anomalies.iter().map(|a| a.detected_at).collect();
        let mut sorted = times.clone();
        sorted.sort();
        assert_eq!(times, sorted);
    }

    #[test]
    fn threshold_and_zscore_hits_both_kept() {
        // A single extreme spike trips the critical threshold and the
        // z-score pass for the same reading; both survive.
        let mut temps = vec![75.0; 15];
        temps.push(140.0);
        let report = analyze("M001", &slice(&temps), &settings(), ts(30));

        let spike_anoms: Vec<&Anomaly> = report
            .anomalies
            .iter()
            .filter(|a| a.value == 140.0)
            .collect();
        assert_eq!(spike_anoms.len(), 2);
        let kinds: Vec<AnomalyKind> = spike_anoms.iter().map(|a| a.kind).collect();
        assert!(kinds.contains(&AnomalyKind::HighTemperature));
        assert!(kinds.contains(&AnomalyKind::TemperatureDeviation));
    }

    #[test]
    fn analysis_is_deterministic() {
        let mut temps = vec![70.0, 75.0, 80.0, 85.0, 90.0, 95.0];
        temps.extend([72.0, 74.0, 76.0, 78.0, 102.0, 68.0]);
        let s = slice(&temps);
        let a = analyze("M001", &s, &settings(), ts(30));
        let b = analyze("M001", &s, &settings(), ts(30));
        assert_eq!(a, b);
    }

    // -- statistics in the report -------------------------------------------

    #[test]
    fn report_statistics_match_slice() {
        let temps = vec![70.0, 80.0, 90.0, 70.0, 80.0, 90.0, 70.0, 80.0, 90.0, 70.0];
        let report = analyze("M001", &slice(&temps), &settings(), ts(30));
        assert!((report.statistics.avg_temperature - 79.0).abs() < 1e-12);
        assert_eq!(report.statistics.max_temperature, 90.0);
        assert_eq!(report.statistics.avg_vibration, 0.4);
        assert_eq!(report.statistics.max_vibration, 0.4);
        assert_eq!(report.statistics.data_points_analyzed, 10);
    }

    // -- serialization ------------------------------------------------------

    #[test]
    fn report_serializes_camel_case() {
        let mut temps = vec![75.0; 10];
        temps.push(105.0);
        temps.push(75.0);
        let report = analyze("M001", &slice(&temps), &settings(), ts(30));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["machineId"], "M001");
        assert_eq!(json["status"], "WARNING");
        assert!(json["healthScore"].is_number());
        assert_eq!(json["anomalies"][0]["type"], "HIGH_TEMPERATURE");
        assert_eq!(json["anomalies"][0]["severity"], "CRITICAL");
        assert!(json["statistics"]["dataPointsAnalyzed"].is_number());
    }

    #[test]
    fn insufficient_report_serializes_null_score() {
        let report = analyze("M002", &slice(&[75.0]), &settings(), ts(30));
        let json = serde_json::to_value(&report).unwrap();
        assert!(json["healthScore"].is_null());
        assert_eq!(json["status"], "INSUFFICIENT_DATA");
    }

    // -- store-backed entry point -------------------------------------------

    #[tokio::test]
    async fn run_pulls_only_the_window() {
        use crate::db::testing::MemStore;
        use crate::reading::Reading;

        let store = MemStore::new();
        let now = Utc::now();
        let mut batch = Vec::new();
        for i in 0..12 {
            batch.push(Reading {
                machine_id: "M001".into(),
                timestamp: now - Duration::minutes(i),
                temperature: 75.0,
                vibration: 0.4,
                pressure: None,
                humidity: None,
                power_consumption: None,
                rotation_speed: None,
                status: MachineStatus::Running,
                location: None,
                metadata: None,
            });
        }
        // One ancient reading that must stay outside the 24 h window.
        batch.push(Reading {
            machine_id: "M001".into(),
            timestamp: now - Duration::days(10),
            temperature: 190.0,
            vibration: 0.4,
            pressure: None,
            humidity: None,
            power_consumption: None,
            rotation_speed: None,
            status: MachineStatus::Running,
            location: None,
            metadata: None,
        });
        store.append_batch(&batch).await.unwrap();

        let report = run("M001", 24, &store, &settings()).await.unwrap();
        assert_eq!(report.statistics.data_points_analyzed, 12);
        assert!(report.anomalies.is_empty());
    }

    #[tokio::test]
    async fn run_surfaces_store_failure() {
        use crate::db::testing::MemStore;
        let store = MemStore::new();
        store.set_unreachable(true);
        assert!(run("M001", 24, &store, &settings()).await.is_err());
    }
}
