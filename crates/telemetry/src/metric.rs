//! Metric taxonomy: units and aggregation functions.
//!
//! Event types map 1:1 to metric types. The unit and aggregation tables are
//! small closed enumerations with a fall-through default; unknown event
//! types aggregate as SUM over counts.

use serde::{Deserialize, Serialize};

/// Metric type, parsed straight from the event type string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MetricType {
    ApiCalls,
    StorageGbHours,
    BandwidthMb,
    ComputeHours,
    StorageGbPeak,
    ConcurrentUsersMax,
    /// Any event type outside the closed set.
    Other(String),
}

impl MetricType {
    pub fn as_str(&self) -> &str {
        match self {
            MetricType::ApiCalls => "api_calls",
            MetricType::StorageGbHours => "storage_gb_hours",
            MetricType::BandwidthMb => "bandwidth_mb",
            MetricType::ComputeHours => "compute_hours",
            MetricType::StorageGbPeak => "storage_gb_peak",
            MetricType::ConcurrentUsersMax => "concurrent_users_max",
            MetricType::Other(s) => s,
        }
    }

    /// Billing unit for this metric.
    pub fn unit(&self) -> Unit {
        match self {
            MetricType::ApiCalls => Unit::Count,
            MetricType::StorageGbHours => Unit::GbHours,
            MetricType::BandwidthMb => Unit::Megabytes,
            MetricType::ComputeHours => Unit::Hours,
            _ => Unit::Count,
        }
    }

    /// Aggregation function folding this metric into its window.
    pub fn aggregation(&self) -> AggregationFn {
        match self {
            MetricType::StorageGbPeak | MetricType::ConcurrentUsersMax => AggregationFn::Max,
            _ => AggregationFn::Sum,
        }
    }
}

impl From<String> for MetricType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "api_calls" => MetricType::ApiCalls,
            "storage_gb_hours" => MetricType::StorageGbHours,
            "bandwidth_mb" => MetricType::BandwidthMb,
            "compute_hours" => MetricType::ComputeHours,
            "storage_gb_peak" => MetricType::StorageGbPeak,
            "concurrent_users_max" => MetricType::ConcurrentUsersMax,
            _ => MetricType::Other(value),
        }
    }
}

impl From<&str> for MetricType {
    fn from(value: &str) -> Self {
        MetricType::from(value.to_string())
    }
}

impl From<MetricType> for String {
    fn from(value: MetricType) -> Self {
        value.as_str().to_string()
    }
}

impl core::fmt::Display for MetricType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Billing unit of an aggregated value.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Count,
    GbHours,
    Megabytes,
    Hours,
}

impl Unit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Unit::Count => "count",
            Unit::GbHours => "gb_hours",
            Unit::Megabytes => "megabytes",
            Unit::Hours => "hours",
        }
    }
}

impl core::fmt::Display for Unit {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How events of one metric fold into a window value.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationFn {
    /// Sum of event values (absent value counts as 1).
    Sum,
    /// Running maximum of event values (absent value counts as 0).
    Max,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_metrics_round_trip_their_wire_names() {
        for name in [
            "api_calls",
            "storage_gb_hours",
            "bandwidth_mb",
            "compute_hours",
            "storage_gb_peak",
            "concurrent_users_max",
        ] {
            let metric = MetricType::from(name);
            assert!(!matches!(metric, MetricType::Other(_)), "{name}");
            assert_eq!(metric.as_str(), name);
        }
    }

    #[test]
    fn unit_table_matches_the_closed_set() {
        assert_eq!(MetricType::ApiCalls.unit(), Unit::Count);
        assert_eq!(MetricType::StorageGbHours.unit(), Unit::GbHours);
        assert_eq!(MetricType::BandwidthMb.unit(), Unit::Megabytes);
        assert_eq!(MetricType::ComputeHours.unit(), Unit::Hours);
        // Fall-through default.
        assert_eq!(MetricType::from("gpu_seconds").unit(), Unit::Count);
        assert_eq!(MetricType::StorageGbPeak.unit(), Unit::Count);
    }

    #[test]
    fn max_metrics_are_the_peaks() {
        assert_eq!(MetricType::StorageGbPeak.aggregation(), AggregationFn::Max);
        assert_eq!(
            MetricType::ConcurrentUsersMax.aggregation(),
            AggregationFn::Max
        );
        assert_eq!(MetricType::ApiCalls.aggregation(), AggregationFn::Sum);
        assert_eq!(MetricType::from("gpu_seconds").aggregation(), AggregationFn::Sum);
    }

    #[test]
    fn unknown_metric_serializes_as_its_raw_name() {
        let metric = MetricType::from("gpu_seconds");
        let json = serde_json::to_string(&metric).unwrap();
        assert_eq!(json, r#""gpu_seconds""#);
        let back: MetricType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, metric);
    }
}
