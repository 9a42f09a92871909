use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::client_log::ClientLog;
use crate::models::Interval;

// ═══════════════════════════════════════════════════════════════════
// Sparse utilization lists
// ═══════════════════════════════════════════════════════════════════
//
// A SUL is a per-location ordered array of critical points that compactly
// represents either concurrency (counter mode: +1 at enter, −1 at leave,
// finalized into running counts and cumulative area) or a scalar series
// (rate mode: counter stays 0 and `util` holds the given value, optionally
// accumulated). Histogram queries bin the range and binary-search each bin
// endpoint, so query cost is O(bins · log n) regardless of trace size.

/// One critical point. `primitive` is carried on interval points so the
/// per-primitive duration scan can filter; `enter` is the matching enter
/// timestamp carried on leave points, which is what lets that scan recover
/// each interval's duration without touching the interval arena.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticalPoint {
    pub index: i64,
    pub counter: i64,
    pub util: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primitive: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enter: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SulMode {
    /// Interval concurrency: finalize turns ±1 counters into running counts
    /// and `util` into cumulative area under the counter step function.
    Counter,
    /// Scalar samples (metric rates, duration histograms, block rollups).
    Rate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sul {
    mode: SulMode,
    finalized: bool,
    locations: BTreeMap<String, Vec<CriticalPoint>>,
}

/// Per-bin summary across locations, population formulas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSummary {
    pub min: Vec<f64>,
    pub max: Vec<f64>,
    pub average: Vec<f64>,
    pub std: Vec<f64>,
}

#[derive(Debug, thiserror::Error)]
pub enum SulError {
    #[error("no utilization data for location: {0}")]
    UnknownLocation(String),
    #[error("negative utilization accumulated while scanning primitive {0}")]
    NegativeUtilization(String),
}

impl Sul {
    pub fn new(mode: SulMode) -> Sul {
        Sul {
            mode,
            finalized: false,
            locations: BTreeMap::new(),
        }
    }

    pub fn mode(&self) -> SulMode {
        self.mode
    }

    pub fn locations(&self) -> impl Iterator<Item = &String> {
        self.locations.keys()
    }

    pub fn points(&self, location: &str) -> Option<&[CriticalPoint]> {
        self.locations.get(location).map(Vec::as_slice)
    }

    pub fn add_point(&mut self, location: &str, point: CriticalPoint) {
        self.locations
            .entry(location.to_string())
            .or_default()
            .push(point);
    }

    pub fn iter_locations(&self) -> impl Iterator<Item = (&String, &Vec<CriticalPoint>)> {
        self.locations.iter()
    }

    /// Append deep copies of another location's points (dependency-tree blocks
    /// fold their children's utilization into their own).
    pub fn extend_location(&mut self, location: &str, points: &[CriticalPoint]) {
        self.locations
            .entry(location.to_string())
            .or_default()
            .extend_from_slice(points);
    }

    /// Convenience for interval endpoints: `+1` at enter, `−1` at leave. The
    /// leave point carries the enter timestamp.
    pub fn add_interval(&mut self, location: &str, enter: i64, leave: i64, primitive: Option<&str>) {
        self.add_point(
            location,
            CriticalPoint {
                index: enter,
                counter: 1,
                util: 0.0,
                primitive: primitive.map(str::to_string),
                enter: None,
            },
        );
        self.add_point(
            location,
            CriticalPoint {
                index: leave,
                counter: -1,
                util: 0.0,
                primitive: primitive.map(str::to_string),
                enter: Some(enter),
            },
        );
    }

    /// Sort every location and materialize the derived fields. `all_locations`
    /// guarantees a (possibly empty) entry per known location so queries on
    /// quiet locations return zeros instead of missing data. Idempotent.
    pub fn finalize<I, S>(&mut self, all_locations: I, cumulative: bool)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if self.finalized {
            return;
        }
        self.finalized = true;
        for location in all_locations {
            self.locations.entry(location.as_ref().to_string()).or_default();
        }
        for points in self.locations.values_mut() {
            points.sort_by_key(|p| p.index);
            match self.mode {
                SulMode::Counter => {
                    let mut running = 0i64;
                    let mut prior: Option<(i64, i64, f64)> = None;
                    for point in points.iter_mut() {
                        running += point.counter;
                        point.counter = running;
                        point.util = match prior {
                            None => 0.0,
                            Some((index, counter, util)) => {
                                util + ((point.index - index) * counter) as f64
                            }
                        };
                        prior = Some((point.index, point.counter, point.util));
                    }
                }
                SulMode::Rate => {
                    if cumulative {
                        let mut total = 0.0;
                        for point in points.iter_mut() {
                            total += point.util;
                            point.util = total;
                        }
                    }
                }
            }
        }
    }

    /// The greatest critical point with `index ≤ x`, if any. With duplicate
    /// indexes the last one holds the settled running value.
    fn prior_point<'a>(points: &'a [CriticalPoint], x: i64) -> Option<&'a CriticalPoint> {
        let n = points.partition_point(|p| p.index <= x);
        if n == 0 { None } else { Some(&points[n - 1]) }
    }

    /// Running value of the step function at `x`.
    fn value_at(points: &[CriticalPoint], x: i64) -> (i64, f64) {
        match Self::prior_point(points, x) {
            None => (0, 0.0),
            Some(p) => (p.counter, p.util + ((x - p.index) * p.counter) as f64),
        }
    }

    /// Evenly-spaced bin endpoint timestamps: `bins + 1` values from `begin`
    /// to `end` inclusive.
    fn bin_endpoints(bins: usize, begin: i64, end: i64) -> Vec<i64> {
        let range_per_bin = (end - begin) as f64 / bins as f64;
        let mut endpoints: Vec<i64> = (0..bins)
            .map(|i| begin + (i as f64 * range_per_bin) as i64)
            .collect();
        endpoints.push(end);
        endpoints
    }

    /// Per-bin values for one location over `[begin, end]` split into `bins`
    /// equal segments. Counter mode yields the average concurrency over each
    /// bin (utilization); rate mode yields the series value at each bin's
    /// right endpoint.
    pub fn utilization_for_location(
        &self,
        bins: usize,
        begin: i64,
        end: i64,
        location: &str,
    ) -> Result<Vec<f64>, SulError> {
        let points = self
            .locations
            .get(location)
            .ok_or_else(|| SulError::UnknownLocation(location.to_string()))?;
        let endpoints = Self::bin_endpoints(bins, begin, end);
        let values: Vec<(i64, f64)> = endpoints
            .iter()
            .map(|&ts| {
                let (counter, util) = Self::value_at(points, ts);
                (counter, util)
            })
            .collect();

        let mut out = Vec::with_capacity(bins);
        for i in 1..endpoints.len() {
            match self.mode {
                SulMode::Counter => {
                    let dt = endpoints[i] - endpoints[i - 1];
                    let du = values[i].1 - values[i - 1].1;
                    out.push(if dt == 0 { 0.0 } else { du / dt as f64 });
                }
                SulMode::Rate => out.push(values[i].1),
            }
        }
        Ok(out)
    }

    /// Bin-wise sum of `utilization_for_location` over every location.
    pub fn utilization_histogram(&self, bins: usize, begin: i64, end: i64) -> Vec<f64> {
        let mut totals = vec![0.0; bins];
        for location in self.locations.keys() {
            if let Ok(values) = self.utilization_for_location(bins, begin, end, location) {
                for (total, v) in totals.iter_mut().zip(values) {
                    *total += v;
                }
            }
        }
        totals
    }

    /// Metric-series query: one location's vector, or a per-bin
    /// min/max/average/std summary across all locations.
    pub fn metric_histogram(
        &self,
        bins: usize,
        begin: i64,
        end: i64,
        location: Option<&str>,
    ) -> Result<MetricHistogram, SulError> {
        if let Some(location) = location {
            return Ok(MetricHistogram::Single(
                self.utilization_for_location(bins, begin, end, location)?,
            ));
        }
        let mut summary = MetricSummary {
            min: vec![f64::INFINITY; bins],
            max: vec![f64::NEG_INFINITY; bins],
            average: vec![0.0; bins],
            std: vec![0.0; bins],
        };
        let mut per_location: Vec<Vec<f64>> = Vec::new();
        for location in self.locations.keys() {
            per_location.push(self.utilization_for_location(bins, begin, end, location)?);
        }
        let n = per_location.len();
        if n == 0 {
            return Ok(MetricHistogram::Summary(MetricSummary {
                min: vec![0.0; bins],
                max: vec![0.0; bins],
                average: vec![0.0; bins],
                std: vec![0.0; bins],
            }));
        }
        for i in 0..bins {
            let mut sum = 0.0;
            let mut sum_sq = 0.0;
            for values in &per_location {
                let v = values[i];
                sum += v;
                sum_sq += v * v;
                summary.min[i] = summary.min[i].min(v);
                summary.max[i] = summary.max[i].max(v);
            }
            let mean = sum / n as f64;
            summary.average[i] = mean;
            summary.std[i] = (sum_sq / n as f64 - mean * mean).max(0.0).sqrt();
        }
        Ok(MetricHistogram::Summary(summary))
    }

    /// 2D matrix `[bins][duration_bins + 1]` of busy time for one primitive,
    /// bucketed by time bin and by interval duration. Durations landing
    /// exactly on `duration_end` fall into the overflow column.
    ///
    /// Each location keeps a monotonic cursor, so the whole scan is O(points)
    /// on top of the bin loop.
    pub fn utilization_for_primitive(
        &self,
        bins: usize,
        begin: i64,
        end: i64,
        primitive: &str,
        duration_begin: i64,
        duration_end: i64,
        duration_bins: usize,
    ) -> Result<Vec<Vec<f64>>, SulError> {
        let duration_bin_size = (duration_end - duration_begin) as f64 / duration_bins as f64;
        let endpoints = Self::bin_endpoints(bins, begin, end);
        let mut matrix = vec![vec![0.0; duration_bins + 1]; bins];

        for points in self.locations.values() {
            // Skip straight to the first point inside the window.
            let mut cursor = points.partition_point(|p| p.index < begin);
            for bin in 0..bins {
                let pre = endpoints[bin];
                let cur = endpoints[bin + 1];
                while cursor < points.len() && points[cursor].index <= cur {
                    let point = &points[cursor];
                    cursor += 1;
                    let Some(enter) = point.enter else {
                        continue; // only leave points close out an interval
                    };
                    if point.primitive.as_deref() != Some(primitive) {
                        continue;
                    }
                    let overlap = point.index.min(cur) - enter.max(pre);
                    if overlap < 0 {
                        return Err(SulError::NegativeUtilization(primitive.to_string()));
                    }
                    let duration = point.index - enter;
                    let bucket = if duration_bin_size > 0.0 {
                        (((duration - duration_begin) as f64 / duration_bin_size).floor() as i64)
                            .clamp(0, duration_bins as i64) as usize
                    } else {
                        0
                    };
                    matrix[bin][bucket] += overlap as f64;
                }
            }
        }
        Ok(matrix)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricHistogram {
    Single(Vec<f64>),
    Summary(MetricSummary),
}

// ═══════════════════════════════════════════════════════════════════
// Building the dataset's SUL collection
// ═══════════════════════════════════════════════════════════════════

/// Every SUL derived from one trace: the all-intervals list, one list per
/// primitive, one rate list per PAPI metric, and cumulative per-primitive
/// duration histograms (keyed with an `all_primitives` roll-up).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SulCollection {
    pub intervals: Sul,
    pub primitives: BTreeMap<String, Sul>,
    pub metrics: BTreeMap<String, Sul>,
    pub interval_histograms: BTreeMap<String, Sul>,
}

pub const ALL_PRIMITIVES: &str = "all_primitives";
/// Duration histograms live on a single synthetic location.
pub const HISTOGRAM_LOCATION: &str = "1";

pub struct SulBuildOutput {
    pub suls: SulCollection,
    /// Per-primitive `[minDuration, maxDuration]` including `all_primitives`.
    pub duration_domains: BTreeMap<String, (i64, i64)>,
}

pub async fn build_suls(intervals: &[Interval], log: &ClientLog) -> SulBuildOutput {
    log.log("Building SparseUtilizationList indexes (.=2500 intervals)")
        .await;

    let mut all = SulCollection {
        intervals: Sul::new(SulMode::Counter),
        primitives: BTreeMap::new(),
        metrics: BTreeMap::new(),
        interval_histograms: BTreeMap::new(),
    };
    let mut all_locations: Vec<String> = Vec::new();
    // Last sample per (metric, location) for rate computation.
    let mut pre_metric: BTreeMap<(String, String), (i64, f64)> = BTreeMap::new();
    // Duration → count, per primitive.
    let mut duration_counts: BTreeMap<String, BTreeMap<i64, u64>> = BTreeMap::new();

    let mut count = 0u64;
    for interval in intervals {
        let location = interval.location.as_str();
        if !all_locations.iter().any(|l| l == location) {
            all_locations.push(location.to_string());
        }
        let primitive = interval.primitive.as_str();
        let enter = interval.enter.timestamp;
        let leave = interval.leave.timestamp;

        all.intervals
            .add_interval(location, enter, leave, Some(primitive));
        all.primitives
            .entry(primitive.to_string())
            .or_insert_with(|| Sul::new(SulMode::Counter))
            .add_interval(location, enter, leave, Some(primitive));

        for (ts, metrics) in [
            (enter, &interval.enter.metrics),
            (leave, &interval.leave.metrics),
        ] {
            for (name, &value) in metrics {
                let key = (name.clone(), location.to_string());
                let (pre_ts, pre_value) = pre_metric.get(&key).copied().unwrap_or((0, 0.0));
                if ts != pre_ts {
                    let rate = (value - pre_value) / (ts - pre_ts) as f64;
                    all.metrics
                        .entry(name.clone())
                        .or_insert_with(|| Sul::new(SulMode::Rate))
                        .add_point(
                            location,
                            CriticalPoint {
                                index: ts,
                                counter: 0,
                                util: rate,
                                primitive: None,
                                enter: None,
                            },
                        );
                }
                pre_metric.insert(key, (ts, value));
            }
        }

        let duration = leave - enter;
        *duration_counts
            .entry(primitive.to_string())
            .or_default()
            .entry(duration)
            .or_insert(0) += 1;
        *duration_counts
            .entry(ALL_PRIMITIVES.to_string())
            .or_default()
            .entry(duration)
            .or_insert(0) += 1;

        count += 1;
        log.progress(count, "intervals").await;
        if count % 2_500 == 0 {
            tokio::task::yield_now().await;
        }
    }

    log.log(format!("Finished indexing {count} intervals")).await;

    log.log("Finalizing indexes").await;
    all.intervals.finalize(all_locations.iter(), false);
    for sul in all.primitives.values_mut() {
        sul.finalize(all_locations.iter(), false);
    }
    for sul in all.metrics.values_mut() {
        sul.finalize(all_locations.iter(), false);
    }

    let mut duration_domains = BTreeMap::new();
    for (primitive, counts) in duration_counts {
        let mut sul = Sul::new(SulMode::Rate);
        for (&duration, &n) in &counts {
            sul.add_point(
                HISTOGRAM_LOCATION,
                CriticalPoint {
                    index: duration,
                    counter: 0,
                    util: n as f64,
                    primitive: None,
                    enter: None,
                },
            );
        }
        sul.finalize([HISTOGRAM_LOCATION], true);
        let lo = *counts.keys().next().unwrap();
        let hi = *counts.keys().next_back().unwrap();
        duration_domains.insert(primitive.clone(), (lo, hi));
        all.interval_histograms.insert(primitive, sul);
    }

    SulBuildOutput {
        suls: all,
        duration_domains,
    }
}

// ═══════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_approx(actual: f64, expected: f64, epsilon: f64) {
        assert!(
            (actual - expected).abs() < epsilon,
            "expected {expected}, got {actual} (diff: {})",
            (actual - expected).abs()
        );
    }

    fn counter_sul(entries: &[(&str, i64, i64)]) -> Sul {
        let mut sul = Sul::new(SulMode::Counter);
        let mut locations: Vec<String> = Vec::new();
        for &(loc, enter, leave) in entries {
            sul.add_interval(loc, enter, leave, Some("p"));
            if !locations.iter().any(|l| l == loc) {
                locations.push(loc.to_string());
            }
        }
        sul.finalize(locations, false);
        sul
    }

    #[test]
    fn finalize_computes_running_counts_and_area() {
        // Two overlapping intervals on one location.
        let sul = counter_sul(&[("1", 100, 200), ("1", 150, 300)]);
        let points = sul.points("1").unwrap();
        let counters: Vec<i64> = points.iter().map(|p| p.counter).collect();
        assert_eq!(counters, vec![1, 2, 1, 0]);
        let utils: Vec<f64> = points.iter().map(|p| p.util).collect();
        assert_eq!(utils, vec![0.0, 50.0, 150.0, 250.0]);
        // Invariant: util deltas equal (index delta) * prior counter.
        for i in 1..points.len() {
            assert_approx(
                points[i].util - points[i - 1].util,
                ((points[i].index - points[i - 1].index) * points[i - 1].counter) as f64,
                1e-9,
            );
        }
        // Concurrency returns to zero over the full domain.
        assert_eq!(points.last().unwrap().counter, 0);
    }

    #[test]
    fn single_bin_histogram_is_busy_fraction() {
        let sul = counter_sul(&[("1", 100, 200), ("2", 100, 300)]);
        let values = sul.utilization_for_location(1, 100, 300, "1").unwrap();
        assert_approx(values[0], 0.5, 1e-9);
        let values = sul.utilization_for_location(1, 100, 300, "2").unwrap();
        assert_approx(values[0], 1.0, 1e-9);
        // Summed over locations: total busy time / total time.
        let totals = sul.utilization_histogram(1, 100, 300);
        assert_approx(totals[0], (100.0 + 200.0) / 200.0, 1e-9);
    }

    #[test]
    fn average_concurrency_per_bin() {
        let sul = counter_sul(&[("1", 100, 300), ("1", 150, 200)]);
        // counter pattern 100:+1, 150:+1, 200:-1, 300:-1 → concurrency is 1
        // on [100,150), 2 on [150,200), 1 on [200,300).
        let values = sul.utilization_for_location(2, 100, 300, "1").unwrap();
        assert_approx(values[0], 1.5, 1e-9);
        assert_approx(values[1], 1.0, 1e-9);
    }

    #[test]
    fn unknown_location_is_an_error_but_finalized_quiet_location_is_zero() {
        let mut sul = Sul::new(SulMode::Counter);
        sul.add_interval("1", 100, 200, None);
        sul.finalize(["1", "2"], false);
        assert!(sul.utilization_for_location(2, 0, 400, "3").is_err());
        let values = sul.utilization_for_location(2, 0, 400, "2").unwrap();
        assert_eq!(values, vec![0.0, 0.0]);
    }

    #[test]
    fn rate_mode_returns_value_at_bin_endpoint() {
        let mut sul = Sul::new(SulMode::Rate);
        for (ts, rate) in [(10, 1.0), (20, 2.0)] {
            sul.add_point(
                "1",
                CriticalPoint {
                    index: ts,
                    counter: 0,
                    util: rate,
                    primitive: None,
                    enter: None,
                },
            );
        }
        sul.finalize(["1"], false);
        let values = sul.utilization_for_location(2, 0, 20, "1").unwrap();
        assert_approx(values[0], 1.0, 1e-9);
        assert_approx(values[1], 2.0, 1e-9);
    }

    #[test]
    fn cumulative_rate_mode_accumulates() {
        let mut sul = Sul::new(SulMode::Rate);
        for (duration, n) in [(10, 3.0), (40, 1.0)] {
            sul.add_point(
                "1",
                CriticalPoint {
                    index: duration,
                    counter: 0,
                    util: n,
                    primitive: None,
                    enter: None,
                },
            );
        }
        sul.finalize(["1"], true);
        let values = sul.utilization_for_location(2, 0, 40, "1").unwrap();
        assert_approx(values[0], 3.0, 1e-9); // durations ≤ 20
        assert_approx(values[1], 4.0, 1e-9); // durations ≤ 40
    }

    #[test]
    fn metric_summary_population_std() {
        // Two locations with rates [1.0, 2.0] and [0.5, 1.0].
        let mut sul = Sul::new(SulMode::Rate);
        for (loc, ts, rate) in [
            ("1", 10, 1.0),
            ("1", 20, 2.0),
            ("2", 10, 0.5),
            ("2", 20, 1.0),
        ] {
            sul.add_point(
                loc,
                CriticalPoint {
                    index: ts,
                    counter: 0,
                    util: rate,
                    primitive: None,
                    enter: None,
                },
            );
        }
        sul.finalize(["1", "2"], false);
        match sul.metric_histogram(2, 0, 20, None).unwrap() {
            MetricHistogram::Summary(s) => {
                assert_eq!(s.min, vec![0.5, 1.0]);
                assert_eq!(s.max, vec![1.0, 2.0]);
                assert_eq!(s.average, vec![0.75, 1.5]);
                assert_approx(s.std[0], 0.25, 1e-9);
                assert_approx(s.std[1], 0.5, 1e-9);
            }
            MetricHistogram::Single(_) => panic!("expected a summary"),
        }
        match sul.metric_histogram(2, 0, 20, Some("2")).unwrap() {
            MetricHistogram::Single(v) => assert_eq!(v, vec![0.5, 1.0]),
            MetricHistogram::Summary(_) => panic!("expected a single vector"),
        }
    }

    #[test]
    fn primitive_duration_matrix_buckets_and_total() {
        // Two invocations of Q with durations 10 and 40.
        let mut sul = Sul::new(SulMode::Counter);
        sul.add_interval("1", 0, 10, Some("Q"));
        sul.add_interval("1", 100, 140, Some("Q"));
        sul.add_interval("1", 50, 60, Some("other"));
        sul.finalize(["1"], false);

        let matrix = sul
            .utilization_for_primitive(4, 0, 200, "Q", 10, 40, 4)
            .unwrap();
        let total: f64 = matrix.iter().flatten().sum();
        assert_approx(total, 50.0, 1e-9);

        let mut bucket_totals = vec![0.0; 5];
        for row in &matrix {
            for (b, v) in row.iter().enumerate() {
                bucket_totals[b] += v;
            }
        }
        // duration 10 → bucket 0; duration 40 sits on the domain edge and
        // lands in the overflow column.
        assert_approx(bucket_totals[0], 10.0, 1e-9);
        assert_approx(bucket_totals[4], 40.0, 1e-9);
        assert_approx(bucket_totals[1] + bucket_totals[2] + bucket_totals[3], 0.0, 1e-9);
    }

    #[test]
    fn primitive_matrix_clips_overlap_to_the_bin_holding_the_leave() {
        let mut sul = Sul::new(SulMode::Counter);
        sul.add_interval("1", 0, 100, Some("Q"));
        sul.finalize(["1"], false);
        let matrix = sul
            .utilization_for_primitive(4, 0, 200, "Q", 0, 100, 2)
            .unwrap();
        let row_totals: Vec<f64> = matrix.iter().map(|r| r.iter().sum()).collect();
        // Each leave point is scanned once, in the bin that contains it, and
        // its contribution is clipped to that bin: [50, 100] of the interval.
        assert_approx(row_totals[0], 0.0, 1e-9);
        assert_approx(row_totals[1], 50.0, 1e-9);
        assert_approx(row_totals[2], 0.0, 1e-9);
        assert_approx(row_totals[3], 0.0, 1e-9);
    }
}
