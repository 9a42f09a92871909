use std::cmp::Ordering;
use std::collections::BTreeMap;

use regex::Regex;

use crate::models::{AttrValue, MetricPoint};

// ── Event stream grammar ──
//
// Three line shapes are recognized:
//   ENTER|LEAVE <loc> <ts> Region: "<name>"
//       ADDITIONAL ATTRIBUTES: ("k" <n>; TYPE; v), ("k" <n>; TYPE; v), ...
//   METRIC <loc> <ts> Metric: ... Values?: ("name" <n>; TYPE; value)
// Anything else that does not continue a current event is counted as
// unsupported and dropped.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Enter,
    Leave,
}

/// One ENTER or LEAVE occurrence, with whatever attributes its lines carried.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub location: String,
    pub timestamp: i64,
    pub attrs: BTreeMap<String, AttrValue>,
    pub metrics: BTreeMap<String, f64>,
}

/// Ingest counters reported to the client log after parsing.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseStats {
    pub events: u64,
    pub included_metrics: u64,
    pub skipped_metrics_missing_prior: u64,
    pub skipped_metrics_mismatch: u64,
    pub unsupported_skipped_lines: u64,
    pub bad_attr_lines: u64,
}

/// Streaming line parser for event dumps. Feed lines one at a time; each call
/// may complete the previous event (a completed event is only known once the
/// next event line arrives, because attribute and metric continuation lines
/// belong to the event above them).
pub struct EventParser {
    event_line: Regex,
    region_attr: Regex,
    add_attr_line: Regex,
    add_attr_splitter: Regex,
    add_attr: Regex,
    metric_line: Regex,
    number_runs: Regex,

    current: Option<Event>,
    pub stats: ParseStats,
    /// Non-PAPI samples, per metric name, keyed by timestamp.
    pub proc_metrics: BTreeMap<String, BTreeMap<i64, MetricPoint>>,
    /// Every metric name seen (PAPI and otherwise), in first-seen order.
    pub metric_names: Vec<String>,
}

impl EventParser {
    pub fn new() -> EventParser {
        EventParser {
            event_line: Regex::new(r#"^((?:ENTER)|(?:LEAVE))\s+(\S+)\s+(\d+)\s+(.*)$"#).unwrap(),
            region_attr: Regex::new(r#"(Region): "([^"]*)""#).unwrap(),
            add_attr_line: Regex::new(r#"^\s+ADDITIONAL ATTRIBUTES: (.*)$"#).unwrap(),
            add_attr_splitter: Regex::new(r#"\), \("#).unwrap(),
            add_attr: Regex::new(r#"\(?"([^"]*)" <\d+>; [^;]*; ([^\)]*)"#).unwrap(),
            metric_line: Regex::new(
                r#"^METRIC\s+(\S+)\s+(\d+)\s+Metric:[\s\d,]+Values?: \("([^"]*)" <\d+>; [^;]*; ([^\)]*)"#,
            )
            .unwrap(),
            number_runs: Regex::new(r#"[0-9.]+"#).unwrap(),
            current: None,
            stats: ParseStats::default(),
            proc_metrics: BTreeMap::new(),
            metric_names: Vec::new(),
        }
    }

    /// Feed one input line. Returns the previous event when this line starts a
    /// new one; the caller routes completed events into per-location lists.
    pub fn feed_line(&mut self, line: &str) -> Option<Event> {
        let event_match = self.event_line.captures(line);
        let metric_match = self.metric_line.captures(line);
        if self.current.is_none() && event_match.is_none() && metric_match.is_none() {
            // Blank / header line before the first event.
            return None;
        }

        if let Some(m) = metric_match {
            self.handle_metric_line(&m);
            return None;
        }

        if let Some(m) = event_match {
            let finished = self.current.take();
            let kind = if &m[1] == "ENTER" {
                EventKind::Enter
            } else {
                EventKind::Leave
            };
            let mut attrs = BTreeMap::new();
            for attr in self.region_attr.captures_iter(&m[4]) {
                // `::eval` wrappers collapse onto the underlying call site.
                let primitive = attr[2].replace("::eval", "");
                attrs.insert("Primitive".to_string(), AttrValue::Str(primitive));
            }
            self.current = Some(Event {
                kind,
                location: m[2].to_string(),
                timestamp: m[3].parse().unwrap_or(0),
                attrs,
                metrics: BTreeMap::new(),
            });
            if finished.is_some() {
                self.stats.events += 1;
            }
            return finished;
        }

        if self.current.is_some() {
            if let Some(m) = self.add_attr_line.captures(line) {
                let payload = m[1].to_string();
                for fragment in self.add_attr_splitter.split(&payload) {
                    match self.add_attr.captures(fragment) {
                        Some(attr) => {
                            let value = AttrValue::parse(&attr[2]);
                            if let Some(event) = self.current.as_mut() {
                                event.attrs.insert(attr[1].to_string(), value);
                            }
                        }
                        None => {
                            self.stats.bad_attr_lines += 1;
                            tracing::warn!(
                                "omitting data from bad ADDITIONAL ATTRIBUTES line: {line}"
                            );
                        }
                    }
                }
                return None;
            }
        }

        // A line shape we are not capturing (MPI_SEND and friends).
        self.stats.unsupported_skipped_lines += 1;
        None
    }

    /// Flush the trailing event once input is exhausted.
    pub fn finish(&mut self) -> Option<Event> {
        let finished = self.current.take();
        if finished.is_some() {
            self.stats.events += 1;
        }
        finished
    }

    fn handle_metric_line(&mut self, m: &regex::Captures<'_>) {
        let location = &m[1];
        let timestamp: i64 = m[2].parse().unwrap_or(0);
        let metric_type = m[3].to_string();
        // Usually the value field is a bare number, but shapes like
        // `DOUBLE <2>; 1234.0000` appear; take the last numeric run.
        let value: f64 = self
            .number_runs
            .find_iter(&m[4])
            .last()
            .and_then(|n| n.as_str().parse().ok())
            .unwrap_or(0.0);

        if metric_type.starts_with("PAPI") {
            match self.current.as_mut() {
                None => self.stats.skipped_metrics_missing_prior += 1,
                Some(event) if event.timestamp != timestamp || event.location != location => {
                    self.stats.skipped_metrics_mismatch += 1;
                }
                Some(event) => {
                    event.metrics.insert(metric_type.clone(), value);
                    self.stats.included_metrics += 1;
                }
            }
            if !self.metric_names.contains(&metric_type) {
                self.metric_names.push(metric_type);
            }
        } else {
            if !self.metric_names.contains(&metric_type) {
                self.metric_names.push(metric_type.clone());
            }
            self.proc_metrics
                .entry(metric_type)
                .or_default()
                .insert(timestamp, MetricPoint { timestamp, value });
        }
    }
}

// ── Location ordering ──

/// Human-friendly ordering for location names: digit runs compare numerically,
/// everything else case-insensitively.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = segments(a).into_iter();
    let mut right = segments(b).into_iter();
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (&x, &y) {
                    (Segment::Number(n), Segment::Number(m)) => n.cmp(m),
                    (Segment::Number(_), Segment::Text(_)) => Ordering::Less,
                    (Segment::Text(_), Segment::Number(_)) => Ordering::Greater,
                    (Segment::Text(s), Segment::Text(t)) => {
                        s.to_lowercase().cmp(&t.to_lowercase())
                    }
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Segment {
    Number(u128),
    Text(String),
}

fn segments(s: &str) -> Vec<Segment> {
    let mut out = Vec::new();
    let mut buf = String::new();
    let mut digits = false;
    for c in s.chars() {
        if c.is_ascii_digit() != digits && !buf.is_empty() {
            out.push(flush(&mut buf, digits));
        }
        digits = c.is_ascii_digit();
        buf.push(c);
    }
    if !buf.is_empty() {
        out.push(flush(&mut buf, digits));
    }
    out
}

fn flush(buf: &mut String, digits: bool) -> Segment {
    let s = std::mem::take(buf);
    if digits {
        Segment::Number(s.parse().unwrap_or(u128::MAX))
    } else {
        Segment::Text(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(lines: &[&str]) -> (Vec<Event>, EventParser) {
        let mut parser = EventParser::new();
        let mut events = Vec::new();
        for line in lines {
            if let Some(event) = parser.feed_line(line) {
                events.push(event);
            }
        }
        if let Some(event) = parser.finish() {
            events.push(event);
        }
        (events, parser)
    }

    #[test]
    fn parses_enter_leave_pairs() {
        let (events, parser) = parse_all(&[
            "ENTER 1 100 Region: \"A\"",
            "LEAVE 1 300 Region: \"A\"",
        ]);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::Enter);
        assert_eq!(events[0].location, "1");
        assert_eq!(events[0].timestamp, 100);
        assert_eq!(
            events[0].attrs.get("Primitive"),
            Some(&AttrValue::Str("A".to_string()))
        );
        assert_eq!(events[1].kind, EventKind::Leave);
        assert_eq!(parser.stats.events, 2);
    }

    #[test]
    fn strips_eval_suffix_from_region() {
        let (events, _) = parse_all(&[
            "ENTER 1 100 Region: \"multiply$0$21$4::eval\"",
            "LEAVE 1 200 Region: \"multiply$0$21$4::eval\"",
        ]);
        assert_eq!(
            events[0].attrs.get("Primitive"),
            Some(&AttrValue::Str("multiply$0$21$4".to_string()))
        );
    }

    #[test]
    fn additional_attributes_attach_to_current_event() {
        let (events, parser) = parse_all(&[
            "ENTER 1 100 Region: \"A\"",
            "  ADDITIONAL ATTRIBUTES: (\"GUID\" <0>; UINT64; 7), (\"Parent GUID\" <0>; UINT64; 0)",
            "LEAVE 1 200 Region: \"A\"",
        ]);
        assert_eq!(events[0].attrs.get("GUID"), Some(&AttrValue::Int(7)));
        assert_eq!(events[0].attrs.get("Parent GUID"), Some(&AttrValue::Int(0)));
        assert_eq!(parser.stats.bad_attr_lines, 0);
    }

    #[test]
    fn malformed_attribute_fragment_is_counted_and_dropped() {
        let (events, parser) = parse_all(&[
            "ENTER 1 100 Region: \"A\"",
            "  ADDITIONAL ATTRIBUTES: (garbage without quotes), (\"ok\" <1>; INT; 5)",
            "LEAVE 1 200 Region: \"A\"",
        ]);
        assert_eq!(parser.stats.bad_attr_lines, 1);
        assert_eq!(events[0].attrs.get("ok"), Some(&AttrValue::Int(5)));
    }

    #[test]
    fn papi_metric_attaches_on_exact_match_only() {
        let (events, parser) = parse_all(&[
            "ENTER 1 100 Region: \"A\"",
            "METRIC 1 100 Metric: 0, 1 Values: (\"PAPI_TOT_INS\" <0>; UINT64; 4200)",
            "METRIC 1 150 Metric: 0, 1 Values: (\"PAPI_TOT_INS\" <0>; UINT64; 9999)",
            "METRIC 2 100 Metric: 0, 1 Values: (\"PAPI_TOT_INS\" <0>; UINT64; 1111)",
            "LEAVE 1 200 Region: \"A\"",
        ]);
        assert_eq!(events[0].metrics.get("PAPI_TOT_INS"), Some(&4200.0));
        assert_eq!(parser.stats.included_metrics, 1);
        assert_eq!(parser.stats.skipped_metrics_mismatch, 2);
        assert_eq!(parser.metric_names, vec!["PAPI_TOT_INS".to_string()]);
    }

    #[test]
    fn non_papi_metrics_go_to_proc_metrics() {
        let (_, parser) = parse_all(&[
            "METRIC 1 100 Metric: 0, 1 Values: (\"meminfo:MemFree\" <0>; UINT64; 12345)",
            "METRIC 1 200 Metric: 0, 1 Values: (\"meminfo:MemFree\" <0>; UINT64; 12000)",
        ]);
        let samples = parser.proc_metrics.get("meminfo:MemFree").unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples.get(&200).unwrap().value, 12000.0);
    }

    #[test]
    fn metric_value_takes_last_numeric_run() {
        let (_, parser) = parse_all(&[
            "METRIC 1 100 Metric: 0, 1 Values: (\"status:threads\" <2>; DOUBLE <2>; 1234.0000",
        ]);
        let samples = parser.proc_metrics.get("status:threads").unwrap();
        assert_eq!(samples.get(&100).unwrap().value, 1234.0);
    }

    #[test]
    fn unsupported_lines_are_counted() {
        let (events, parser) = parse_all(&[
            "ENTER 1 100 Region: \"A\"",
            "MPI_SEND 1 150 some payload",
            "LEAVE 1 200 Region: \"A\"",
        ]);
        assert_eq!(events.len(), 2);
        assert_eq!(parser.stats.unsupported_skipped_lines, 1);
    }

    #[test]
    fn natural_order_compares_digit_runs_numerically() {
        let mut names = vec![
            "thread 10".to_string(),
            "thread 2".to_string(),
            "thread 1".to_string(),
            "rank 0".to_string(),
        ];
        names.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(names, vec!["rank 0", "thread 1", "thread 2", "thread 10"]);
    }
}
