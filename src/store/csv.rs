use regex::Regex;

use crate::client_log::ClientLog;

use super::primitives::process_primitive;
use super::{Dataset, StoreError};

// ── Performance table ingest ──
//
// Per-primitive aggregates arrive as a CSV block:
//   primitive_instance,display_name,count,time,eval_direct
//   "multiply$0$21$4","multiply",12,34567,1
// The first line that doesn't match the row shape ends the block.

pub fn csv_mode_line(line: &str) -> bool {
    line.starts_with("primitive_instance,display_name,count,time,eval_direct")
}

pub fn row_pattern() -> Regex {
    Regex::new(r#""([^"]*)","([^"]*)",(\d+),(\d+),(-?1)"#).unwrap()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CsvCounts {
    pub new_primitives: u64,
    pub seen_primitives: u64,
    pub max_time: f64,
}

/// Apply one performance row to its primitive. Returns false when the line
/// isn't a row.
pub fn process_csv_line(
    dataset: &mut Dataset,
    row_pattern: &Regex,
    line: &str,
    debug: bool,
    counts: &mut CsvCounts,
) -> bool {
    let Some(row) = row_pattern.captures(line) else {
        return false;
    };
    let (primitive, is_new) =
        process_primitive(&mut dataset.primitives, &row[1], Some("csv"), debug);
    if is_new {
        counts.new_primitives += 1;
    } else {
        counts.seen_primitives += 1;
    }
    let count: u64 = row[3].parse().unwrap_or(0);
    let time: f64 = row[4].parse().unwrap_or(0.0);
    primitive.display_name = Some(row[2].to_string());
    primitive.count = Some(count);
    primitive.time = Some(time);
    primitive.eval_direct = row[5].parse().ok();
    primitive.avg_time = Some(if count != 0 { time / count as f64 } else { time });
    counts.max_time = counts.max_time.max(time);
    true
}

pub async fn process_csv<'a>(
    dataset: &mut Dataset,
    mut lines: impl Iterator<Item = &'a str>,
    debug: bool,
    log: &ClientLog,
) -> Result<CsvCounts, StoreError> {
    match lines.next() {
        Some(header) if csv_mode_line(header) => {}
        _ => {
            return Err(StoreError::Malformed(
                "csv input does not start with the performance header".to_string(),
            ));
        }
    }
    let pattern = row_pattern();
    let mut counts = CsvCounts::default();
    for line in lines {
        if !process_csv_line(dataset, &pattern, line, debug, &mut counts) {
            break;
        }
    }
    log.log("Finished parsing performance CSV").await;
    log.log(format!(
        "New primitives: {}, Observed existing primitives: {}",
        counts.new_primitives, counts.seen_primitives
    ))
    .await;
    log.log(format!(
        "Max inclusive time seen in performance CSV (ns): {}",
        counts.max_time
    ))
    .await;
    Ok(counts)
}
