use regex::Regex;

use crate::client_log::ClientLog;

use super::{Dataset, StoreError, csv, dot, newick};

// ── Combined log ingest ──
//
// A run's stdout bundles several artifacts: a newick tree (flagged by a
// marker line, or unflagged but recognizable by its leading parens), a DOT
// call graph, a performance CSV block, and an inclusive-time line in seconds.
// The scanner switches mode on each marker and delegates lines to the
// corresponding parser until the block ends.

enum Mode {
    Scan,
    Tree,
    Dot,
    Perf,
}

pub async fn process_log<'a>(
    dataset: &mut Dataset,
    lines: impl Iterator<Item = &'a str>,
    debug: bool,
    log: &ClientLog,
) -> Result<(), StoreError> {
    let tree_marker = Regex::new(r"Tree information for function:").unwrap();
    // A line starting with at least five parens is assumed to be a tree.
    let unflagged_tree = Regex::new(r"\(\(\(\(\(.*;").unwrap();
    let time_marker = Regex::new(r"time: ([\d\.]+)").unwrap();
    let edge_pattern = dot::edge_pattern();
    let row_pattern = csv::row_pattern();

    let mut mode = Mode::Scan;
    let mut dot_counts = dot::DotCounts::default();
    let mut csv_counts = csv::CsvCounts::default();

    for line in lines {
        match mode {
            Mode::Scan => {
                if tree_marker.is_match(line) {
                    log.log("Parsing tree...").await;
                    mode = Mode::Tree;
                } else if unflagged_tree.is_match(line) {
                    log.log("Parsing unflagged line that looks like a newick tree...")
                        .await;
                    newick::process_newick_tree(dataset, line, debug, log).await?;
                } else if dot::dot_mode_line(line) {
                    log.log("Parsing graph...").await;
                    mode = Mode::Dot;
                    dot_counts = dot::DotCounts::default();
                } else if csv::csv_mode_line(line) {
                    log.log("Parsing performance csv...").await;
                    mode = Mode::Perf;
                    csv_counts = csv::CsvCounts::default();
                } else if let Some(m) = time_marker.captures(line) {
                    let seconds: f64 = m[1].parse().unwrap_or(0.0);
                    log.log(format!(
                        "Total inclusive time from log (converted to ns): {}",
                        seconds * 1e9
                    ))
                    .await;
                }
            }
            Mode::Tree => {
                newick::process_newick_tree(dataset, line, debug, log).await?;
                mode = Mode::Scan;
            }
            Mode::Dot => {
                if !dot::process_dot_line(dataset, &edge_pattern, line, debug, &mut dot_counts) {
                    mode = Mode::Scan;
                    log.log("Finished parsing DOT graph").await;
                    log.log(format!(
                        "New primitives: {}, References to existing primitives: {}",
                        dot_counts.new_primitives, dot_counts.seen_primitives
                    ))
                    .await;
                    log.log(format!(
                        "New links: {}, Observed existing links: {}",
                        dot_counts.new_links, dot_counts.seen_links
                    ))
                    .await;
                }
            }
            Mode::Perf => {
                if !csv::process_csv_line(dataset, &row_pattern, line, debug, &mut csv_counts) {
                    mode = Mode::Scan;
                    log.log("Finished parsing performance CSV").await;
                    log.log(format!(
                        "New primitives: {}, Observed existing primitives: {}",
                        csv_counts.new_primitives, csv_counts.seen_primitives
                    ))
                    .await;
                    log.log(format!(
                        "Max inclusive time seen in performance CSV (ns): {}",
                        csv_counts.max_time
                    ))
                    .await;
                }
            }
        }
    }
    Ok(())
}
