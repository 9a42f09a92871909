use regex::Regex;

use crate::client_log::ClientLog;

use super::primitives::{add_primitive_child, process_primitive};
use super::{Dataset, StoreError};

// ── DOT graph ingest ──
//
// Call graphs arrive as undirected DOT dumps:
//   graph "model" {
//   "parent" -- "child";
//   ...
// The first line that is not an edge ends the graph.

pub fn dot_mode_line(line: &str) -> bool {
    Regex::new(r#"graph "[^"]*" \{"#).unwrap().is_match(line)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DotCounts {
    pub new_primitives: u64,
    pub seen_primitives: u64,
    pub new_links: u64,
    pub seen_links: u64,
}

/// Register one `"a" -- "b";` edge line. Returns `None` on the first line
/// that isn't an edge.
pub fn process_dot_line(
    dataset: &mut Dataset,
    edge_pattern: &Regex,
    line: &str,
    debug: bool,
    counts: &mut DotCounts,
) -> bool {
    let Some(edge) = edge_pattern.captures(line) else {
        return false;
    };
    for name in [&edge[1], &edge[2]] {
        let (_, is_new) = process_primitive(&mut dataset.primitives, name, Some("dot"), debug);
        if is_new {
            counts.new_primitives += 1;
        } else {
            counts.seen_primitives += 1;
        }
    }
    let new_link = add_primitive_child(
        &mut dataset.primitives,
        &mut dataset.primitive_links,
        &edge[1],
        &edge[2],
        Some("dot"),
        debug,
    );
    if new_link {
        counts.new_links += 1;
    } else {
        counts.seen_links += 1;
    }
    true
}

pub fn edge_pattern() -> Regex {
    Regex::new(r#""([^"]*)" -- "([^"]*)";"#).unwrap()
}

pub async fn process_dot<'a>(
    dataset: &mut Dataset,
    mut lines: impl Iterator<Item = &'a str>,
    debug: bool,
    log: &ClientLog,
) -> Result<DotCounts, StoreError> {
    match lines.next() {
        Some(header) if dot_mode_line(header) => {}
        _ => {
            return Err(StoreError::Malformed(
                "dot input does not start with a graph header".to_string(),
            ));
        }
    }
    let edge = edge_pattern();
    let mut counts = DotCounts::default();
    for line in lines {
        if !process_dot_line(dataset, &edge, line, debug, &mut counts) {
            break;
        }
    }
    log.log("Finished parsing DOT graph").await;
    log.log(format!(
        "New primitives: {}, References to existing primitives: {}",
        counts.new_primitives, counts.seen_primitives
    ))
    .await;
    log.log(format!(
        "New links: {}, Observed existing links: {}",
        counts.new_links, counts.seen_links
    ))
    .await;
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_edges_until_non_edge_line() {
        let mut dataset = Dataset::new("x".to_string());
        let text = "graph \"model\" {\n\"a\" -- \"b\";\n\"a\" -- \"c\";\n}\n";
        let counts = process_dot(&mut dataset, text.lines(), false, &ClientLog::console())
            .await
            .unwrap();
        assert_eq!(counts.new_primitives, 3);
        assert_eq!(counts.seen_primitives, 1); // "a" appears twice
        assert_eq!(counts.new_links, 2);
        assert_eq!(
            dataset.primitives.get("a").unwrap().children,
            vec!["b".to_string(), "c".to_string()]
        );
    }

    #[tokio::test]
    async fn missing_header_is_malformed() {
        let mut dataset = Dataset::new("x".to_string());
        let result = process_dot(
            &mut dataset,
            "\"a\" -- \"b\";".lines(),
            false,
            &ClientLog::console(),
        )
        .await;
        assert!(result.is_err());
    }
}
