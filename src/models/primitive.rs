use serde::{Deserialize, Serialize};

/// A static call site. Many intervals share one primitive; the name may encode
/// a source position as trailing `$…$line$char` segments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Primitive {
    /// Display name: the part of the key before the first `$`.
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<i64>,
    #[serde(rename = "char", skip_serializing_if = "Option::is_none")]
    pub char_pos: Option<i64>,
    pub parents: Vec<String>,
    pub children: Vec<String>,
    /// Aggregates populated from the performance table.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_direct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_time: Option<f64>,
    /// Debug mode only: which source kinds mentioned this primitive.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<String>>,
    /// Debug mode only: how many trace events referenced this primitive.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_count: Option<u64>,
}

impl Primitive {
    /// Build a fresh record from its key, deriving line/char from trailing
    /// `$`-separated chunks when there are at least three.
    pub fn from_key(key: &str) -> Primitive {
        let chunks: Vec<&str> = key.split('$').collect();
        let mut primitive = Primitive {
            name: chunks[0].to_string(),
            ..Primitive::default()
        };
        if chunks.len() >= 3 {
            primitive.line = chunks[chunks.len() - 2].parse().ok();
            primitive.char_pos = chunks[chunks.len() - 1].parse().ok();
        }
        primitive
    }
}

/// A parent→child edge in the primitive graph, keyed `parent_child`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimitiveLink {
    pub parent: String,
    pub child: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_key_parses_position_segments() {
        let p = Primitive::from_key("multiply$0$21$4");
        assert_eq!(p.name, "multiply");
        assert_eq!(p.line, Some(21));
        assert_eq!(p.char_pos, Some(4));
    }

    #[test]
    fn from_key_without_segments() {
        let p = Primitive::from_key("run_helper");
        assert_eq!(p.name, "run_helper");
        assert_eq!(p.line, None);
        assert_eq!(p.char_pos, None);
    }

    #[test]
    fn from_key_with_two_segments_has_no_position() {
        let p = Primitive::from_key("apply$3");
        assert_eq!(p.name, "apply");
        assert_eq!(p.line, None);
    }
}
