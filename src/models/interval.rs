use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::value::AttrValue;

/// One side (ENTER or LEAVE) of an interval: the timestamp, any PAPI metric
/// samples attached to that event, and the attributes that were not lifted to
/// the interval root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntervalSide {
    #[serde(rename = "Timestamp")]
    pub timestamp: i64,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(flatten)]
    pub attrs: BTreeMap<String, AttrValue>,
}

/// One dynamic invocation on one location, produced by pairing an ENTER with a
/// LEAVE. Interval ids are dense indexes into the dataset's interval arena and
/// serialize as decimal strings; `parent`/`children` are ids as well, so the
/// causal relation is a forest of indexes rather than object references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interval {
    #[serde(rename = "intervalId", with = "id_str")]
    pub id: usize,
    #[serde(rename = "Location")]
    pub location: String,
    #[serde(rename = "Primitive")]
    pub primitive: String,
    pub enter: IntervalSide,
    pub leave: IntervalSide,
    #[serde(default, with = "opt_id_str")]
    pub parent: Option<usize>,
    #[serde(default, with = "id_vec_str")]
    pub children: Vec<usize>,
    /// Attributes whose values agreed between ENTER and LEAVE.
    #[serde(flatten)]
    pub shared: BTreeMap<String, AttrValue>,
}

impl Interval {
    pub fn duration(&self) -> i64 {
        self.leave.timestamp - self.enter.timestamp
    }

    /// An attribute looked up at the interval root first, then on the ENTER
    /// side (GUIDs always refer to the enter event when the sides disagree).
    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.shared.get(key).or_else(|| self.enter.attrs.get(key))
    }

    pub fn guid(&self) -> Option<String> {
        self.attr("GUID").map(AttrValue::as_key)
    }

    pub fn parent_guid(&self) -> Option<String> {
        self.attr("Parent GUID").map(AttrValue::as_key)
    }
}

mod id_str {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(v: &usize, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<usize, D::Error> {
        String::deserialize(d)?.parse().map_err(D::Error::custom)
    }
}

mod opt_id_str {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(v: &Option<usize>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(id) => s.serialize_some(&id.to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<usize>, D::Error> {
        match Option::<String>::deserialize(d)? {
            Some(raw) => raw.parse().map(Some).map_err(D::Error::custom),
            None => Ok(None),
        }
    }
}

mod id_vec_str {
    use serde::{Deserialize, Deserializer, Serializer, de::Error, ser::SerializeSeq};

    pub fn serialize<S: Serializer>(v: &[usize], s: S) -> Result<S::Ok, S::Error> {
        let mut seq = s.serialize_seq(Some(v.len()))?;
        for id in v {
            seq.serialize_element(&id.to_string())?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<usize>, D::Error> {
        Vec::<String>::deserialize(d)?
            .into_iter()
            .map(|raw| raw.parse().map_err(D::Error::custom))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Interval {
        let mut shared = BTreeMap::new();
        shared.insert("GUID".to_string(), AttrValue::Int(7));
        shared.insert("Parent GUID".to_string(), AttrValue::Int(3));
        Interval {
            id: 12,
            location: "1".to_string(),
            primitive: "multiply$0$21$4".to_string(),
            enter: IntervalSide {
                timestamp: 100,
                metrics: BTreeMap::new(),
                attrs: BTreeMap::new(),
            },
            leave: IntervalSide {
                timestamp: 250,
                metrics: BTreeMap::new(),
                attrs: BTreeMap::new(),
            },
            parent: Some(3),
            children: vec![14, 15],
            shared,
        }
    }

    #[test]
    fn ids_serialize_as_strings() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["intervalId"], "12");
        assert_eq!(json["parent"], "3");
        assert_eq!(json["children"][0], "14");
        assert_eq!(json["enter"]["Timestamp"], 100);
        assert_eq!(json["GUID"], 7);
    }

    #[test]
    fn round_trip_preserves_shared_attrs() {
        let json = serde_json::to_string(&sample()).unwrap();
        let back: Interval = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, 12);
        assert_eq!(back.parent, Some(3));
        assert_eq!(back.children, vec![14, 15]);
        assert_eq!(back.guid().as_deref(), Some("7"));
        assert_eq!(back.parent_guid().as_deref(), Some("3"));
        assert_eq!(back.duration(), 150);
    }
}
