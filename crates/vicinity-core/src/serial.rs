//! In-memory codecs for persisted weight files and instance-base files
//! (§ADD). Pure (de)serialization over `&str`/`String` — no `std::fs`
//! here; the CLI crate owns reading/writing actual files and hands this
//! module their contents.
//!
//! Both formats are line-oriented text, matching the reference
//! implementation's own on-disk representation: a version-stamped header
//! line followed by one data line per record. Versions below 4 predate a
//! breaking change to the weight layout and are rejected outright rather
//! than guessed at.

use crate::error::{EngineError, Result};

/// Oldest file-format version this crate will read.
pub const MIN_SUPPORTED_VERSION: u32 = 4;
/// Version this crate writes.
pub const CURRENT_VERSION: u32 = 4;

/// Serializes one feature weight vector as `WEIGHTS <version>` followed by
/// one `index value` line per feature, in index order.
pub fn encode_weights(weights: &[f64]) -> String {
    let mut out = format!("WEIGHTS {CURRENT_VERSION}\n");
    for (i, w) in weights.iter().enumerate() {
        out.push_str(&format!("{i} {w}\n"));
    }
    out
}

/// Parses the format written by [`encode_weights`]. Indices may arrive in
/// any order; gaps are filled with `0.0`.
pub fn decode_weights(text: &str) -> Result<Vec<f64>> {
    let mut lines = text.lines();
    let header = lines
        .next()
        .ok_or_else(|| EngineError::Serial("empty weight file".into()))?;
    let version = parse_header(header, "WEIGHTS")?;
    if version < MIN_SUPPORTED_VERSION {
        return Err(EngineError::Serial(format!(
            "weight file version {version} predates the supported format (min {MIN_SUPPORTED_VERSION})"
        )));
    }

    let mut entries: Vec<(usize, f64)> = Vec::new();
    for (lineno, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let mut parts = line.split_whitespace();
        let index: usize = parts
            .next()
            .ok_or_else(|| EngineError::Serial(format!("line {lineno}: missing index")))?
            .parse()
            .map_err(|_| EngineError::Serial(format!("line {lineno}: malformed index")))?;
        let value: f64 = parts
            .next()
            .ok_or_else(|| EngineError::Serial(format!("line {lineno}: missing weight")))?
            .parse()
            .map_err(|_| EngineError::Serial(format!("line {lineno}: malformed weight")))?;
        entries.push((index, value));
    }
    let max_index = entries.iter().map(|(i, _)| *i).max().unwrap_or(0);
    let mut weights = vec![0.0; max_index + 1];
    for (i, v) in entries {
        weights[i] = v;
    }
    Ok(weights)
}

/// One decoded instance-base row: feature value tokens, class label, and
/// exemplar weight (defaults to `1.0` when the line carries only two
/// tokens per feature-vector-plus-class).
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRecord {
    pub values: Vec<String>,
    pub target: String,
    pub weight: f64,
}

/// Serializes training instances as `INSTANCEBASE <version> <n_features>`
/// followed by one line per instance. A line carries a trailing weight
/// token only when it differs from `1.0` (the "third-token rule": a line
/// with exactly `n_features + 1` tokens is unweighted, one with
/// `n_features + 2` tokens carries an explicit weight as its last token).
pub fn encode_instance_base(n_features: usize, records: &[InstanceRecord]) -> String {
    let mut out = format!("INSTANCEBASE {CURRENT_VERSION} {n_features}\n");
    for record in records {
        out.push_str(&record.values.join(" "));
        out.push(' ');
        out.push_str(&record.target);
        if (record.weight - 1.0).abs() > f64::EPSILON {
            out.push(' ');
            out.push_str(&record.weight.to_string());
        }
        out.push('\n');
    }
    out
}

/// Parses the format written by [`encode_instance_base`]. Returns the
/// declared feature count and the decoded records.
pub fn decode_instance_base(text: &str) -> Result<(usize, Vec<InstanceRecord>)> {
    let mut lines = text.lines();
    let header = lines
        .next()
        .ok_or_else(|| EngineError::Serial("empty instance base file".into()))?;
    let mut header_parts = header.split_whitespace();
    let tag = header_parts
        .next()
        .ok_or_else(|| EngineError::Serial("missing header".into()))?;
    if tag != "INSTANCEBASE" {
        return Err(EngineError::Serial(format!("unexpected header tag {tag:?}")));
    }
    let version: u32 = header_parts
        .next()
        .ok_or_else(|| EngineError::Serial("missing version in header".into()))?
        .parse()
        .map_err(|_| EngineError::Serial("malformed version in header".into()))?;
    if version < MIN_SUPPORTED_VERSION {
        return Err(EngineError::Serial(format!(
            "instance base version {version} predates the supported format (min {MIN_SUPPORTED_VERSION})"
        )));
    }
    let n_features: usize = header_parts
        .next()
        .ok_or_else(|| EngineError::Serial("missing feature count in header".into()))?
        .parse()
        .map_err(|_| EngineError::Serial("malformed feature count in header".into()))?;

    let mut records = Vec::new();
    for (lineno, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let (values, target, weight) = match tokens.len() {
            n if n == n_features + 1 => {
                let (values, rest) = tokens.split_at(n_features);
                (values.to_vec(), rest[0], 1.0)
            }
            n if n == n_features + 2 => {
                let (values, rest) = tokens.split_at(n_features);
                let weight: f64 = rest[1].parse().map_err(|_| {
                    EngineError::Serial(format!("line {lineno}: malformed exemplar weight"))
                })?;
                (values.to_vec(), rest[0], weight)
            }
            n => {
                return Err(EngineError::Serial(format!(
                    "line {lineno}: expected {} or {} tokens, got {n}",
                    n_features + 1,
                    n_features + 2
                )));
            }
        };
        records.push(InstanceRecord {
            values: values.into_iter().map(str::to_string).collect(),
            target: target.to_string(),
            weight,
        });
    }
    Ok((n_features, records))
}

fn parse_header(line: &str, expected_tag: &str) -> Result<u32> {
    let mut parts = line.split_whitespace();
    let tag = parts
        .next()
        .ok_or_else(|| EngineError::Serial("missing header tag".into()))?;
    if tag != expected_tag {
        return Err(EngineError::Serial(format!(
            "unexpected header tag {tag:?}, expected {expected_tag:?}"
        )));
    }
    parts
        .next()
        .ok_or_else(|| EngineError::Serial("missing version in header".into()))?
        .parse()
        .map_err(|_| EngineError::Serial("malformed version in header".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_round_trip() {
        let weights = vec![0.1, 0.9, 0.5];
        let text = encode_weights(&weights);
        let decoded = decode_weights(&text).unwrap();
        assert_eq!(decoded, weights);
    }

    #[test]
    fn old_weight_version_is_rejected() {
        let text = "WEIGHTS 2\n0 0.5\n";
        assert!(decode_weights(text).is_err());
    }

    #[test]
    fn instance_base_round_trip_with_default_weight() {
        let records = vec![InstanceRecord {
            values: vec!["a".into(), "b".into()],
            target: "yes".into(),
            weight: 1.0,
        }];
        let text = encode_instance_base(2, &records);
        let (n, decoded) = decode_instance_base(&text).unwrap();
        assert_eq!(n, 2);
        assert_eq!(decoded, records);
    }

    #[test]
    fn instance_base_round_trip_with_explicit_weight() {
        let records = vec![InstanceRecord {
            values: vec!["a".into(), "b".into()],
            target: "yes".into(),
            weight: 2.5,
        }];
        let text = encode_instance_base(2, &records);
        assert!(text.contains("2.5"));
        let (_, decoded) = decode_instance_base(&text).unwrap();
        assert_eq!(decoded, records);
    }

    #[test]
    fn wrong_token_count_is_rejected() {
        let text = "INSTANCEBASE 4 2\na b c d e\n";
        assert!(decode_instance_base(text).is_err());
    }
}
