//! Raw-line tokenization into feature vectors (§6's `INPUTFORMAT`,
//! `FLENGTH`, `TARGET_POS`).
//!
//! `vicinity-core` never sees a raw line — only `Vec<&str>` feature
//! tokens plus a target label. This module is the external collaborator
//! that bridges the two, exactly as SPEC_FULL.md's scope note describes.

use anyhow::{anyhow, bail, Result};

/// One recognized on-disk line shape. `auto_detect` inspects the first
/// non-blank line and picks the best match; everything else is explicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    /// Comma-separated, C4.5-style (`val1,val2,...,class.`), trailing dot
    /// optional.
    C45,
    /// Whitespace-separated columns, class last (or at `TARGET_POS`).
    Columns,
    /// Tab-separated columns.
    Tabbed,
    /// A single `@data` ARFF line with comma-separated values.
    Arff,
    /// Fixed-width fields, `FLENGTH` characters each, no separators.
    Compact,
    /// `index:value` pairs, whitespace-separated, implicit zero elsewhere.
    Sparse,
    /// Like `Sparse` but binary-valued (`index` alone means value `1`).
    SparseBin,
}

/// A tokenized training or test row: feature tokens in file order, plus
/// the class label token (absent for unlabeled test rows when
/// `TARGET_POS` points past the end, e.g. interactive classify queries).
#[derive(Debug, Clone, PartialEq)]
pub struct TokenizedRow {
    pub values: Vec<String>,
    pub target: Option<String>,
}

/// Tokenizes one line under `format`. `n_features` is required for
/// `Compact`/`Sparse`/`SparseBin` (to size the dense output vector);
/// ignored otherwise. `target_pos` is `None` for "last column" (the
/// default), `Some(i)` to pull the label from column `i` instead.
pub fn tokenize_line(
    line: &str,
    format: InputFormat,
    n_features: usize,
    target_pos: Option<usize>,
) -> Result<TokenizedRow> {
    match format {
        InputFormat::C45 => tokenize_delimited(line.trim_end_matches('.'), ',', target_pos),
        InputFormat::Columns => tokenize_whitespace(line, target_pos),
        InputFormat::Tabbed => tokenize_delimited(line, '\t', target_pos),
        InputFormat::Arff => tokenize_delimited(line, ',', target_pos),
        InputFormat::Compact => tokenize_compact(line, n_features, target_pos),
        InputFormat::Sparse => tokenize_sparse(line, n_features, false),
        InputFormat::SparseBin => tokenize_sparse(line, n_features, true),
    }
}

fn split_out_target(mut fields: Vec<String>, target_pos: Option<usize>) -> Result<TokenizedRow> {
    if fields.is_empty() {
        bail!("empty row");
    }
    let pos = target_pos.unwrap_or(fields.len() - 1);
    if pos >= fields.len() {
        bail!("TARGET_POS {pos} out of range for a row of {} fields", fields.len());
    }
    let target = fields.remove(pos);
    Ok(TokenizedRow {
        values: fields,
        target: Some(target),
    })
}

fn tokenize_delimited(line: &str, delim: char, target_pos: Option<usize>) -> Result<TokenizedRow> {
    let fields: Vec<String> = line.split(delim).map(|s| s.trim().to_string()).collect();
    split_out_target(fields, target_pos)
}

fn tokenize_whitespace(line: &str, target_pos: Option<usize>) -> Result<TokenizedRow> {
    let fields: Vec<String> = line.split_whitespace().map(str::to_string).collect();
    split_out_target(fields, target_pos)
}

fn tokenize_compact(line: &str, n_features: usize, target_pos: Option<usize>) -> Result<TokenizedRow> {
    if n_features == 0 {
        bail!("FLENGTH must be set for Compact input");
    }
    let chars: Vec<char> = line.chars().collect();
    let mut fields = Vec::new();
    let mut i = 0;
    while i + n_features <= chars.len() {
        fields.push(chars[i..i + n_features].iter().collect());
        i += n_features;
    }
    if i < chars.len() {
        fields.push(chars[i..].iter().collect());
    }
    split_out_target(fields, target_pos)
}

fn tokenize_sparse(line: &str, n_features: usize, binary: bool) -> Result<TokenizedRow> {
    if n_features == 0 {
        bail!("a known feature count is required for Sparse input");
    }
    let mut values = vec!["0".to_string(); n_features];
    let mut target = None;
    for token in line.split_whitespace() {
        if let Some((idx, val)) = token.split_once(':') {
            let idx: usize = idx
                .parse()
                .map_err(|_| anyhow!("malformed sparse index {idx:?}"))?;
            if idx >= n_features {
                bail!("sparse index {idx} out of range for {n_features} features");
            }
            values[idx] = val.to_string();
        } else if binary {
            let idx: usize = token
                .parse()
                .map_err(|_| anyhow!("malformed sparse index {token:?}"))?;
            if idx >= n_features {
                bail!("sparse index {idx} out of range for {n_features} features");
            }
            values[idx] = "1".to_string();
        } else {
            target = Some(token.to_string());
        }
    }
    Ok(TokenizedRow { values, target })
}

/// Picks a format by inspecting one representative non-blank line:
/// an ARFF `@data` marker, the presence of `index:value` pairs, or the
/// delimiter that yields a consistent field count.
pub fn detect_format(sample_line: &str) -> InputFormat {
    let trimmed = sample_line.trim();
    if trimmed.eq_ignore_ascii_case("@data") || trimmed.starts_with('@') {
        return InputFormat::Arff;
    }
    if trimmed.split_whitespace().any(|tok| tok.contains(':')) {
        return InputFormat::Sparse;
    }
    if trimmed.contains('\t') {
        return InputFormat::Tabbed;
    }
    if trimmed.contains(',') {
        return InputFormat::C45;
    }
    InputFormat::Columns
}
