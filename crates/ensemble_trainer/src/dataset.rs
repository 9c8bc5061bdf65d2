//! CSV dataset loading
//!
//! Reads one entrant per line with a header row. Only the columns the feature
//! contract and the race key need are parsed; everything else is ignored.
//! Empty cells become `NaN`. Labels come either from a 0/1 column or from a
//! finishing-rank column where rank 1 is the winner.

use anyhow::{bail, Context, Result};
use boatrace_ensemble_core::{FeatureSet, Frame};
use csv::{ReaderBuilder, Trim};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Where the win label is read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelSource {
    /// A column holding 0 or 1
    Column(String),
    /// A finishing-rank column; `1` wins, anything else (including
    /// disqualification marks) loses
    Rank(String),
}

impl Default for LabelSource {
    fn default() -> Self {
        LabelSource::Column("target".to_string())
    }
}

/// Min, max and missing count of one column
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureStats {
    pub name: String,
    pub min: f64,
    pub max: f64,
    pub missing: usize,
}

/// Training rows with their labels
#[derive(Debug, Clone)]
pub struct Dataset {
    pub frame: Frame,
    pub labels: Vec<u8>,
}

impl Dataset {
    /// Load a headed CSV file
    pub fn from_csv<P: AsRef<Path>>(path: P, features: &FeatureSet, label: &LabelSource) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("Failed to read CSV file {}", path.display()))?;
        Self::from_reader(file, features, label)
            .with_context(|| format!("Failed to load {}", path.display()))
    }

    /// Parse headed CSV text
    pub fn from_csv_str(content: &str, features: &FeatureSet, label: &LabelSource) -> Result<Self> {
        Self::from_reader(content.as_bytes(), features, label)
    }

    /// Parse headed CSV from any reader; quoted cells may contain commas
    pub fn from_reader<R: Read>(reader: R, features: &FeatureSet, label: &LabelSource) -> Result<Self> {
        let mut rdr = ReaderBuilder::new()
            .has_headers(true)
            .trim(Trim::All)
            .comment(Some(b'#'))
            .from_reader(reader);

        let header: Vec<String> = rdr
            .headers()
            .context("Failed to read CSV header")?
            .iter()
            .map(str::to_string)
            .collect();
        if header.iter().all(String::is_empty) {
            bail!("Dataset is empty");
        }
        let position = |name: &str| header.iter().position(|h| h == name);

        let missing: Vec<&str> = features
            .base
            .iter()
            .filter(|name| position(name).is_none())
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            bail!("CSV header lacks feature columns: {}", missing.join(", "));
        }

        let label_name = match label {
            LabelSource::Column(name) | LabelSource::Rank(name) => name,
        };
        let label_idx = position(label_name)
            .with_context(|| format!("CSV header lacks label column '{label_name}'"))?;

        let keys: BTreeSet<&str> = features.race_key.iter().map(String::as_str).collect();
        let mut wanted: Vec<(String, usize)> = Vec::new();
        for name in features.base.iter().chain(&features.race_key) {
            if wanted.iter().any(|(n, _)| n == name) {
                continue;
            }
            // race key columns are optional; without them the split is row-wise
            if let Some(idx) = position(name) {
                wanted.push((name.clone(), idx));
            }
        }

        let mut columns: Vec<Vec<f64>> = vec![Vec::new(); wanted.len()];
        let mut labels = Vec::new();

        for (record_no, result) in rdr.records().enumerate() {
            let record = result.with_context(|| format!("Malformed CSV record {}", record_no + 1))?;
            let line_no = record.position().map_or(record_no as u64 + 2, |p| p.line());

            for ((name, idx), column) in wanted.iter().zip(columns.iter_mut()) {
                let cell = record.get(*idx).unwrap_or_default();
                let value = if keys.contains(name.as_str()) {
                    parse_key(cell)
                } else {
                    parse_number(cell)
                }
                .with_context(|| format!("Line {}, column '{}': invalid value '{}'", line_no, name, cell))?;
                column.push(value);
            }

            let cell = record.get(label_idx).unwrap_or_default();
            let y = match label {
                LabelSource::Column(_) => match cell {
                    "0" => 0,
                    "1" => 1,
                    _ => bail!("Line {}: label must be 0 or 1, got '{}'", line_no, cell),
                },
                LabelSource::Rank(_) => u8::from(cell.parse::<u32>().ok() == Some(1)),
            };
            labels.push(y);
        }

        if labels.is_empty() {
            bail!("Dataset has a header but no rows");
        }

        let frame = Frame::from_columns(wanted.into_iter().map(|(name, _)| name).zip(columns))
            .context("Failed to assemble frame")?;

        Ok(Self { frame, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn positives(&self) -> usize {
        self.labels.iter().filter(|&&y| y == 1).count()
    }

    /// Per-column statistics for the log; `NaN` cells count as missing
    pub fn feature_stats(&self) -> Vec<FeatureStats> {
        self.frame
            .column_names()
            .iter()
            .filter_map(|name| {
                let values = self.frame.column(name)?;
                let mut stats = FeatureStats {
                    name: name.clone(),
                    min: f64::INFINITY,
                    max: f64::NEG_INFINITY,
                    missing: 0,
                };
                for &v in values {
                    if v.is_nan() {
                        stats.missing += 1;
                    } else {
                        stats.min = stats.min.min(v);
                        stats.max = stats.max.max(v);
                    }
                }
                Some(stats)
            })
            .collect()
    }
}

fn parse_number(cell: &str) -> Result<f64> {
    if cell.is_empty() {
        return Ok(f64::NAN);
    }
    let value: f64 = cell.parse()?;
    Ok(value)
}

/// Race key cells may be formatted dates such as `2024-01-05`; their digits are used
fn parse_key(cell: &str) -> Result<f64> {
    if let Ok(value) = cell.parse::<f64>() {
        return Ok(value);
    }
    let digits: String = cell.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        bail!("no digits in race key");
    }
    Ok(digits.parse::<u64>()? as f64)
}
