use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fs, path::Path};

/// Financial records forwarded verbatim with every question. Records are opaque to this crate;
/// only the four top-level arrays matter, and any of them may be missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinancialData {
    #[serde(default)]
    pub kpi_data_g1: Vec<Value>,
    #[serde(default)]
    pub add_data_g1: Vec<Value>,
    #[serde(default)]
    pub kpi_data_g2: Vec<Value>,
    #[serde(default)]
    pub add_data_g2: Vec<Value>,
}

impl FinancialData {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("data file {} not found or unreadable", path.display()))?;
        Self::parse(&contents).with_context(|| format!("error parsing JSON in {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let data: Self = serde_json::from_str(contents)?;
        tracing::info!(
            kpi_g1 = data.kpi_data_g1.len(),
            add_g1 = data.add_data_g1.len(),
            kpi_g2 = data.kpi_data_g2.len(),
            add_g2 = data.add_data_g2.len(),
            "financial data loaded"
        );
        Ok(data)
    }

    /// Record counts for the overview panel, in display order.
    pub fn overview(&self) -> [(&'static str, usize); 4] {
        [
            ("KPI Data G1", self.kpi_data_g1.len()),
            ("Additional Data G1", self.add_data_g1.len()),
            ("KPI Data G2", self.kpi_data_g2.len()),
            ("Additional Data G2", self.add_data_g2.len()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::NamedTempFile;

    #[test]
    fn missing_arrays_default_to_empty() {
        let data = FinancialData::parse(r#"{"kpi_data_g1": [{"Month_Year": "Jan 2024", "Income": 10}]}"#)
            .unwrap();
        assert_eq!(data.kpi_data_g1.len(), 1);
        assert!(data.add_data_g1.is_empty());
        assert!(data.kpi_data_g2.is_empty());
        assert!(data.add_data_g2.is_empty());
    }

    #[test]
    fn overview_counts_each_section() {
        let data = FinancialData::parse(
            r#"{"kpi_data_g1": [1, 2], "add_data_g1": [3], "kpi_data_g2": [], "add_data_g2": [4, 5, 6]}"#,
        )
        .unwrap();
        let counts: Vec<usize> = data.overview().iter().map(|(_, n)| *n).collect();
        assert_eq!(counts, vec![2, 1, 0, 3]);
    }

    #[test]
    fn malformed_json_is_an_error() {
        let file = NamedTempFile::new().unwrap();
        fs::write(file.path(), "{ not json").unwrap();
        let err = FinancialData::load(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("error parsing JSON"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = FinancialData::load(&dir.path().join("data.json")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
