//! Results table.
//!
//! One row per `(cellid, batch, modelname)` with the fit's performance and
//! provenance. Rows have a fixed schema ([`ResultRecord`]); [`ResultColumn`]
//! names the columns a listing may select or sort by.

use std::cmp::Ordering;
use std::fs::File;
use std::path::PathBuf;

use chrono::NaiveDateTime;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::FitError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub cellid: String,
    pub batch: u32,
    pub modelname: String,
    // Metrics absent from a run are NaN in memory and null on disk.
    #[serde(with = "nan_as_null")]
    pub r_est: f64,
    #[serde(with = "nan_as_null")]
    pub r_val: f64,
    #[serde(with = "nan_as_null")]
    pub r_floor: f64,
    #[serde(with = "nan_as_null")]
    pub mse_est: f64,
    #[serde(with = "nan_as_null")]
    pub mse_val: f64,
    pub n_parms: usize,
    pub username: String,
    pub labgroup: String,
    /// Path of the fit export, empty when none was written.
    pub figurefile: String,
    pub lastmod: NaiveDateTime,
}

mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}

impl ResultRecord {
    pub fn matches(&self, cellid: &str, batch: u32, modelname: &str) -> bool {
        self.cellid == cellid && self.batch == batch && self.modelname == modelname
    }

    pub fn value(&self, column: ResultColumn) -> ColumnValue {
        match column {
            ResultColumn::Cellid => ColumnValue::Text(self.cellid.clone()),
            ResultColumn::Batch => ColumnValue::Number(f64::from(self.batch)),
            ResultColumn::Modelname => ColumnValue::Text(self.modelname.clone()),
            ResultColumn::REst => ColumnValue::Number(self.r_est),
            ResultColumn::RVal => ColumnValue::Number(self.r_val),
            ResultColumn::RFloor => ColumnValue::Number(self.r_floor),
            ResultColumn::MseEst => ColumnValue::Number(self.mse_est),
            ResultColumn::MseVal => ColumnValue::Number(self.mse_val),
            ResultColumn::NParms => ColumnValue::Number(self.n_parms as f64),
            ResultColumn::Username => ColumnValue::Text(self.username.clone()),
            ResultColumn::Labgroup => ColumnValue::Text(self.labgroup.clone()),
            ResultColumn::Figurefile => ColumnValue::Text(self.figurefile.clone()),
            ResultColumn::Lastmod => ColumnValue::Text(self.lastmod.format("%Y-%m-%d %H:%M:%S").to_string()),
        }
    }
}

/// Selectable result columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum ResultColumn {
    Cellid,
    Batch,
    Modelname,
    REst,
    RVal,
    RFloor,
    MseEst,
    MseVal,
    NParms,
    Username,
    Labgroup,
    Figurefile,
    Lastmod,
}

impl ResultColumn {
    pub fn header(self) -> &'static str {
        match self {
            ResultColumn::Cellid => "cellid",
            ResultColumn::Batch => "batch",
            ResultColumn::Modelname => "modelname",
            ResultColumn::REst => "r_est",
            ResultColumn::RVal => "r_val",
            ResultColumn::RFloor => "r_floor",
            ResultColumn::MseEst => "mse_est",
            ResultColumn::MseVal => "mse_val",
            ResultColumn::NParms => "n_parms",
            ResultColumn::Username => "username",
            ResultColumn::Labgroup => "labgroup",
            ResultColumn::Figurefile => "figurefile",
            ResultColumn::Lastmod => "lastmod",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Text(String),
    Number(f64),
}

impl ColumnValue {
    fn compare(&self, other: &Self) -> Ordering {
        match (self, other) {
            (ColumnValue::Number(a), ColumnValue::Number(b)) => a.total_cmp(b),
            (ColumnValue::Text(a), ColumnValue::Text(b)) => a.cmp(b),
            (ColumnValue::Number(_), ColumnValue::Text(_)) => Ordering::Less,
            (ColumnValue::Text(_), ColumnValue::Number(_)) => Ordering::Greater,
        }
    }
}

impl std::fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnValue::Text(s) => f.write_str(s),
            ColumnValue::Number(v) if v.fract() == 0.0 && v.abs() < 1e15 => write!(f, "{v:.0}"),
            ColumnValue::Number(v) => write!(f, "{v:.4}"),
        }
    }
}

/// Filtered, sorted listing over the results table.
#[derive(Debug, Clone)]
pub struct ResultQuery {
    pub batch: u32,
    /// Empty means every cell.
    pub cells: Vec<String>,
    /// Empty means every model.
    pub models: Vec<String>,
    /// Empty means [`ResultQuery::DEFAULT_COLUMNS`].
    pub columns: Vec<ResultColumn>,
    pub sort: Option<ResultColumn>,
    pub descending: bool,
    pub limit: Option<usize>,
}

impl ResultQuery {
    pub const DEFAULT_COLUMNS: [ResultColumn; 5] = [
        ResultColumn::Cellid,
        ResultColumn::Modelname,
        ResultColumn::REst,
        ResultColumn::RVal,
        ResultColumn::NParms,
    ];

    pub fn for_batch(batch: u32) -> Self {
        Self {
            batch,
            cells: Vec::new(),
            models: Vec::new(),
            columns: Vec::new(),
            sort: None,
            descending: true,
            limit: None,
        }
    }

    pub fn selected_columns(&self) -> Vec<ResultColumn> {
        if self.columns.is_empty() {
            Self::DEFAULT_COLUMNS.to_vec()
        } else {
            self.columns.clone()
        }
    }

    /// Matching rows in listing order.
    pub fn apply<'a>(&self, rows: &'a [ResultRecord]) -> Vec<&'a ResultRecord> {
        let mut out: Vec<&ResultRecord> = rows
            .iter()
            .filter(|r| r.batch == self.batch)
            .filter(|r| self.cells.is_empty() || self.cells.contains(&r.cellid))
            .filter(|r| self.models.is_empty() || self.models.contains(&r.modelname))
            .collect();
        if let Some(column) = self.sort {
            out.sort_by(|a, b| {
                let ord = a.value(column).compare(&b.value(column));
                if self.descending { ord.reverse() } else { ord }
            });
        }
        if let Some(limit) = self.limit {
            out.truncate(limit);
        }
        out
    }

    /// Rows rendered as strings, one entry per selected column.
    pub fn table(&self, rows: &[ResultRecord]) -> Vec<Vec<String>> {
        let columns = self.selected_columns();
        self.apply(rows)
            .into_iter()
            .map(|r| columns.iter().map(|&c| r.value(c).to_string()).collect())
            .collect()
    }
}

/// Persistence boundary for fit results.
pub trait ResultStore {
    fn find_existing_result(&self, cellid: &str, batch: u32, modelname: &str) -> Result<bool, FitError>;

    /// Insert `record`, replacing any row with the same key.
    fn save_result(&mut self, record: ResultRecord) -> Result<(), FitError>;

    fn all_results(&self) -> Result<Vec<ResultRecord>, FitError>;
}

/// Results kept in one pretty-printed JSON array.
#[derive(Debug, Clone)]
pub struct JsonResultStore {
    path: PathBuf,
}

impl JsonResultStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn write(&self, rows: &[ResultRecord]) -> Result<(), FitError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| FitError::io(dir, e))?;
        }
        let file = File::create(&self.path).map_err(|e| FitError::io(&self.path, e))?;
        serde_json::to_writer_pretty(file, rows).map_err(|e| FitError::json(&self.path, e))
    }
}

impl ResultStore for JsonResultStore {
    fn find_existing_result(&self, cellid: &str, batch: u32, modelname: &str) -> Result<bool, FitError> {
        Ok(self.all_results()?.iter().any(|r| r.matches(cellid, batch, modelname)))
    }

    fn save_result(&mut self, record: ResultRecord) -> Result<(), FitError> {
        let mut rows = self.all_results()?;
        rows.retain(|r| !r.matches(&record.cellid, record.batch, &record.modelname));
        log::info!(
            "Saving result {}/{}/{} (r_val {:.4})",
            record.cellid,
            record.batch,
            record.modelname,
            record.r_val
        );
        rows.push(record);
        self.write(&rows)
    }

    fn all_results(&self) -> Result<Vec<ResultRecord>, FitError> {
        match File::open(&self.path) {
            Ok(file) => serde_json::from_reader(file).map_err(|e| FitError::json(&self.path, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(FitError::io(&self.path, e)),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::NaiveDate;

    pub(crate) fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("neurofit-{}-{name}.json", std::process::id()))
    }

    pub(crate) fn record(cellid: &str, modelname: &str, r_val: f64) -> ResultRecord {
        ResultRecord {
            cellid: cellid.to_string(),
            batch: 291,
            modelname: modelname.to_string(),
            r_est: r_val + 0.1,
            r_val,
            r_floor: 0.05,
            mse_est: 0.5,
            mse_val: 0.6,
            n_parms: 10,
            username: "svd".to_string(),
            labgroup: "lbhb".to_string(),
            figurefile: String::new(),
            lastmod: NaiveDate::from_ymd_opt(2024, 3, 1)
                .and_then(|d| d.and_hms_opt(12, 0, 0))
                .unwrap(),
        }
    }

    #[test]
    fn save_replaces_row_with_same_key() {
        let path = temp_path("results-replace");
        let _ = std::fs::remove_file(&path);
        let mut store = JsonResultStore::new(&path);
        assert!(!store.find_existing_result("a", 291, "m").unwrap());

        store.save_result(record("a", "m", 0.2)).unwrap();
        store.save_result(record("b", "m", 0.3)).unwrap();
        store.save_result(record("a", "m", 0.4)).unwrap();

        let rows = store.all_results().unwrap();
        assert_eq!(rows.len(), 2);
        assert!(store.find_existing_result("a", 291, "m").unwrap());
        assert!(!store.find_existing_result("a", 292, "m").unwrap());
        assert_eq!(rows.iter().find(|r| r.cellid == "a").unwrap().r_val, 0.4);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn missing_metrics_survive_the_file() {
        let path = temp_path("results-nan");
        let _ = std::fs::remove_file(&path);
        let mut store = JsonResultStore::new(&path);
        let mut row = record("a", "m", f64::NAN);
        row.mse_val = f64::NAN;
        store.save_result(row).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"r_val\": null"));
        let rows = store.all_results().unwrap();
        assert!(rows[0].r_val.is_nan());
        assert!(rows[0].mse_val.is_nan());
        assert_eq!(rows[0].mse_est, 0.5);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn query_filters_sorts_and_limits() {
        let mut other_batch = record("a", "m1", 0.9);
        other_batch.batch = 300;
        let rows = vec![
            record("a", "m1", 0.2),
            record("b", "m1", 0.5),
            record("c", "m2", 0.4),
            other_batch,
        ];

        let mut query = ResultQuery::for_batch(291);
        query.models = vec!["m1".to_string(), "m2".to_string()];
        query.sort = Some(ResultColumn::RVal);
        query.limit = Some(2);
        let cells: Vec<&str> = query.apply(&rows).iter().map(|r| r.cellid.as_str()).collect();
        assert_eq!(cells, vec!["b", "c"]);

        query.descending = false;
        query.cells = vec!["a".to_string(), "b".to_string()];
        query.columns = vec![ResultColumn::Cellid, ResultColumn::RVal, ResultColumn::NParms];
        assert_eq!(
            query.table(&rows),
            vec![
                vec!["a".to_string(), "0.2000".to_string(), "10".to_string()],
                vec!["b".to_string(), "0.5000".to_string(), "10".to_string()],
            ]
        );
    }
}
