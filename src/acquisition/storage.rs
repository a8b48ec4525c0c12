//! Tab-separated data files.
//!
//! Every acquisition writes to `<data_dir>/<YYYY-MM-DD>/<YYYYmmdd-HHMM>-<sample>-<name>.txt`.
//! Stepped sweeps add a `-proc.txt` aggregate file, differential sweeps a
//! `-didv.txt` trace file. Each file starts with two header rows (names, units);
//! missing values are written as `None`. Rows are flushed as soon as they are
//! written so a crash loses at most the tick in flight.

use crate::error::{AppResult, DaqError};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};

/// Text written for a missing value.
pub const MISSING: &str = "None";

/// Paths of the files belonging to one acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPaths {
    /// Raw per-tick stream
    pub raw: PathBuf,
    /// Stepped sweep aggregates
    pub aggregate: PathBuf,
    /// Differential sweep trace
    pub differential: PathBuf,
}

impl DataPaths {
    /// Paths for acquisition `name` of `sample` started at `started`.
    pub fn new(data_dir: &Path, sample: &str, name: &str, started: DateTime<Local>) -> Self {
        let day = data_dir.join(started.format("%Y-%m-%d").to_string());
        let stem = format!("{}-{}-{}", started.format("%Y%m%d-%H%M"), sample, name);
        Self {
            raw: day.join(format!("{}.txt", stem)),
            aggregate: day.join(format!("{}-proc.txt", stem)),
            differential: day.join(format!("{}-didv.txt", stem)),
        }
    }
}

/// Format one optional reading.
pub fn format_value(value: Option<f64>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => MISSING.to_string(),
    }
}

/// Tab-separated writer flushing after every row.
#[cfg(feature = "storage_csv")]
pub struct TsvWriter {
    path: PathBuf,
    writer: csv::Writer<std::fs::File>,
}

#[cfg(feature = "storage_csv")]
impl TsvWriter {
    /// Create (truncate) `path`, creating parent directories.
    pub fn create(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DaqError::Storage(format!("{}: {}", parent.display(), e)))?;
        }
        let writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .flexible(true)
            .from_path(path)?;
        tracing::info!(path = %path.display(), "Data file created");
        Ok(Self {
            path: path.to_path_buf(),
            writer,
        })
    }

    /// File being written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one row and flush it.
    pub fn write_row<I, S>(&mut self, fields: I) -> AppResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        self.writer.write_record(fields)?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Placeholder used when TSV output is compiled out.
#[cfg(not(feature = "storage_csv"))]
pub struct TsvWriter;

#[cfg(not(feature = "storage_csv"))]
impl TsvWriter {
    /// Always fails: storage is compiled out.
    pub fn create(_path: &Path) -> AppResult<Self> {
        Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
    }

    /// File being written.
    pub fn path(&self) -> &Path {
        Path::new("")
    }

    /// Always fails: storage is compiled out.
    pub fn write_row<I, S>(&mut self, _fields: I) -> AppResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
    }
}

impl TsvWriter {
    /// Write the two header rows.
    pub fn write_header<'a>(
        &mut self,
        names: impl IntoIterator<Item = &'a str>,
        units: impl IntoIterator<Item = &'a str>,
    ) -> AppResult<()> {
        self.write_row(names)?;
        self.write_row(units)
    }

    /// Write a leading value followed by optional readings.
    pub fn write_values(&mut self, first: f64, values: &[Option<f64>]) -> AppResult<()> {
        let row: Vec<String> = std::iter::once(first.to_string())
            .chain(values.iter().copied().map(format_value))
            .collect();
        self.write_row(row)
    }
}

#[cfg(all(test, feature = "storage_csv"))]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_paths_follow_naming_scheme() {
        let started = Local.with_ymd_and_hms(2024, 3, 7, 9, 5, 0).unwrap();
        let paths = DataPaths::new(Path::new("data"), "HallSr", "cool", started);
        assert_eq!(
            paths.raw,
            PathBuf::from("data/2024-03-07/20240307-0905-HallSr-cool.txt")
        );
        assert!(paths
            .aggregate
            .ends_with("2024-03-07/20240307-0905-HallSr-cool-proc.txt"));
        assert!(paths
            .differential
            .ends_with("2024-03-07/20240307-0905-HallSr-cool-didv.txt"));
    }

    #[test]
    fn test_rows_are_tab_separated_and_flushed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/run.txt");
        let mut writer = TsvWriter::create(&path).unwrap();
        writer
            .write_header(["time", "U1", "T"], ["seconds", "V", "K"])
            .unwrap();
        writer.write_values(1.5, &[Some(0.25), None]).unwrap();

        // Readable before the writer is dropped.
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "time\tU1\tT\nseconds\tV\tK\n1.5\t0.25\tNone\n");
        assert_eq!(writer.path(), path.as_path());
    }
}
