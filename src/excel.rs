//! Converts spreadsheet exports of the weekly price sheets into CSV.

use std::fs;
use std::path::{Path, PathBuf};

use calamine::{open_workbook_auto, Data, Reader};
use glob::glob;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{PipelineError, Result};

const EXTENSIONS: [&str; 4] = ["xlsx", "xls", "xlsm", "xlsb"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConversionReport {
    pub converted: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ConversionReport {
    pub fn total(&self) -> usize {
        self.converted + self.skipped + self.failed
    }
}

/// Converts the first sheet of every workbook in `excel_dir` into
/// `<csv_dir>/<stem>.csv`. Workbooks whose CSV already exists are skipped.
pub fn convert_directory(excel_dir: &Path, csv_dir: &Path) -> Result<ConversionReport> {
    if !excel_dir.is_dir() {
        return Err(PipelineError::MissingInput(excel_dir.to_path_buf()));
    }
    fs::create_dir_all(csv_dir)?;

    let workbooks = list_workbooks(excel_dir)?;
    info!("Found {} workbook(s) in {}", workbooks.len(), excel_dir.display());

    let mut report = ConversionReport::default();
    for workbook in workbooks {
        let Some(stem) = workbook.file_stem() else {
            continue;
        };
        let target = csv_dir.join(format!("{}.csv", stem.to_string_lossy()));
        if target.exists() {
            info!("Skipped {} (already converted)", workbook.display());
            report.skipped += 1;
            continue;
        }
        match convert_workbook(&workbook, &target) {
            Ok(rows) => {
                info!("Converted {} ({rows} rows)", workbook.display());
                report.converted += 1;
            }
            Err(e) => {
                warn!("Failed to convert {}: {e}", workbook.display());
                // A partial CSV would be skipped on the next run.
                let _ = fs::remove_file(&target);
                report.failed += 1;
            }
        }
    }
    info!(
        converted = report.converted,
        skipped = report.skipped,
        failed = report.failed,
        "Excel conversion finished"
    );
    Ok(report)
}

fn list_workbooks(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for ext in EXTENSIONS {
        let pattern = dir.join(format!("*.{ext}"));
        let matches = glob(&pattern.to_string_lossy())
            .map_err(|e| PipelineError::InvalidInput(format!("bad glob pattern: {e}")))?;
        paths.extend(matches.filter_map(std::result::Result::ok));
    }
    paths.sort();
    Ok(paths)
}

/// Writes the first worksheet of `source` to `target`, returning the row count.
pub fn convert_workbook(source: &Path, target: &Path) -> Result<usize> {
    let mut workbook = open_workbook_auto(source)?;
    let sheet = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| PipelineError::InvalidInput(format!("{} has no sheets", source.display())))?;
    let range = workbook.worksheet_range(&sheet)?;

    let mut writer = csv::WriterBuilder::new().flexible(true).from_path(target).map_err(csv_error)?;
    let mut rows = 0;
    for row in range.rows() {
        writer
            .write_record(row.iter().map(cell_text))
            .map_err(csv_error)?;
        rows += 1;
    }
    writer.flush()?;
    Ok(rows)
}

fn csv_error(e: csv::Error) -> PipelineError {
    PipelineError::InvalidInput(format!("CSV write failed: {e}"))
}

pub fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
        Data::Float(f) => f.to_string(),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_text() {
        assert_eq!(cell_text(&Data::Empty), "");
        assert_eq!(cell_text(&Data::Float(1500.0)), "1500");
        assert_eq!(cell_text(&Data::Float(12.5)), "12.5");
        assert_eq!(cell_text(&Data::Int(7)), "7");
        assert_eq!(cell_text(&Data::String(" Thalapath ".to_string())), "Thalapath");
    }

    #[test]
    fn test_existing_csv_is_skipped_and_broken_workbook_counted() {
        let xl = tempfile::tempdir().unwrap();
        let csv_dir = tempfile::tempdir().unwrap();
        fs::write(xl.path().join("March_1st_week_2024.xlsx"), b"not a zip").unwrap();
        fs::write(xl.path().join("March_2nd_week_2024.xlsx"), b"not a zip").unwrap();
        fs::write(xl.path().join("readme.txt"), b"ignored").unwrap();
        fs::write(csv_dir.path().join("March_2nd_week_2024.csv"), "done").unwrap();

        let report = convert_directory(xl.path(), csv_dir.path()).unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.converted, 0);
        assert_eq!(report.total(), 2);
        assert!(!csv_dir.path().join("March_1st_week_2024.csv").exists());
    }

    #[test]
    fn test_missing_directory() {
        let out = tempfile::tempdir().unwrap();
        let err = convert_directory(Path::new("no/xl/here"), out.path()).unwrap_err();
        assert!(matches!(err, PipelineError::MissingInput(_)));
    }
}
