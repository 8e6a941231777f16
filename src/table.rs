//! Thin helpers around polars for the CSV tables passed between stages.
//!
//! Every stage reads its input with all columns as strings and parses the
//! columns it needs itself, so a table written by one stage can be read back
//! by the next regardless of how polars would have inferred its schema.

use std::fs::{self, File};
use std::io::Cursor;
use std::path::Path;

use chrono::NaiveDate;
use polars::prelude::*;
use regex::Regex;
use std::sync::OnceLock;

use crate::error::{PipelineError, Result};

pub const DATE_COLUMN: &str = "date";
pub const DATE_FORMAT: &str = "%Y-%m-%d";

const DATE_FORMATS: [&str; 7] = [
    "%Y-%m-%d",
    "%d/%m/%Y",
    "%d-%m-%Y",
    "%Y/%m/%d",
    "%d.%m.%Y",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
];

/// Reads a CSV file with every column typed as a string.
pub fn read_csv(path: &Path, skip_rows: usize, has_header: bool) -> Result<DataFrame> {
    if !path.exists() {
        return Err(PipelineError::MissingInput(path.to_path_buf()));
    }
    let df = CsvReadOptions::default()
        .with_has_header(has_header)
        .with_skip_rows(skip_rows)
        .with_infer_schema_length(Some(0))
        .with_ignore_errors(true)
        .map_parse_options(|opts| opts.with_truncate_ragged_lines(true))
        .try_into_reader_with_file_path(Some(path.to_path_buf()))?
        .finish()?;
    Ok(df)
}

/// Reads an in-memory CSV (an upload) with every column typed as a string.
pub fn read_csv_bytes(bytes: Vec<u8>) -> Result<DataFrame> {
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .with_ignore_errors(true)
        .map_parse_options(|opts| opts.with_truncate_ragged_lines(true))
        .into_reader_with_file_handle(Cursor::new(bytes))
        .finish()?;
    Ok(df)
}

pub fn write_csv(df: &mut DataFrame, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut file = File::create(path)?;
    CsvWriter::new(&mut file).include_header(true).finish(df)?;
    Ok(())
}

/// Finds a column by lowercased name: exact matches first, then substrings,
/// both in `needles` order.
pub fn find_column(df: &DataFrame, needles: &[&str]) -> Option<String> {
    let names: Vec<String> = df
        .get_column_names()
        .iter()
        .map(|name| name.to_string())
        .collect();
    let exact = needles.iter().find_map(|needle| {
        names
            .iter()
            .find(|name| normalize_header(name) == *needle)
            .cloned()
    });
    exact.or_else(|| {
        needles.iter().find_map(|needle| {
            names
                .iter()
                .find(|name| normalize_header(name).contains(needle))
                .cloned()
        })
    })
}

pub fn normalize_header(name: &str) -> String {
    name.trim()
        .trim_start_matches('\u{feff}')
        .replace(['\n', '\r'], " ")
        .to_lowercase()
}

pub fn string_values(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>> {
    let series = df
        .column(name)?
        .as_materialized_series()
        .cast(&DataType::String)?;
    Ok(series
        .str()?
        .into_iter()
        .map(|value| {
            value
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        })
        .collect())
}

pub fn f64_values(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>> {
    Ok(string_values(df, name)?
        .into_iter()
        .map(|value| value.and_then(|v| parse_number(&v)))
        .collect())
}

pub fn date_values(df: &DataFrame, name: &str) -> Result<Vec<Option<NaiveDate>>> {
    Ok(string_values(df, name)?
        .into_iter()
        .map(|value| value.and_then(|v| parse_date(&v)))
        .collect())
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            // Timestamps with trailing zones or fractions: keep the date part.
            raw.get(..10)
                .and_then(|head| NaiveDate::parse_from_str(head, DATE_FORMAT).ok())
        })
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// Parses messy numeric strings such as `"Rs. 1,250.00"`.
pub fn parse_number(raw: &str) -> Option<f64> {
    static NUMBER: OnceLock<Regex> = OnceLock::new();
    let cleaned = raw.replace(',', "");
    if let Ok(value) = cleaned.trim().parse::<f64>() {
        return value.is_finite().then_some(value);
    }
    let re = NUMBER.get_or_init(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("valid number regex"));
    re.find(&cleaned)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

/// Keeps the rows where `mask` is true.
pub fn filter_rows(df: &DataFrame, mask: &[bool]) -> Result<DataFrame> {
    let mask = BooleanChunked::new("mask".into(), mask);
    Ok(df.filter(&mask)?)
}

pub fn sort_by(df: &DataFrame, columns: &[&str]) -> Result<DataFrame> {
    Ok(df.sort(
        columns.iter().map(|c| c.to_string()).collect::<Vec<_>>(),
        SortMultipleOptions::default().with_maintain_order(true),
    )?)
}

pub fn f64_column(name: &str, values: Vec<f64>) -> Column {
    Column::new(name.into(), values)
}

pub fn i64_column(name: &str, values: Vec<i64>) -> Column {
    Column::new(name.into(), values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_number_handles_currency_strings() {
        assert_eq!(parse_number("1,250.00"), Some(1250.0));
        assert_eq!(parse_number("Rs. 480"), Some(480.0));
        assert_eq!(parse_number(" 12.5 "), Some(12.5));
        assert_eq!(parse_number("n/a"), None);
    }

    #[test]
    fn test_parse_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 8).unwrap();
        assert_eq!(parse_date("2024-03-08"), Some(expected));
        assert_eq!(parse_date("08/03/2024"), Some(expected));
        assert_eq!(parse_date("2024-03-08 00:00:00"), Some(expected));
        assert_eq!(parse_date("2024-03-08T00:00:00+05:30"), Some(expected));
        assert_eq!(parse_date("last week"), None);
    }

    #[test]
    fn test_find_column_is_case_insensitive() {
        let df = df!(
            "Festival Date" => ["2024-01-01"],
            "Festival_Name" => ["NewYear"],
        )
        .unwrap();
        assert_eq!(find_column(&df, &["date"]).as_deref(), Some("Festival Date"));
        assert_eq!(find_column(&df, &["name"]).as_deref(), Some("Festival_Name"));
        assert_eq!(find_column(&df, &["price"]), None);
    }

    #[test]
    fn test_csv_round_trip_reads_strings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.csv");
        let mut df = df!("date" => ["2024-01-01"], "price" => [10.5]).unwrap();
        write_csv(&mut df, &path).unwrap();

        let read = read_csv(&path, 0, true).unwrap();
        assert_eq!(f64_values(&read, "price").unwrap(), vec![Some(10.5)]);
        assert_eq!(
            date_values(&read, "date").unwrap(),
            vec![NaiveDate::from_ymd_opt(2024, 1, 1)]
        );
    }

    #[test]
    fn test_missing_file_is_missing_input() {
        let err = read_csv(Path::new("nope/none.csv"), 0, true).unwrap_err();
        assert!(matches!(err, PipelineError::MissingInput(_)));
    }
}
