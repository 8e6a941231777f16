//! Left-joins auxiliary date-keyed tables onto the price backbone.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use polars::prelude::*;
use tracing::{debug, info, instrument};

use crate::data_loader::ENTITY_COLUMN;
use crate::error::{PipelineError, Result};
use crate::table::{self, DATE_COLUMN};

const MISSING_NAME: &str = "None";

/// Merger joins weather, festival and other per-day tables onto observations.
pub struct Merger {
    target: String,
}

impl Merger {
    pub fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
        }
    }

    /// Backbone row count is preserved after deduplication; unmatched numeric
    /// fields become 0 and unmatched text fields `"None"`.
    #[instrument(skip_all, fields(rows = backbone.height(), tables = auxiliary.len()))]
    pub fn merge(&self, backbone: &DataFrame, auxiliary: &[DataFrame]) -> Result<DataFrame> {
        let mut merged = self.dedupe_backbone(backbone)?;
        let backbone_rows = merged.height();

        for aux in auxiliary {
            let (collapsed, kinds) = collapse_by_date(aux)?;
            let kinds: Vec<(String, bool)> = kinds
                .into_iter()
                .filter(|(name, _)| {
                    let clash = merged.get_column_index(name).is_some();
                    if clash {
                        debug!("Column '{name}' already on the backbone, not joining it");
                    }
                    !clash
                })
                .collect();
            let mut keep: Vec<Expr> = vec![col(DATE_COLUMN)];
            keep.extend(kinds.iter().map(|(name, _)| col(name.as_str())));
            let fills: Vec<Expr> = kinds
                .iter()
                .map(|(name, numeric)| {
                    if *numeric {
                        col(name.as_str()).fill_null(lit(0.0))
                    } else {
                        col(name.as_str()).fill_null(lit(MISSING_NAME))
                    }
                })
                .collect();

            merged = merged
                .lazy()
                .join(
                    collapsed.lazy().select(keep),
                    [col(DATE_COLUMN)],
                    [col(DATE_COLUMN)],
                    JoinArgs::new(JoinType::Left),
                )
                .with_columns(fills)
                .collect()?;
        }

        debug_assert_eq!(merged.height(), backbone_rows);
        let merged = table::sort_by(&merged, &[DATE_COLUMN, ENTITY_COLUMN])?;
        info!("Merged {} rows with {} columns", merged.height(), merged.width());
        Ok(merged)
    }

    /// One row per `(date, entity)`: the highest target wins, first seen on ties.
    /// Dates are rewritten in ISO form; rows without a date or entity are dropped.
    pub fn dedupe_backbone(&self, backbone: &DataFrame) -> Result<DataFrame> {
        for column in [DATE_COLUMN, ENTITY_COLUMN, self.target.as_str()] {
            if backbone.get_column_index(column).is_none() {
                return Err(PipelineError::MissingColumn {
                    column: column.to_string(),
                    source_name: "price backbone".to_string(),
                });
            }
        }
        let dates = table::date_values(backbone, DATE_COLUMN)?;
        let entities = table::string_values(backbone, ENTITY_COLUMN)?;
        let values = table::f64_values(backbone, &self.target)?;
        let value_at = |row: usize| values[row].unwrap_or(f64::NEG_INFINITY);

        let mut best: HashMap<(NaiveDate, &str), usize> = HashMap::new();
        for row in 0..backbone.height() {
            let (Some(date), Some(entity)) = (dates[row], entities[row].as_deref()) else {
                continue;
            };
            match best.entry((date, entity)) {
                Entry::Vacant(slot) => {
                    slot.insert(row);
                }
                Entry::Occupied(mut slot) => {
                    if value_at(row) > value_at(*slot.get()) {
                        slot.insert(row);
                    }
                }
            }
        }
        let mut mask = vec![false; backbone.height()];
        for row in best.values() {
            mask[*row] = true;
        }
        let dropped = backbone.height() - best.len();
        if dropped > 0 {
            debug!("Dropped {dropped} duplicate or undated backbone rows");
        }

        let mut deduped = table::filter_rows(backbone, &mask)?;
        let iso: Vec<String> = dates
            .iter()
            .zip(&mask)
            .filter(|(_, keep)| **keep)
            .map(|(date, _)| date.map(table::format_date).unwrap_or_default())
            .collect();
        deduped.with_column(Column::new(DATE_COLUMN.into(), iso))?;
        Ok(deduped)
    }
}

/// Collapses an auxiliary table to one row per date.
///
/// Columns whose values all parse as numbers keep the first value of the day;
/// text columns join the distinct values of the day with `;`. Returns the
/// collapsed frame and `(column, is_numeric)` for each non-date column.
pub fn collapse_by_date(aux: &DataFrame) -> Result<(DataFrame, Vec<(String, bool)>)> {
    let date_col =
        table::find_column(aux, &[DATE_COLUMN]).ok_or_else(|| PipelineError::MissingColumn {
            column: DATE_COLUMN.to_string(),
            source_name: "auxiliary table".to_string(),
        })?;
    let dates = table::date_values(aux, &date_col)?;
    let mut groups: BTreeMap<NaiveDate, Vec<usize>> = BTreeMap::new();
    for (row, date) in dates.iter().enumerate() {
        if let Some(date) = date {
            groups.entry(*date).or_default().push(row);
        }
    }

    let mut columns = vec![Column::new(
        DATE_COLUMN.into(),
        groups.keys().map(|d| table::format_date(*d)).collect::<Vec<_>>(),
    )];
    let mut kinds = Vec::new();
    for name in aux.get_column_names() {
        let name = name.to_string();
        if name == date_col {
            continue;
        }
        let raw = table::string_values(aux, &name)?;
        let numeric = raw.iter().flatten().all(|v| v.parse::<f64>().is_ok());
        let column = if numeric {
            let values: Vec<Option<f64>> = groups
                .values()
                .map(|rows| rows.iter().find_map(|r| raw[*r].as_deref()?.parse::<f64>().ok()))
                .collect();
            Column::new(name.as_str().into(), values)
        } else {
            let values: Vec<Option<String>> = groups
                .values()
                .map(|rows| {
                    let mut seen: Vec<&str> = Vec::new();
                    for value in rows.iter().filter_map(|r| raw[*r].as_deref()) {
                        if !seen.contains(&value) {
                            seen.push(value);
                        }
                    }
                    (!seen.is_empty()).then(|| seen.join(";"))
                })
                .collect();
            Column::new(name.as_str().into(), values)
        };
        columns.push(column);
        kinds.push((name, numeric));
    }
    Ok((DataFrame::new(columns)?, kinds))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backbone() -> DataFrame {
        df!(
            "date" => ["2024-01-02", "2024-01-01", "02/01/2024", "2024-01-01"],
            "entity" => ["Tuna", "Tuna", "Tuna", "Marlin"],
            "price" => ["100", "90", "130", "300"],
        )
        .unwrap()
    }

    fn festivals() -> DataFrame {
        df!(
            "date" => ["2024-01-01", "2024-01-01"],
            "festival_name" => ["NewYear_Jan1", "Duruthu Poya"],
            "is_festival" => ["1", "1"],
        )
        .unwrap()
    }

    fn weather() -> DataFrame {
        df!(
            "date" => ["2024-01-02"],
            "rainfall_sum" => ["12.5"],
        )
        .unwrap()
    }

    #[test]
    fn test_duplicates_keep_highest_value() {
        let merged = Merger::new("price").merge(&backbone(), &[]).unwrap();
        assert_eq!(merged.height(), 3);
        let prices = table::f64_values(&merged, "price").unwrap();
        // Sorted by (date, entity): Marlin 01-01, Tuna 01-01, Tuna 01-02.
        assert_eq!(prices, vec![Some(300.0), Some(90.0), Some(130.0)]);
    }

    #[test]
    fn test_unmatched_fields_are_filled() {
        let merged = Merger::new("price")
            .merge(&backbone(), &[festivals(), weather()])
            .unwrap();

        assert_eq!(merged.height(), 3);
        let names = table::string_values(&merged, "festival_name").unwrap();
        assert_eq!(names[0].as_deref(), Some("NewYear_Jan1;Duruthu Poya"));
        assert_eq!(names[2].as_deref(), Some("None"));
        let flags = table::f64_values(&merged, "is_festival").unwrap();
        assert_eq!(flags, vec![Some(1.0), Some(1.0), Some(0.0)]);
        let rain = table::f64_values(&merged, "rainfall_sum").unwrap();
        assert_eq!(rain, vec![Some(0.0), Some(0.0), Some(12.5)]);
    }

    #[test]
    fn test_merge_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let merger = Merger::new("price");
        let mut outputs = Vec::new();
        for run in 0..2 {
            let path = dir.path().join(format!("merged_{run}.csv"));
            let mut merged = merger.merge(&backbone(), &[festivals(), weather()]).unwrap();
            table::write_csv(&mut merged, &path).unwrap();
            outputs.push(std::fs::read(&path).unwrap());
        }
        assert_eq!(outputs[0], outputs[1]);
    }

    #[test]
    fn test_backbone_without_entity_is_rejected() {
        let df = df!("date" => ["2024-01-01"], "price" => ["1"]).unwrap();
        let err = Merger::new("price").merge(&df, &[]).unwrap_err();
        assert!(matches!(err, PipelineError::MissingColumn { .. }));
    }
}
