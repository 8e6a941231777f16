use std::collections::{BTreeMap, HashSet};

use chrono::{NaiveDate, Utc};
use polars::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{info, instrument, warn};

use crate::artifact::{EntityProfile, ModelArtifact, ARTIFACT_VERSION};
use crate::config::TrainerConfig;
use crate::data_loader::{
    COMMON_NAME_COLUMN, ENTITY_COLUMN, ENTITY_ID_COLUMN, MARKET_COLUMN, REGION_COLUMN,
};
use crate::encoder::CategoryEncoder;
use crate::error::{PipelineError, Result};
use crate::feature_engineering::model_feature_names;
use crate::festival::FestivalCalendar;
use crate::metrics::{EvaluationReport, ModelMetrics};
use crate::models::{Ensemble, FeatureMatrix, Model};
use crate::table::{self, DATE_COLUMN};
use crate::weather::{WeatherDay, WEATHER_COLUMNS};

/// Train and test row indices into the filtered feature table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Chronological when every row has a date, otherwise a seeded shuffle.
pub fn split_rows(dates: &[Option<NaiveDate>], test_fraction: f64, seed: u64) -> Result<Split> {
    let n = dates.len();
    if n < 2 {
        return Err(PipelineError::Training(format!("need at least 2 rows to split, got {n}")));
    }
    let test_len = ((n as f64 * test_fraction).round() as usize).clamp(1, n - 1);

    let mut order: Vec<usize> = (0..n).collect();
    if dates.iter().all(Option::is_some) {
        order.sort_by_key(|i| dates[*i]);
    } else {
        warn!("Rows without a date present, falling back to a seeded random split");
        order.shuffle(&mut StdRng::seed_from_u64(seed));
    }
    let test = order.split_off(n - test_len);
    Ok(Split { train: order, test })
}

pub struct Trainer {
    config: TrainerConfig,
    target: String,
}

impl Trainer {
    pub fn new(config: &TrainerConfig, target: &str) -> Self {
        Self {
            config: config.clone(),
            target: target.to_string(),
        }
    }

    /// Fits the ensemble on the engineered feature table and bundles
    /// everything inference needs into one artifact.
    #[instrument(skip_all, fields(rows = features.height()))]
    pub fn train(
        &self,
        features: &DataFrame,
        calendar: FestivalCalendar,
        rain_threshold: f64,
    ) -> Result<ModelArtifact> {
        for column in [ENTITY_COLUMN, self.target.as_str()] {
            if features.get_column_index(column).is_none() {
                return Err(PipelineError::MissingColumn {
                    column: column.to_string(),
                    source_name: "feature table".to_string(),
                });
            }
        }
        let targets = table::f64_values(features, &self.target)?;
        let keep: Vec<bool> = targets.iter().map(|t| t.is_some_and(|v| v > 0.0)).collect();
        let dropped = keep.iter().filter(|k| !**k).count();
        if dropped > 0 {
            warn!("Dropping {dropped} rows with a missing or non-positive {}", self.target);
        }
        let df = table::filter_rows(features, &keep)?;
        let targets: Vec<f64> = targets.into_iter().flatten().filter(|v| *v > 0.0).collect();
        if df.height() == 0 {
            return Err(PipelineError::NoPriceData("no rows with a positive target".to_string()));
        }

        let encoders = self.fit_encoders(&df)?;
        let code_columns: Vec<String> = encoders.iter().map(CategoryEncoder::code_column).collect();
        let feature_names = model_feature_names(&code_columns);
        let matrix = self.feature_matrix(&df, &encoders, &feature_names)?;

        let dates = match df.get_column_index(DATE_COLUMN) {
            Some(_) => table::date_values(&df, DATE_COLUMN)?,
            None => vec![None; df.height()],
        };
        let split = split_rows(&dates, self.config.test_fraction, self.config.seed)?;
        let pick = |rows: &[usize]| rows.iter().map(|i| targets[*i]).collect::<Vec<f64>>();
        let (train_x, train_y) = (matrix.select(&split.train), pick(&split.train));
        let (test_x, test_y) = (matrix.select(&split.test), pick(&split.test));
        info!(
            train = train_x.n_rows(),
            test = test_x.n_rows(),
            features = feature_names.len(),
            "Split feature table"
        );

        let mut ensemble = Ensemble::from_config(&self.config)?;
        ensemble.train(&train_x, &train_y)?;
        let report = evaluate(&ensemble, &test_x, &test_y, train_x.n_rows())?;

        let profiles = self.entity_profiles(&df, &encoders[0], &dates, &targets)?;
        let weather_baseline = weather_baseline(&df, &dates)?;
        Ok(ModelArtifact {
            version: ARTIFACT_VERSION,
            trained_at: Utc::now(),
            target: self.target.clone(),
            feature_names,
            encoders,
            ensemble,
            calendar,
            rain_threshold,
            weather_baseline,
            profiles,
            report,
        })
    }

    /// Entity encoder first, then market and region when the table has them.
    fn fit_encoders(&self, df: &DataFrame) -> Result<Vec<CategoryEncoder>> {
        let mut encoders = Vec::new();
        for column in [ENTITY_COLUMN, MARKET_COLUMN, REGION_COLUMN] {
            if df.get_column_index(column).is_none() {
                continue;
            }
            let values: Vec<String> = table::string_values(df, column)?
                .into_iter()
                .flatten()
                .collect();
            let encoder = CategoryEncoder::fit(column, values);
            if encoder.is_empty() && column != ENTITY_COLUMN {
                continue;
            }
            info!("Encoded {} distinct {column} values", encoder.len());
            encoders.push(encoder);
        }
        Ok(encoders)
    }

    fn feature_matrix(
        &self,
        df: &DataFrame,
        encoders: &[CategoryEncoder],
        names: &[String],
    ) -> Result<FeatureMatrix> {
        let mut columns: Vec<Vec<f64>> = Vec::with_capacity(names.len());
        for name in names {
            let values = match encoders.iter().find(|e| e.code_column() == *name) {
                Some(encoder) => table::string_values(df, encoder.column())?
                    .into_iter()
                    .map(|v| v.map_or(0.0, |v| f64::from(encoder.encode(&v))))
                    .collect(),
                None if df.get_column_index(name).is_some() => table::f64_values(df, name)?
                    .into_iter()
                    .map(|v| v.unwrap_or(0.0))
                    .collect(),
                None => {
                    warn!("Feature '{name}' missing from the table, using 0");
                    vec![0.0; df.height()]
                }
            };
            columns.push(values);
        }
        let rows = (0..df.height())
            .map(|row| columns.iter().map(|c| c[row]).collect())
            .collect();
        FeatureMatrix::new(names.to_vec(), rows)
    }

    fn entity_profiles(
        &self,
        df: &DataFrame,
        entity_encoder: &CategoryEncoder,
        dates: &[Option<NaiveDate>],
        targets: &[f64],
    ) -> Result<Vec<EntityProfile>> {
        let optional = |column: &str| -> Result<Vec<Option<String>>> {
            match df.get_column_index(column) {
                Some(_) => table::string_values(df, column),
                None => Ok(vec![None; df.height()]),
            }
        };
        let entities = table::string_values(df, ENTITY_COLUMN)?;
        let ids = optional(ENTITY_ID_COLUMN)?;
        let common = optional(COMMON_NAME_COLUMN)?;
        let markets = optional(MARKET_COLUMN)?;
        let regions = optional(REGION_COLUMN)?;

        let mut rows_by_entity: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (row, entity) in entities.iter().enumerate() {
            if let Some(entity) = entity.as_deref() {
                rows_by_entity.entry(entity).or_default().push(row);
            }
        }

        let history_len = self.config.history_len.max(1);
        let profiles = rows_by_entity
            .into_iter()
            .map(|(name, mut rows)| {
                rows.sort_by_key(|r| dates[*r]);
                let history: Vec<f64> = rows.iter().map(|r| targets[*r]).collect();
                let start = history.len().saturating_sub(history_len);
                let last = rows.iter().rev();
                EntityProfile {
                    name: name.to_string(),
                    code: entity_encoder.encode(name),
                    entity_id: last.clone().find_map(|r| {
                        ids[*r]
                            .as_deref()
                            .and_then(table::parse_number)
                            .map(|v| v as i64)
                    }),
                    common_name: last.clone().find_map(|r| common[*r].clone()),
                    market: most_frequent(&rows, &markets),
                    region: most_frequent(&rows, &regions),
                    last_date: rows.last().and_then(|r| dates[*r]),
                    history: history[start..].to_vec(),
                }
            })
            .collect();
        Ok(profiles)
    }
}

/// The most common value among `rows`, ties going to the smallest value.
fn most_frequent(rows: &[usize], values: &[Option<String>]) -> Option<String> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for value in rows.iter().filter_map(|r| values[*r].as_deref()) {
        *counts.entry(value).or_default() += 1;
    }
    let mut best: Option<(&str, usize)> = None;
    for (value, count) in counts {
        if best.map_or(true, |(_, top)| count > top) {
            best = Some((value, count));
        }
    }
    best.map(|(value, _)| value.to_string())
}

/// Mean of the per-day weather features, one row per distinct date.
fn weather_baseline(df: &DataFrame, dates: &[Option<NaiveDate>]) -> Result<WeatherDay> {
    let columns = WEATHER_COLUMNS
        .iter()
        .map(|name| match df.get_column_index(name) {
            Some(_) => table::f64_values(df, name),
            None => Ok(vec![None; df.height()]),
        })
        .collect::<Result<Vec<_>>>()?;
    let mut seen = HashSet::new();
    let days: Vec<WeatherDay> = (0..df.height())
        .filter(|row| dates[*row].map_or(true, |d| seen.insert(d)))
        .map(|row| {
            let value = |idx: usize| columns[idx][row].unwrap_or(0.0);
            WeatherDay {
                temp_c_mean: value(0),
                humidity_mean: value(1),
                wind_speed_max: value(2),
                rainfall_sum: value(3),
                bad_weather_any: value(4) > 0.0,
            }
        })
        .collect();
    Ok(WeatherDay::mean(&days))
}

fn evaluate(
    ensemble: &Ensemble,
    test_x: &FeatureMatrix,
    test_y: &[f64],
    train_rows: usize,
) -> Result<EvaluationReport> {
    let mut models = Vec::new();
    for (name, predictions) in ensemble.member_predictions(test_x)? {
        models.push(ModelMetrics::compute(name, &predictions, test_y)?);
    }
    models.push(ModelMetrics::compute("ensemble", &ensemble.predict(test_x)?, test_y)?);
    for m in &models {
        info!("{}: MAE {:.2}, RMSE {:.2}, R2 {:.4}", m.model, m.mae, m.rmse, m.r_squared);
    }
    Ok(EvaluationReport {
        train_rows,
        test_rows: test_y.len(),
        models,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::feature_engineering::FeatureEngineer;
    use crate::festival::FESTIVAL_COLUMNS;
    use approx::assert_relative_eq;
    use chrono::Duration;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    pub(crate) fn small_config() -> TrainerConfig {
        let mut config = TrainerConfig::default();
        config.forest.n_trees = 10;
        config.forest.max_depth = 6;
        config.boosting.iterations = 20;
        config.boosting.max_depth = 3;
        config
    }

    /// Two species over 60 days, Tuna consistently pricier than Marlin.
    pub(crate) fn feature_table() -> DataFrame {
        let mut dates = Vec::new();
        let mut entities = Vec::new();
        let mut ids = Vec::new();
        let mut prices = Vec::new();
        for day in 0..60 {
            let d = date(2024, 1, 1) + Duration::days(day);
            for (entity, id, base) in [("Tuna", "1", 1000.0), ("Marlin", "2", 400.0)] {
                dates.push(table::format_date(d));
                entities.push(entity.to_string());
                ids.push(id.to_string());
                prices.push(format!("{}", base + (day % 7) as f64 * 10.0));
            }
        }
        let mut df = df!(
            "date" => dates,
            "entity" => entities,
            "entity_id" => ids,
            "price" => prices,
        )
        .unwrap();
        let calendar = FestivalCalendar::default();
        df = calendar.annotate_frame(&df).unwrap();
        FeatureEngineer::new("price", 10.0).engineer_features(&df).unwrap()
    }

    #[test]
    fn test_chronological_split_holds_out_latest_rows() {
        let dates: Vec<Option<NaiveDate>> =
            (1..=10).rev().map(|d| Some(date(2024, 1, d))).collect();
        let split = split_rows(&dates, 0.2, 42).unwrap();
        assert_eq!(split.test.len(), 2);
        // Indices 0 and 1 hold the latest dates.
        assert!(split.test.contains(&0) && split.test.contains(&1));
    }

    #[test]
    fn test_random_split_is_seeded() {
        let dates = vec![None; 20];
        let a = split_rows(&dates, 0.25, 7).unwrap();
        let b = split_rows(&dates, 0.25, 7).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.test.len(), 5);
        assert!(split_rows(&[None], 0.2, 7).is_err());
    }

    #[test]
    fn test_train_builds_a_complete_artifact() {
        let table = feature_table();
        let artifact = Trainer::new(&small_config(), "price")
            .train(&table, FestivalCalendar::default(), 10.0)
            .unwrap();

        assert_eq!(artifact.feature_names[0], "entity_code");
        for name in FESTIVAL_COLUMNS.iter().take(7) {
            assert!(artifact.feature_names.iter().any(|f| f == name));
        }
        assert_eq!(artifact.report.test_rows, 24);
        assert_eq!(artifact.report.models.len(), 3);
        assert!(artifact.report.ensemble().is_some());

        let tuna = artifact.profile_by_id(1).unwrap();
        assert_eq!(tuna.name, "Tuna");
        assert_eq!(tuna.history.len(), 14);
        assert_eq!(tuna.last_date, Some(date(2024, 2, 29)));
    }

    #[test]
    fn test_profiles_keep_the_usual_market() {
        let (mut dates, mut entities, mut markets, mut prices, mut temps) =
            (Vec::new(), Vec::new(), Vec::new(), Vec::new(), Vec::new());
        for day in 0..30 {
            let d = table::format_date(date(2024, 1, 1) + Duration::days(day));
            let tuna_market = if day % 3 == 0 { "Galle" } else { "Colombo" };
            for (entity, market, price) in [("Tuna", tuna_market, 1000), ("Marlin", "Galle", 400)] {
                dates.push(d.clone());
                entities.push(entity.to_string());
                markets.push(market.to_string());
                prices.push(price.to_string());
                temps.push((27 + day % 3).to_string());
            }
        }
        let mut df = df!(
            "date" => dates,
            "entity" => entities,
            "market" => markets,
            "price" => prices,
            "temp_c_mean" => temps,
        )
        .unwrap();
        df = FestivalCalendar::default().annotate_frame(&df).unwrap();
        let df = FeatureEngineer::new("price", 10.0).engineer_features(&df).unwrap();
        let artifact = Trainer::new(&small_config(), "price")
            .train(&df, FestivalCalendar::default(), 10.0)
            .unwrap();

        assert_eq!(artifact.feature_names[1], "market_code");
        let tuna = artifact.profile_by_name("Tuna").unwrap();
        assert_eq!(tuna.market.as_deref(), Some("Colombo"));
        assert_eq!(tuna.region, None);
        let marlin = artifact.profile_by_name("Marlin").unwrap();
        assert_eq!(marlin.market.as_deref(), Some("Galle"));
        assert_relative_eq!(artifact.weather_baseline.temp_c_mean, 28.0);
    }

    #[test]
    fn test_most_frequent_breaks_ties_by_value() {
        let values = vec![Some("b".to_string()), Some("a".to_string()), None];
        assert_eq!(most_frequent(&[0, 1, 2], &values).as_deref(), Some("a"));
        assert_eq!(most_frequent(&[2], &values), None);
    }

    #[test]
    fn test_non_positive_targets_are_dropped() {
        let df = df!(
            "date" => ["2024-01-01", "2024-01-02"],
            "entity" => ["Tuna", "Tuna"],
            "price" => ["0", "-5"],
        )
        .unwrap();
        let err = Trainer::new(&small_config(), "price")
            .train(&df, FestivalCalendar::default(), 10.0)
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::NoPriceData(_)));
    }
}
