//! Rebuilds model inputs for `(entity, date)` from a loaded artifact.

use std::collections::{BTreeMap, HashMap};

use chrono::{Duration, NaiveDate};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::artifact::{EntityProfile, ModelArtifact};
use crate::data_loader::{ENTITY_COLUMN, MARKET_COLUMN, REGION_COLUMN};
use crate::encoder::UNKNOWN_CODE;
use crate::error::{PipelineError, Result};
use crate::feature_engineering::{
    calendar_values, effect_values, trailing_lags, weather_values, CALENDAR_COLUMNS,
    EFFECT_COLUMNS, LAG_COLUMNS,
};
use crate::festival::FESTIVAL_COLUMNS;
use crate::models::{FeatureMatrix, Model};
use crate::table::{self, DATE_COLUMN};
use crate::weather::{WeatherDay, WEATHER_COLUMNS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityQuery {
    Id(i64),
    Name(String),
}

/// Where the price is quoted. Blank fields fall back to the entity's usual
/// market and region from training.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Venue {
    pub market: Option<String>,
    pub region: Option<String>,
}

/// The entity a prediction is made for. `profile` is `None` for names the
/// model never saw; those predict with code 0 and no price history.
#[derive(Debug, Clone)]
pub struct ResolvedEntity<'a> {
    pub name: String,
    pub code: u32,
    pub profile: Option<&'a EntityProfile>,
    pub market: Option<String>,
    pub region: Option<String>,
    /// `(code column, code)` for the market and region encoders in the artifact.
    pub venue_codes: Vec<(String, u32)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PricePoint {
    pub date: String,
    pub price: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PredictionResult {
    pub entity: String,
    pub code: u32,
    pub entity_id: Option<i64>,
    pub common_name: Option<String>,
    pub market: Option<String>,
    pub region: Option<String>,
    pub date: String,
    pub predicted: f64,
    pub series: Vec<PricePoint>,
}

pub struct Predictor<'a> {
    artifact: &'a ModelArtifact,
    forecast: Option<&'a BTreeMap<NaiveDate, WeatherDay>>,
}

impl<'a> Predictor<'a> {
    pub fn new(artifact: &'a ModelArtifact) -> Self {
        Self {
            artifact,
            forecast: None,
        }
    }

    /// Uses forecast weather for the days it covers.
    pub fn with_forecast(mut self, forecast: &'a BTreeMap<NaiveDate, WeatherDay>) -> Self {
        self.forecast = Some(forecast);
        self
    }

    /// Forecast weather for `date`, else the training-period mean.
    pub fn weather_for(&self, date: NaiveDate) -> &'a WeatherDay {
        self.forecast
            .and_then(|f| f.get(&date))
            .unwrap_or(&self.artifact.weather_baseline)
    }

    /// Unknown ids are an error; unknown names fall back to code 0.
    pub fn resolve(&self, query: &EntityQuery, venue: &Venue) -> Result<ResolvedEntity<'a>> {
        let (name, code, profile) = match query {
            EntityQuery::Id(id) => {
                let profile = self
                    .artifact
                    .profile_by_id(*id)
                    .ok_or_else(|| PipelineError::UnknownEntity(format!("fish_id {id}")))?;
                (profile.name.clone(), profile.code, Some(profile))
            }
            EntityQuery::Name(name) => match self.artifact.profile_by_name(name) {
                Some(profile) => (profile.name.clone(), profile.code, Some(profile)),
                None => {
                    let code = self
                        .artifact
                        .encoder(ENTITY_COLUMN)
                        .map_or(UNKNOWN_CODE, |e| e.encode_or_code(name));
                    if code == UNKNOWN_CODE {
                        debug!("Unseen entity '{name}', predicting with the unknown code");
                    }
                    let profile = self
                        .artifact
                        .profiles
                        .iter()
                        .find(|p| code != UNKNOWN_CODE && p.code == code);
                    let name = profile.map_or_else(|| name.trim().to_string(), |p| p.name.clone());
                    (name, code, profile)
                }
            },
        };
        Ok(self.with_venue(name, code, profile, venue))
    }

    fn with_venue(
        &self,
        name: String,
        code: u32,
        profile: Option<&'a EntityProfile>,
        venue: &Venue,
    ) -> ResolvedEntity<'a> {
        let pick = |requested: &Option<String>, usual: Option<&String>| {
            requested
                .as_ref()
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .or_else(|| usual.cloned())
        };
        let market = pick(&venue.market, profile.and_then(|p| p.market.as_ref()));
        let region = pick(&venue.region, profile.and_then(|p| p.region.as_ref()));
        let venue_codes = [(MARKET_COLUMN, &market), (REGION_COLUMN, &region)]
            .into_iter()
            .filter_map(|(column, value)| {
                let encoder = self.artifact.encoder(column)?;
                let code = value
                    .as_deref()
                    .map_or(UNKNOWN_CODE, |v| encoder.encode_or_code(v));
                Some((encoder.code_column(), code))
            })
            .collect();
        ResolvedEntity {
            name,
            code,
            profile,
            market,
            region,
            venue_codes,
        }
    }

    /// Every derived feature for one day. Lags come from the entity's stored
    /// price history.
    pub fn feature_row(
        &self,
        entity: &ResolvedEntity<'_>,
        date: NaiveDate,
    ) -> HashMap<String, f64> {
        let mut row = HashMap::new();
        row.insert(format!("{ENTITY_COLUMN}_code"), f64::from(entity.code));
        for (column, code) in &entity.venue_codes {
            row.insert(column.clone(), f64::from(*code));
        }

        let festival = self.artifact.calendar.annotate(date);
        let weather = self.weather_for(date);
        let lags = trailing_lags(entity.profile.map_or(&[][..], |p| p.history.as_slice()));
        let effects = effect_values(
            festival.is_poya,
            festival.is_festival_day,
            weather.rainfall_sum,
            self.artifact.rain_threshold,
        );
        let groups: [(&[&str], Vec<f64>); 5] = [
            (&CALENDAR_COLUMNS, calendar_values(date).to_vec()),
            (&FESTIVAL_COLUMNS, festival.values().to_vec()),
            (&EFFECT_COLUMNS, effects.to_vec()),
            (&WEATHER_COLUMNS, weather_values(weather).to_vec()),
            (&LAG_COLUMNS, lags.to_vec()),
        ];
        for (names, values) in groups {
            for (name, value) in names.iter().zip(values) {
                row.insert(name.to_string(), value);
            }
        }
        row
    }

    /// Orders `row` by the artifact's feature names; absent features are 0.
    pub fn feature_vector(&self, row: &HashMap<String, f64>) -> Vec<f64> {
        self.artifact
            .feature_names
            .iter()
            .map(|name| row.get(name).copied().unwrap_or(0.0))
            .collect()
    }

    pub fn predict_dates(
        &self,
        entity: &ResolvedEntity<'_>,
        dates: &[NaiveDate],
    ) -> Result<Vec<f64>> {
        let rows = dates
            .iter()
            .map(|date| self.feature_vector(&self.feature_row(entity, *date)))
            .collect();
        let matrix = FeatureMatrix::new(self.artifact.feature_names.clone(), rows)?;
        self.artifact.ensemble.predict(&matrix)
    }

    /// Point estimate for `date` plus the trend over `date ± radius_days`.
    pub fn predict(
        &self,
        query: &EntityQuery,
        venue: &Venue,
        date: NaiveDate,
        radius_days: i64,
    ) -> Result<PredictionResult> {
        if radius_days < 0 {
            return Err(PipelineError::InvalidInput(format!(
                "series radius {radius_days} is negative"
            )));
        }
        let entity = self.resolve(query, venue)?;
        let dates = (-radius_days..=radius_days)
            .map(|offset| {
                Duration::try_days(offset)
                    .and_then(|delta| date.checked_add_signed(delta))
                    .ok_or_else(|| {
                        PipelineError::InvalidInput(format!(
                            "{date} {offset:+} days is out of range"
                        ))
                    })
            })
            .collect::<Result<Vec<NaiveDate>>>()?;
        let prices = self.predict_dates(&entity, &dates)?;
        let predicted = usize::try_from(radius_days)
            .ok()
            .and_then(|center| prices.get(center).copied())
            .ok_or_else(|| PipelineError::ModelPrediction("empty prediction series".to_string()))?;
        Ok(PredictionResult {
            entity: entity.name.clone(),
            code: entity.code,
            entity_id: entity.profile.and_then(|p| p.entity_id),
            common_name: entity.profile.and_then(|p| p.common_name.clone()),
            market: entity.market.clone(),
            region: entity.region.clone(),
            date: table::format_date(date),
            predicted,
            series: dates
                .iter()
                .zip(prices)
                .map(|(d, price)| PricePoint {
                    date: table::format_date(*d),
                    price,
                })
                .collect(),
        })
    }

    /// Predictions for every known entity, at its usual venue, on every day of
    /// `[start, end]`.
    pub fn forecast(&self, start: NaiveDate, end: NaiveDate) -> Result<DataFrame> {
        if end < start {
            return Err(PipelineError::InvalidInput(format!(
                "forecast range {start}..{end} is empty"
            )));
        }
        let days: Vec<NaiveDate> = start.iter_days().take_while(|d| *d <= end).collect();
        let mut dates = Vec::new();
        let mut entities = Vec::new();
        let mut prices = Vec::new();
        for profile in &self.artifact.profiles {
            let name = profile.name.clone();
            let entity = self.with_venue(name, profile.code, Some(profile), &Venue::default());
            for (day, price) in days.iter().zip(self.predict_dates(&entity, &days)?) {
                dates.push(table::format_date(*day));
                entities.push(profile.name.clone());
                prices.push(price);
            }
        }
        info!(
            "Forecast {} rows for {} entities",
            prices.len(),
            self.artifact.profiles.len()
        );
        Ok(DataFrame::new(vec![
            Column::new(DATE_COLUMN.into(), dates),
            Column::new(ENTITY_COLUMN.into(), entities),
            Column::new(format!("predicted_{}", self.artifact.target).into(), prices),
        ])?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature_engineering::FeatureEngineer;
    use crate::festival::FestivalCalendar;
    use crate::trainer::tests::{feature_table, small_config};
    use crate::trainer::Trainer;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn artifact() -> ModelArtifact {
        Trainer::new(&small_config(), "price")
            .train(&feature_table(), FestivalCalendar::default(), 10.0)
            .unwrap()
    }

    /// Tuna quoted mostly in Colombo and sometimes in Galle, on 28 °C days.
    fn market_artifact() -> ModelArtifact {
        let (mut dates, mut markets, mut prices) = (Vec::new(), Vec::new(), Vec::new());
        for day in 0..40 {
            dates.push(table::format_date(date(2024, 1, 1) + Duration::days(day)));
            let (market, price) = if day % 3 == 0 { ("Galle", "500") } else { ("Colombo", "1000") };
            markets.push(market);
            prices.push(price);
        }
        let df = df!(
            "date" => dates,
            "entity" => vec!["Tuna"; 40],
            "market" => markets,
            "price" => prices,
            "temp_c_mean" => vec!["28"; 40],
        )
        .unwrap();
        let df = FestivalCalendar::default().annotate_frame(&df).unwrap();
        let df = FeatureEngineer::new("price", 10.0).engineer_features(&df).unwrap();
        Trainer::new(&small_config(), "price")
            .train(&df, FestivalCalendar::default(), 10.0)
            .unwrap()
    }

    fn tuna() -> EntityQuery {
        EntityQuery::Name("Tuna".to_string())
    }

    #[test]
    fn test_inference_row_has_every_feature() {
        let artifact = artifact();
        let predictor = Predictor::new(&artifact);
        let entity = predictor.resolve(&tuna(), &Venue::default()).unwrap();
        let row = predictor.feature_row(&entity, date(2024, 4, 10));

        for name in &artifact.feature_names {
            assert!(row.contains_key(name), "missing {name}");
        }
        assert_eq!(row["days_to_festival"], 999.0);
        assert_eq!(predictor.feature_vector(&row).len(), artifact.feature_names.len());
    }

    #[test]
    fn test_market_code_defaults_to_the_usual_market() {
        let artifact = market_artifact();
        let predictor = Predictor::new(&artifact);
        let markets = artifact.encoder(MARKET_COLUMN).unwrap();
        let day = date(2024, 2, 15);

        let usual = predictor.resolve(&tuna(), &Venue::default()).unwrap();
        assert_eq!(usual.market.as_deref(), Some("Colombo"));
        let row = predictor.feature_row(&usual, day);
        assert_eq!(row["market_code"], f64::from(markets.encode("Colombo")));
        assert_ne!(row["market_code"], f64::from(UNKNOWN_CODE));

        let galle = Venue {
            market: Some("Galle".to_string()),
            region: None,
        };
        let row = predictor.feature_row(&predictor.resolve(&tuna(), &galle).unwrap(), day);
        assert_eq!(row["market_code"], f64::from(markets.encode("Galle")));

        let unseen = Venue {
            market: Some("Jaffna".to_string()),
            region: None,
        };
        let row = predictor.feature_row(&predictor.resolve(&tuna(), &unseen).unwrap(), day);
        assert_eq!(row["market_code"], f64::from(UNKNOWN_CODE));

        let result = predictor.predict(&tuna(), &galle, day, 0).unwrap();
        assert_eq!(result.market.as_deref(), Some("Galle"));
    }

    #[test]
    fn test_weather_uses_forecast_then_training_mean() {
        let artifact = market_artifact();
        let rainy = date(2024, 2, 20);
        let forecast = BTreeMap::from([(
            rainy,
            WeatherDay {
                temp_c_mean: 26.0,
                rainfall_sum: 30.0,
                ..WeatherDay::default()
            },
        )]);
        let predictor = Predictor::new(&artifact).with_forecast(&forecast);
        let entity = predictor.resolve(&tuna(), &Venue::default()).unwrap();

        let row = predictor.feature_row(&entity, rainy);
        assert_eq!(row["temp_c_mean"], 26.0);
        assert_eq!(row["weather_effect"], 1.0);

        let row = predictor.feature_row(&entity, date(2024, 2, 21));
        assert_eq!(row["temp_c_mean"], 28.0);
        assert_eq!(row["weather_effect"], 0.0);
    }

    #[test]
    fn test_unknown_name_still_predicts() {
        let artifact = artifact();
        let predictor = Predictor::new(&artifact);
        let result = predictor
            .predict(
                &EntityQuery::Name("swordfish".to_string()),
                &Venue::default(),
                date(2024, 3, 1),
                2,
            )
            .unwrap();

        assert_eq!(result.code, UNKNOWN_CODE);
        assert!(result.predicted.is_finite());
        assert_eq!(result.series.len(), 5);
        assert_eq!(result.series[2].date, "2024-03-01");
        assert_eq!(result.series[2].price, result.predicted);
    }

    #[test]
    fn test_series_outside_the_calendar_is_rejected() {
        let artifact = artifact();
        let predictor = Predictor::new(&artifact);
        let venue = Venue::default();

        let err = predictor.predict(&tuna(), &venue, NaiveDate::MAX, 1).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
        let err = predictor.predict(&tuna(), &venue, date(2024, 3, 1), -1).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
    }

    #[test]
    fn test_unknown_id_is_an_error() {
        let artifact = artifact();
        let err = Predictor::new(&artifact)
            .resolve(&EntityQuery::Id(99), &Venue::default())
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnknownEntity(_)));
    }

    #[test]
    fn test_known_entities_price_apart() {
        let artifact = artifact();
        let predictor = Predictor::new(&artifact);
        let venue = Venue::default();
        let tuna = predictor.predict(&EntityQuery::Id(1), &venue, date(2024, 3, 1), 0).unwrap();
        let marlin = predictor.predict(&EntityQuery::Id(2), &venue, date(2024, 3, 1), 0).unwrap();
        assert_eq!(tuna.entity, "Tuna");
        assert!(tuna.predicted > marlin.predicted);
    }

    #[test]
    fn test_forecast_covers_every_entity_and_day() {
        let artifact = artifact();
        let predictor = Predictor::new(&artifact);
        let df = predictor.forecast(date(2024, 3, 1), date(2024, 3, 7)).unwrap();
        assert_eq!(df.height(), 14);
        assert!(df.column("predicted_price").is_ok());
        assert!(predictor.forecast(date(2024, 3, 7), date(2024, 3, 1)).is_err());
    }
}
