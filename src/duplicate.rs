use crate::config::Config;
use crate::store::points::{self, PointRecord};
use crate::store::sessions::{self, SamplePoint, SessionUpsert};
use crate::store::{identity, Store, StoreError};
use crate::track;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use thiserror::Error;

/// Tolerances for the duplicate detector, from the environment.
#[derive(Debug, Clone)]
pub struct DuplicateConfig {
    pub enabled: bool,
    pub time_tolerance_seconds: i64,
    pub coordinate_tolerance: f64,
    pub search_window_days: i64,
}

impl DuplicateConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            enabled: config.duplicate_check_enabled,
            time_tolerance_seconds: config.duplicate_time_tolerance_seconds,
            coordinate_tolerance: config.duplicate_coordinate_tolerance,
            search_window_days: config.duplicate_search_window_days,
        }
    }
}

/// A bulk upload of a whole session: metadata, points, laps, waypoints.
/// Field names match the export/REST collaborator's JSON documents.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionImport {
    pub session_id: String,
    pub firstname: String,
    #[serde(default)]
    pub lastname: Option<String>,
    #[serde(default)]
    pub birthdate: Option<String>,
    #[serde(default)]
    pub height: Option<f64>,
    #[serde(default)]
    pub weight: Option<f64>,
    #[serde(default)]
    pub event_name: Option<String>,
    #[serde(default)]
    pub sport_type: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub clothing: Option<String>,
    #[serde(default)]
    pub start_date_time: Option<String>,
    #[serde(default)]
    pub min_distance_meters: Option<i32>,
    #[serde(default)]
    pub min_time_seconds: Option<i32>,
    #[serde(default)]
    pub voice_announcement_interval: Option<i32>,
    #[serde(default)]
    pub gps_points: Vec<ImportPoint>,
    #[serde(default)]
    pub lap_times: Vec<ImportLap>,
    #[serde(default)]
    pub waypoints: Vec<ImportWaypoint>,
}

/// One uploaded point. Coordinates are required; everything else mirrors the
/// optional columns of the point row.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImportPoint {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub received_at: Option<String>,
    #[serde(default)]
    pub altitude: Option<f64>,
    #[serde(default)]
    pub horizontal_accuracy: Option<f64>,
    #[serde(default)]
    pub vertical_accuracy_meters: Option<f64>,
    #[serde(default)]
    pub number_of_satellites: Option<i32>,
    #[serde(default)]
    pub used_number_of_satellites: Option<i32>,
    #[serde(default)]
    pub current_speed: Option<f64>,
    #[serde(default)]
    pub average_speed: Option<f64>,
    #[serde(default)]
    pub max_speed: Option<f64>,
    #[serde(default)]
    pub moving_average_speed: Option<f64>,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub speed_accuracy_meters_per_second: Option<f64>,
    #[serde(default)]
    pub distance: Option<f64>,
    #[serde(default)]
    pub covered_distance: Option<f64>,
    #[serde(default)]
    pub cumulative_elevation_gain: Option<f64>,
    #[serde(default)]
    pub slope: Option<f64>,
    #[serde(default)]
    pub average_slope: Option<f64>,
    #[serde(default)]
    pub max_uphill_slope: Option<f64>,
    #[serde(default)]
    pub max_downhill_slope: Option<f64>,
    #[serde(default)]
    pub heart_rate: Option<i32>,
    #[serde(default)]
    pub lap: Option<i32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub wind_speed: Option<f64>,
    #[serde(default)]
    pub wind_direction: Option<f64>,
    #[serde(default)]
    pub humidity: Option<i32>,
    #[serde(default)]
    pub weather_timestamp: Option<i64>,
    #[serde(default)]
    pub weather_code: Option<i32>,
    #[serde(default)]
    pub pressure: Option<f64>,
    #[serde(default)]
    pub pressure_accuracy: Option<i32>,
    #[serde(default)]
    pub altitude_from_pressure: Option<f64>,
    #[serde(default)]
    pub sea_level_pressure: Option<f64>,
}

impl ImportPoint {
    fn parsed_received_at(&self) -> Option<DateTime<Utc>> {
        self.received_at
            .as_deref()
            .and_then(track::parse_iso_local)
            .map(|dt| dt.with_timezone(&Utc))
    }

    fn to_record(&self) -> PointRecord {
        PointRecord {
            latitude: self.latitude,
            longitude: self.longitude,
            altitude: self.altitude,
            horizontal_accuracy: self.horizontal_accuracy,
            vertical_accuracy_meters: self.vertical_accuracy_meters,
            number_of_satellites: self.number_of_satellites,
            used_number_of_satellites: self.used_number_of_satellites,
            current_speed: self.current_speed.unwrap_or(0.0),
            average_speed: self.average_speed.unwrap_or(0.0),
            max_speed: self.max_speed.unwrap_or(0.0),
            moving_average_speed: self.moving_average_speed.unwrap_or(0.0),
            speed: self.speed.or(self.current_speed),
            speed_accuracy_meters_per_second: self.speed_accuracy_meters_per_second,
            distance: self.distance.unwrap_or(0.0),
            covered_distance: self.covered_distance.or(self.distance),
            cumulative_elevation_gain: self.cumulative_elevation_gain,
            slope: self.slope,
            average_slope: self.average_slope,
            max_uphill_slope: self.max_uphill_slope,
            max_downhill_slope: self.max_downhill_slope,
            heart_rate: self.heart_rate.filter(|hr| *hr > 0),
            lap: self.lap,
            temperature: self.temperature,
            wind_speed: self.wind_speed,
            wind_direction: self.wind_direction,
            humidity: self.humidity,
            weather_timestamp: self.weather_timestamp,
            weather_code: self.weather_code,
            pressure: self.pressure,
            pressure_accuracy: self.pressure_accuracy,
            altitude_from_pressure: self.altitude_from_pressure,
            sea_level_pressure: self.sea_level_pressure,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImportLap {
    pub lap_number: i32,
    pub start_time: i64,
    pub end_time: i64,
    #[serde(default = "default_lap_distance")]
    pub distance: f64,
}

fn default_lap_distance() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImportWaypoint {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub elevation: Option<f64>,
    #[serde(default)]
    pub recorded_at: Option<String>,
}

/// Verdict of the duplicate check.
#[derive(Debug, Clone, PartialEq)]
pub enum DuplicateCheck {
    Unique,
    Duplicate { session_id: String },
    Skipped { reason: String },
}

/// Decides whether a previously-ingested session covers the same activity as
/// a candidate upload: the temporal extent and three sampled points must both
/// lie within configured tolerances. Intentionally cheap; one round trip per
/// candidate session, constant work each.
#[derive(Debug, Clone)]
pub struct DuplicateDetector {
    config: DuplicateConfig,
}

impl DuplicateDetector {
    pub fn new(config: DuplicateConfig) -> Self {
        Self { config }
    }

    pub async fn check(
        &self,
        store: &Store,
        user_id: i32,
        candidate: &[ImportPoint],
    ) -> Result<DuplicateCheck, StoreError> {
        if !self.config.enabled {
            return Ok(DuplicateCheck::Skipped {
                reason: "duplicate check disabled".to_string(),
            });
        }

        let mut sampled: Vec<(f64, f64, DateTime<Utc>)> = candidate
            .iter()
            .filter_map(|point| {
                point
                    .parsed_received_at()
                    .map(|ts| (point.latitude, point.longitude, ts))
            })
            .collect();
        if sampled.len() < 3 {
            return Ok(DuplicateCheck::Skipped {
                reason: format!(
                    "{} timestamped points, sampling needs at least 3",
                    sampled.len()
                ),
            });
        }
        sampled.sort_by_key(|(_, _, ts)| *ts);

        let cand_start = sampled[0].2;
        let window = ChronoDuration::days(self.config.search_window_days);
        let candidates = sessions::duplicate_candidates(
            store.pool(),
            user_id,
            cand_start - window,
            cand_start + window,
        )
        .await?;

        let cand_samples = [
            sampled[0],
            sampled[(sampled.len() + 1) / 2 - 1],
            sampled[sampled.len() - 1],
        ];

        for session in candidates {
            let existing = sessions::sample_points(store.pool(), &session.session_id).await?;
            if existing.len() < 3 {
                continue;
            }
            if self.matches(&cand_samples, &existing) {
                tracing::info!(
                    session = %session.session_id,
                    "candidate upload matches an existing session"
                );
                return Ok(DuplicateCheck::Duplicate {
                    session_id: session.session_id,
                });
            }
        }
        Ok(DuplicateCheck::Unique)
    }

    fn matches(&self, candidate: &[(f64, f64, DateTime<Utc>)], existing: &[SamplePoint]) -> bool {
        let tolerance = self.config.time_tolerance_seconds;
        let cand_start = candidate[0].2;
        let cand_end = candidate[2].2;
        let existing_start = existing[0].received_at;
        let existing_end = existing[2].received_at;

        let start_delta = (cand_start - existing_start).num_seconds().abs();
        let end_delta = (cand_end - existing_end).num_seconds().abs();
        let duration_delta = ((cand_end - cand_start) - (existing_end - existing_start))
            .num_seconds()
            .abs();
        if start_delta > tolerance || end_delta > tolerance || duration_delta > tolerance {
            return false;
        }

        candidate.iter().zip(existing.iter()).all(|(cand, stored)| {
            (cand.0 - stored.latitude).abs() <= self.config.coordinate_tolerance
                && (cand.1 - stored.longitude).abs() <= self.config.coordinate_tolerance
        })
    }
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("upload duplicates existing session {session_id}")]
    Duplicate { session_id: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct ImportOutcome {
    pub session_id: String,
    pub points_inserted: usize,
    pub laps_inserted: usize,
    pub waypoints_inserted: usize,
}

/// The bulk write path. Converges on the same store primitives as live
/// ingest; the duplicate detector guards only this path.
pub struct SessionImporter {
    store: Store,
    detector: DuplicateDetector,
}

impl SessionImporter {
    pub fn new(store: Store, config: DuplicateConfig) -> Self {
        Self {
            store,
            detector: DuplicateDetector::new(config),
        }
    }

    pub async fn import(&self, upload: &SessionImport) -> Result<ImportOutcome, ImportError> {
        // Duplicate detection runs against committed data before the write
        // transaction opens. A user never seen before has nothing to match.
        let known_user = identity::find_user(
            self.store.pool(),
            &upload.firstname,
            upload.lastname.as_deref(),
            upload.birthdate.as_deref(),
        )
        .await?;
        if let Some(user_id) = known_user {
            match self
                .detector
                .check(&self.store, user_id, &upload.gps_points)
                .await?
            {
                DuplicateCheck::Duplicate { session_id } => {
                    return Err(ImportError::Duplicate { session_id });
                }
                DuplicateCheck::Skipped { reason } => {
                    tracing::debug!(session = %upload.session_id, reason = %reason, "duplicate check skipped");
                }
                DuplicateCheck::Unique => {}
            }
        }

        let start_date_time = upload
            .start_date_time
            .as_deref()
            .and_then(track::parse_iso_local)
            .map(|dt| dt.with_timezone(&Utc));
        let now = Utc::now();

        let mut tx = self.store.pool().begin().await.map_err(StoreError::from)?;

        let user_id = identity::get_or_create_user(
            &mut tx,
            &upload.firstname,
            upload.lastname.as_deref(),
            upload.birthdate.as_deref(),
            upload.height,
            upload.weight,
        )
        .await?;

        sessions::ensure_session(
            &mut tx,
            &SessionUpsert {
                session_id: &upload.session_id,
                user_id,
                event_name: upload.event_name.as_deref(),
                sport_type: upload.sport_type.as_deref(),
                comment: upload.comment.as_deref(),
                clothing: upload.clothing.as_deref(),
                start_date_time,
                min_distance_meters: upload.min_distance_meters,
                min_time_seconds: upload.min_time_seconds,
                voice_announcement_interval: upload.voice_announcement_interval,
            },
        )
        .await?;

        for point in &upload.gps_points {
            let received_at = point.parsed_received_at().unwrap_or(now);
            points::insert_point(&mut tx, &upload.session_id, None, &point.to_record(), received_at)
                .await?;
        }
        for lap in &upload.lap_times {
            points::upsert_lap(
                &mut tx,
                &upload.session_id,
                Some(user_id),
                lap.lap_number,
                lap.start_time,
                lap.end_time,
                lap.distance,
            )
            .await?;
        }
        for waypoint in &upload.waypoints {
            let recorded_at = waypoint
                .recorded_at
                .as_deref()
                .and_then(track::parse_iso_local)
                .map(|dt| dt.with_timezone(&Utc));
            points::insert_waypoint(
                &mut tx,
                &upload.session_id,
                &waypoint.name,
                waypoint.latitude,
                waypoint.longitude,
                waypoint.elevation,
                recorded_at,
            )
            .await?;
        }

        tx.commit().await.map_err(StoreError::from)?;

        tracing::info!(
            session = %upload.session_id,
            points = upload.gps_points.len(),
            laps = upload.lap_times.len(),
            "session import committed"
        );
        Ok(ImportOutcome {
            session_id: upload.session_id.clone(),
            points_inserted: upload.gps_points.len(),
            laps_inserted: upload.lap_times.len(),
            waypoints_inserted: upload.waypoints.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn config(coordinate_tolerance: f64) -> DuplicateConfig {
        DuplicateConfig {
            enabled: true,
            time_tolerance_seconds: 5,
            coordinate_tolerance,
            search_window_days: 1,
        }
    }

    fn ts(offset_seconds: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap() + ChronoDuration::seconds(offset_seconds)
    }

    fn sample(latitude: f64, longitude: f64, offset_seconds: i64) -> SamplePoint {
        SamplePoint {
            latitude,
            longitude,
            received_at: ts(offset_seconds),
        }
    }

    #[test]
    fn matching_extent_and_coordinates_is_a_duplicate() {
        let detector = DuplicateDetector::new(config(0.0001));
        let candidate = [
            (48.18180, 16.36070, ts(0)),
            (48.19000, 16.37000, ts(50)),
            (48.18180, 16.36070, ts(99)),
        ];
        let existing = [
            sample(48.18185, 16.36075, 4),
            sample(48.19005, 16.37005, 52),
            sample(48.18185, 16.36075, 103),
        ];
        assert!(detector.matches(&candidate, &existing));
    }

    #[test]
    fn coordinate_delta_beyond_tolerance_is_unique() {
        let detector = DuplicateDetector::new(config(0.0001));
        let candidate = [
            (48.18180, 16.36070, ts(0)),
            (48.19000, 16.37000, ts(50)),
            (48.18180, 16.36070, ts(99)),
        ];
        let existing = [
            sample(48.18200, 16.36070, 4),
            sample(48.19020, 16.37000, 52),
            sample(48.18200, 16.36070, 103),
        ];
        assert!(!detector.matches(&candidate, &existing));
    }

    #[test]
    fn time_delta_beyond_tolerance_is_unique() {
        let detector = DuplicateDetector::new(config(0.0001));
        let candidate = [
            (48.18180, 16.36070, ts(0)),
            (48.19000, 16.37000, ts(50)),
            (48.18180, 16.36070, ts(99)),
        ];
        let existing = [
            sample(48.18180, 16.36070, 10),
            sample(48.19000, 16.37000, 60),
            sample(48.18180, 16.36070, 109),
        ];
        assert!(!detector.matches(&candidate, &existing));
    }

    #[test]
    fn middle_sample_index_matches_row_number_arithmetic() {
        // rn = (total + 1) / 2 in SQL, zero-based (len + 1) / 2 - 1 here.
        assert_eq!((3 + 1) / 2 - 1, 1);
        assert_eq!((4 + 1) / 2 - 1, 1);
        assert_eq!((5 + 1) / 2 - 1, 2);
        assert_eq!((100 + 1) / 2 - 1, 49);
    }

    #[tokio::test]
    async fn fewer_than_three_points_skips_the_check() {
        let detector = DuplicateDetector::new(config(0.0001));
        let points = vec![ImportPoint {
            latitude: 48.18,
            longitude: 16.36,
            received_at: Some("2024-05-01T10:00:00".to_string()),
            ..Default::default()
        }];
        // No store round trips happen before the length check, so a closed
        // pool is never touched.
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy("postgres://unused@localhost/unused")
            .expect("lazy pool");
        let store = Store::from_pool(pool);
        let verdict = detector.check(&store, 1, &points).await.expect("check runs");
        assert!(matches!(verdict, DuplicateCheck::Skipped { .. }));
    }
}
