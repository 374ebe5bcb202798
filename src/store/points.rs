use super::sessions::{self, Geocoding, SessionUpsert};
use super::{identity, StoreResult};
use crate::frame::TelemetryFrame;
use crate::track::{self, LapTimeInfo, TrackPoint, WIRE_TIMESTAMP_FORMAT};
use chrono::{DateTime, Local, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool};

/// A normalized point row ready for insertion. Both write paths (live ingest
/// and bulk import) build one of these and go through `insert_point`.
#[derive(Debug, Clone, Default)]
pub struct PointRecord {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub horizontal_accuracy: Option<f64>,
    pub vertical_accuracy_meters: Option<f64>,
    pub number_of_satellites: Option<i32>,
    pub used_number_of_satellites: Option<i32>,
    pub current_speed: f64,
    pub average_speed: f64,
    pub max_speed: f64,
    pub moving_average_speed: f64,
    pub speed: Option<f64>,
    pub speed_accuracy_meters_per_second: Option<f64>,
    pub distance: f64,
    pub covered_distance: Option<f64>,
    pub cumulative_elevation_gain: Option<f64>,
    pub slope: Option<f64>,
    pub average_slope: Option<f64>,
    pub max_uphill_slope: Option<f64>,
    pub max_downhill_slope: Option<f64>,
    pub heart_rate: Option<i32>,
    pub lap: Option<i32>,
    pub temperature: Option<f64>,
    pub wind_speed: Option<f64>,
    pub wind_direction: Option<f64>,
    pub humidity: Option<i32>,
    pub weather_timestamp: Option<i64>,
    pub weather_code: Option<i32>,
    pub pressure: Option<f64>,
    pub pressure_accuracy: Option<i32>,
    pub altitude_from_pressure: Option<f64>,
    pub sea_level_pressure: Option<f64>,
}

impl PointRecord {
    /// Builds a row from a validated telemetry frame. Coordinates come in
    /// separately because the gate has already parsed them.
    pub fn from_frame(frame: &TelemetryFrame, latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            altitude: frame.altitude,
            horizontal_accuracy: frame.horizontal_accuracy,
            vertical_accuracy_meters: frame.vertical_accuracy_meters,
            number_of_satellites: frame.number_of_satellites.or(frame.satellites),
            used_number_of_satellites: frame.used_number_of_satellites,
            current_speed: frame.current_speed.unwrap_or(0.0),
            average_speed: frame.average_speed.unwrap_or(0.0),
            max_speed: frame.max_speed.unwrap_or(0.0),
            moving_average_speed: frame.moving_average_speed.unwrap_or(0.0),
            speed: frame.speed.or(frame.current_speed),
            speed_accuracy_meters_per_second: frame.speed_accuracy_meters_per_second,
            distance: frame.distance.unwrap_or(0.0),
            covered_distance: frame.covered_distance.or(frame.distance),
            cumulative_elevation_gain: frame.cumulative_elevation_gain,
            slope: frame.slope,
            average_slope: frame.average_slope,
            max_uphill_slope: frame.max_uphill_slope,
            max_downhill_slope: frame.max_downhill_slope,
            heart_rate: frame.heart_rate.filter(|hr| *hr > 0),
            lap: frame.lap,
            temperature: frame.temperature,
            wind_speed: frame.wind_speed,
            wind_direction: frame.wind_direction_degrees(),
            humidity: frame.humidity,
            weather_timestamp: frame.weather_timestamp,
            weather_code: frame.weather_code,
            pressure: frame.pressure,
            pressure_accuracy: frame.pressure_accuracy,
            altitude_from_pressure: frame.altitude_from_pressure,
            sea_level_pressure: frame.sea_level_pressure,
        }
    }
}

/// Persists one validated telemetry frame: user, session, device, point, laps
/// and geocoding all inside a single transaction. A failure rolls back the
/// whole frame; the caller logs and keeps going.
pub async fn persist_frame(
    pool: &PgPool,
    frame: &TelemetryFrame,
    session_id: &str,
    latitude: f64,
    longitude: f64,
    received_at: DateTime<Utc>,
) -> StoreResult<()> {
    let name = frame.producer_name().unwrap_or("");

    let mut tx = pool.begin().await?;

    let user_id = identity::get_or_create_user(
        &mut tx,
        name,
        frame.lastname.as_deref(),
        frame.birthdate.as_deref(),
        frame.height,
        frame.weight,
    )
    .await?;

    let start_date_time = frame
        .start_date_time
        .as_deref()
        .and_then(track::parse_iso_local)
        .map(|dt| dt.with_timezone(&Utc))
        .or(Some(received_at));

    sessions::ensure_session(
        &mut tx,
        &SessionUpsert {
            session_id,
            user_id,
            event_name: frame.event_name.as_deref(),
            sport_type: frame.sport_type.as_deref(),
            comment: frame.comment.as_deref(),
            clothing: frame.clothing.as_deref(),
            start_date_time,
            min_distance_meters: frame.min_distance_meters,
            min_time_seconds: frame.min_time_seconds,
            voice_announcement_interval: frame.voice_announcement_interval,
        },
    )
    .await?;

    let device_id =
        identity::get_or_create_heart_rate_device(&mut tx, frame.heart_rate_device.as_deref())
            .await?;

    let record = PointRecord::from_frame(frame, latitude, longitude);
    insert_point(&mut tx, session_id, device_id, &record, received_at).await?;

    for lap in &frame.lap_times {
        upsert_lap(
            &mut tx,
            session_id,
            Some(user_id),
            lap.lap_number,
            lap.start_time,
            lap.end_time,
            lap.distance,
        )
        .await?;
    }

    let geocoding = Geocoding {
        start_city: frame.start_city.as_deref(),
        start_country: frame.start_country.as_deref(),
        start_address: frame.start_address.as_deref(),
        end_city: frame.end_city.as_deref(),
        end_country: frame.end_country.as_deref(),
        end_address: frame.end_address.as_deref(),
    };
    if geocoding.any() {
        sessions::update_geocoding(&mut tx, session_id, &geocoding).await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Inserts one point row. No dedup at the point level; identical frames make
/// identical rows.
pub async fn insert_point(
    conn: &mut PgConnection,
    session_id: &str,
    device_id: Option<i32>,
    point: &PointRecord,
    received_at: DateTime<Utc>,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO gps_tracking_points (
            session_id, latitude, longitude, altitude, horizontal_accuracy,
            vertical_accuracy_meters, number_of_satellites,
            used_number_of_satellites, current_speed, average_speed, max_speed,
            moving_average_speed, speed, speed_accuracy_meters_per_second,
            distance, covered_distance, cumulative_elevation_gain, slope,
            average_slope, max_uphill_slope, max_downhill_slope, heart_rate,
            heart_rate_device_id, lap, temperature, wind_speed, wind_direction,
            humidity, weather_timestamp, weather_code, pressure,
            pressure_accuracy, altitude_from_pressure, sea_level_pressure,
            received_at
        ) VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
            $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28,
            $29, $30, $31, $32, $33, $34, $35
        )
        "#,
    )
    .bind(session_id)
    .bind(dec(point.latitude, 8))
    .bind(dec(point.longitude, 8))
    .bind(dec_opt(point.altitude, 4))
    .bind(dec_opt(point.horizontal_accuracy, 4))
    .bind(dec_opt(point.vertical_accuracy_meters, 4))
    .bind(point.number_of_satellites)
    .bind(point.used_number_of_satellites)
    .bind(dec(point.current_speed, 4))
    .bind(dec(point.average_speed, 4))
    .bind(dec(point.max_speed, 4))
    .bind(dec(point.moving_average_speed, 4))
    .bind(dec_opt(point.speed, 4))
    .bind(dec_opt(point.speed_accuracy_meters_per_second, 4))
    .bind(dec(point.distance, 4))
    .bind(dec_opt(point.covered_distance, 4))
    .bind(dec_opt(point.cumulative_elevation_gain, 4))
    .bind(dec_opt(point.slope, 2))
    .bind(dec_opt(point.average_slope, 2))
    .bind(dec_opt(point.max_uphill_slope, 2))
    .bind(dec_opt(point.max_downhill_slope, 2))
    .bind(point.heart_rate)
    .bind(device_id)
    .bind(point.lap.unwrap_or(0))
    .bind(dec_opt(point.temperature, 2))
    .bind(dec_opt(point.wind_speed, 2))
    .bind(dec_opt(point.wind_direction, 1))
    .bind(point.humidity)
    .bind(point.weather_timestamp)
    .bind(point.weather_code)
    .bind(dec_opt(point.pressure, 2))
    .bind(point.pressure_accuracy)
    .bind(dec_opt(point.altitude_from_pressure, 4))
    .bind(dec_opt(point.sea_level_pressure, 2))
    .bind(received_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Upserts a lap on `(session_id, lap_number)`; a repeated lap refreshes its
/// start, end and distance.
pub async fn upsert_lap(
    conn: &mut PgConnection,
    session_id: &str,
    user_id: Option<i32>,
    lap_number: i32,
    start_time: i64,
    end_time: i64,
    distance: f64,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO lap_times (session_id, user_id, lap_number, start_time, end_time, distance)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (session_id, lap_number) DO UPDATE SET
            start_time = EXCLUDED.start_time,
            end_time = EXCLUDED.end_time,
            distance = EXCLUDED.distance
        "#,
    )
    .bind(session_id)
    .bind(user_id)
    .bind(lap_number)
    .bind(start_time)
    .bind(end_time)
    .bind(dec(distance, 4))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Inserts a named point of interest attached to a session.
pub async fn insert_waypoint(
    conn: &mut PgConnection,
    session_id: &str,
    name: &str,
    latitude: f64,
    longitude: f64,
    elevation: Option<f64>,
    recorded_at: Option<DateTime<Utc>>,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO waypoints (session_id, name, latitude, longitude, elevation, recorded_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(session_id)
    .bind(name)
    .bind(dec(latitude, 8))
    .bind(dec(longitude, 8))
    .bind(dec_opt(elevation, 4))
    .bind(recorded_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// One row of the startup history load.
#[derive(Debug, sqlx::FromRow)]
pub struct HistoryRow {
    pub session_id: String,
    pub firstname: Option<String>,
    pub lastname: Option<String>,
    pub birthdate: Option<String>,
    pub height: Option<Decimal>,
    pub weight: Option<Decimal>,
    pub event_name: Option<String>,
    pub sport_type: Option<String>,
    pub comment: Option<String>,
    pub clothing: Option<String>,
    pub min_distance_meters: Option<i32>,
    pub min_time_seconds: Option<i32>,
    pub voice_announcement_interval: Option<i32>,
    pub latitude: Decimal,
    pub longitude: Decimal,
    pub altitude: Option<Decimal>,
    pub current_speed: Decimal,
    pub max_speed: Decimal,
    pub moving_average_speed: Decimal,
    pub average_speed: Decimal,
    pub distance: Decimal,
    pub heart_rate: Option<i32>,
    pub device_name: Option<String>,
    pub lap: Option<i32>,
    pub received_at: DateTime<Utc>,
}

impl HistoryRow {
    /// Reshapes a stored row into the broadcast wire shape.
    pub fn to_track_point(&self) -> TrackPoint {
        let name = self.firstname.clone().unwrap_or_default();
        TrackPoint {
            timestamp: self
                .received_at
                .with_timezone(&Local)
                .format(WIRE_TIMESTAMP_FORMAT)
                .to_string(),
            session_id: self.session_id.clone(),
            firstname: name.clone(),
            person: name,
            lastname: self.lastname.clone().filter(|v| !v.is_empty()),
            birthdate: self.birthdate.clone().filter(|v| !v.is_empty()),
            height: self.height.as_ref().and_then(Decimal::to_f64),
            weight: self.weight.as_ref().and_then(Decimal::to_f64),
            min_distance_meters: self.min_distance_meters,
            min_time_seconds: self.min_time_seconds,
            voice_announcement_interval: self.voice_announcement_interval,
            event_name: self.event_name.clone(),
            sport_type: self.sport_type.clone(),
            comment: self.comment.clone(),
            clothing: self.clothing.clone(),
            latitude: self.latitude.to_f64().unwrap_or(0.0),
            longitude: self.longitude.to_f64().unwrap_or(0.0),
            altitude: self.altitude.as_ref().and_then(Decimal::to_f64),
            horizontal_accuracy: None,
            vertical_accuracy_meters: None,
            number_of_satellites: None,
            satellites: None,
            used_number_of_satellites: None,
            current_speed: self.current_speed.to_f64().unwrap_or(0.0),
            average_speed: self.average_speed.to_f64().unwrap_or(0.0),
            max_speed: self.max_speed.to_f64().unwrap_or(0.0),
            moving_average_speed: self.moving_average_speed.to_f64().unwrap_or(0.0),
            speed: None,
            speed_accuracy_meters_per_second: None,
            distance: self.distance.to_f64().unwrap_or(0.0),
            covered_distance: None,
            cumulative_elevation_gain: None,
            slope: None,
            average_slope: None,
            max_uphill_slope: None,
            max_downhill_slope: None,
            lap: self.lap,
            heart_rate: self.heart_rate.filter(|hr| *hr > 0),
            heart_rate_device: self.device_name.clone(),
            temperature: None,
            wind_speed: None,
            wind_direction: None,
            humidity: None,
            weather_timestamp: None,
            weather_code: None,
            pressure: None,
            pressure_accuracy: None,
            altitude_from_pressure: None,
            sea_level_pressure: None,
        }
    }
}

/// Loads every point within the retention window, joined with its session,
/// user and device, ordered by session and time. The hub reshapes the flat
/// stream into per-session history.
pub async fn load_history_since(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
) -> StoreResult<Vec<HistoryRow>> {
    let rows = sqlx::query_as::<_, HistoryRow>(
        r#"
        SELECT p.session_id, u.firstname, u.lastname, u.birthdate, u.height,
               u.weight, s.event_name, s.sport_type, s.comment, s.clothing,
               s.min_distance_meters, s.min_time_seconds,
               s.voice_announcement_interval, p.latitude, p.longitude,
               p.altitude, p.current_speed, p.max_speed,
               p.moving_average_speed, p.average_speed, p.distance,
               p.heart_rate, d.device_name, p.lap, p.received_at
        FROM gps_tracking_points p
        JOIN tracking_sessions s ON s.session_id = p.session_id
        LEFT JOIN users u ON u.user_id = s.user_id
        LEFT JOIN heart_rate_devices d ON d.device_id = p.heart_rate_device_id
        WHERE p.received_at >= $1
        ORDER BY p.session_id, p.received_at
        "#,
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Current laps of a session, ordered by lap number.
pub async fn session_laps(pool: &PgPool, session_id: &str) -> StoreResult<Vec<LapTimeInfo>> {
    let rows: Vec<(i32, i64, i64, Option<i64>, Decimal)> = sqlx::query_as(
        r#"
        SELECT lap_number, start_time, end_time, duration, distance
        FROM lap_times
        WHERE session_id = $1
        ORDER BY lap_number
        "#,
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(
            |(lap_number, start_time, end_time, duration, distance)| LapTimeInfo {
                lap_number,
                start_time,
                end_time,
                duration: duration.unwrap_or(end_time - start_time),
                distance: distance.to_f64().unwrap_or(1.0),
            },
        )
        .collect())
}

fn dec(value: f64, scale: u32) -> Decimal {
    Decimal::from_f64(value)
        .unwrap_or_default()
        .round_dp(scale)
}

fn dec_opt(value: Option<f64>, scale: u32) -> Option<Decimal> {
    value
        .filter(|v| v.is_finite())
        .and_then(Decimal::from_f64)
        .map(|d| d.round_dp(scale))
}
