use super::StoreResult;
use crate::frame::{BarometerSample, BarometerSummary, WeatherSample, WeatherSummary};
use crate::track::WIRE_TIMESTAMP_FORMAT;
use chrono::{DateTime, Local, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::PgPool;

fn wire_time(ts: DateTime<Utc>) -> String {
    ts.with_timezone(&Local)
        .format(WIRE_TIMESTAMP_FORMAT)
        .to_string()
}

fn opt_f64(value: Option<Decimal>) -> Option<f64> {
    value.as_ref().and_then(Decimal::to_f64)
}

/// Per-point weather series of a session, points without any weather sample
/// excluded.
pub async fn weather_series(pool: &PgPool, session_id: &str) -> StoreResult<Vec<WeatherSample>> {
    type Row = (
        DateTime<Utc>,
        Option<Decimal>,
        Option<Decimal>,
        Option<Decimal>,
        Option<i32>,
        Option<i64>,
        Option<i32>,
    );
    let rows: Vec<Row> = sqlx::query_as(
        r#"
        SELECT received_at, temperature, wind_speed, wind_direction, humidity,
               weather_timestamp, weather_code
        FROM gps_tracking_points
        WHERE session_id = $1
          AND (temperature IS NOT NULL OR wind_speed IS NOT NULL OR humidity IS NOT NULL)
        ORDER BY received_at
        "#,
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(
            |(received_at, temperature, wind_speed, wind_direction, humidity, ts, code)| {
                WeatherSample {
                    received_at: wire_time(received_at),
                    temperature: opt_f64(temperature),
                    wind_speed: opt_f64(wind_speed),
                    wind_direction: opt_f64(wind_direction),
                    humidity,
                    weather_timestamp: ts,
                    weather_code: code,
                }
            },
        )
        .collect())
}

/// Aggregates over a session's weather samples.
pub async fn weather_summary(pool: &PgPool, session_id: &str) -> StoreResult<WeatherSummary> {
    type Row = (
        i64,
        Option<Decimal>,
        Option<Decimal>,
        Option<Decimal>,
        Option<Decimal>,
        Option<Decimal>,
        Option<Decimal>,
        Option<DateTime<Utc>>,
        Option<DateTime<Utc>>,
    );
    let row: Row = sqlx::query_as(
        r#"
        SELECT COUNT(*), MIN(temperature), MAX(temperature), AVG(temperature),
               AVG(wind_speed), MAX(wind_speed), AVG(humidity),
               MIN(received_at), MAX(received_at)
        FROM gps_tracking_points
        WHERE session_id = $1
          AND (temperature IS NOT NULL OR wind_speed IS NOT NULL OR humidity IS NOT NULL)
        "#,
    )
    .bind(session_id)
    .fetch_one(pool)
    .await?;

    let (count, min_t, max_t, avg_t, avg_wind, max_wind, avg_humidity, first, last) = row;
    Ok(WeatherSummary {
        sample_count: count,
        min_temperature: opt_f64(min_t),
        max_temperature: opt_f64(max_t),
        avg_temperature: opt_f64(avg_t),
        avg_wind_speed: opt_f64(avg_wind),
        max_wind_speed: opt_f64(max_wind),
        avg_humidity: opt_f64(avg_humidity),
        first_sample_at: first.map(wire_time),
        last_sample_at: last.map(wire_time),
    })
}

/// Per-point barometer series of a session.
pub async fn barometer_series(
    pool: &PgPool,
    session_id: &str,
) -> StoreResult<Vec<BarometerSample>> {
    type Row = (
        DateTime<Utc>,
        Option<Decimal>,
        Option<i32>,
        Option<Decimal>,
        Option<Decimal>,
    );
    let rows: Vec<Row> = sqlx::query_as(
        r#"
        SELECT received_at, pressure, pressure_accuracy, altitude_from_pressure,
               sea_level_pressure
        FROM gps_tracking_points
        WHERE session_id = $1 AND pressure IS NOT NULL
        ORDER BY received_at
        "#,
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(
            |(received_at, pressure, pressure_accuracy, altitude, sea_level)| BarometerSample {
                received_at: wire_time(received_at),
                pressure: opt_f64(pressure),
                pressure_accuracy,
                altitude_from_pressure: opt_f64(altitude),
                sea_level_pressure: opt_f64(sea_level),
            },
        )
        .collect())
}

/// Aggregates over a session's barometer samples.
pub async fn barometer_summary(pool: &PgPool, session_id: &str) -> StoreResult<BarometerSummary> {
    type Row = (
        i64,
        Option<Decimal>,
        Option<Decimal>,
        Option<Decimal>,
        Option<Decimal>,
        Option<Decimal>,
        Option<DateTime<Utc>>,
        Option<DateTime<Utc>>,
    );
    let row: Row = sqlx::query_as(
        r#"
        SELECT COUNT(*), MIN(pressure), MAX(pressure), AVG(pressure),
               MIN(altitude_from_pressure), MAX(altitude_from_pressure),
               MIN(received_at), MAX(received_at)
        FROM gps_tracking_points
        WHERE session_id = $1 AND pressure IS NOT NULL
        "#,
    )
    .bind(session_id)
    .fetch_one(pool)
    .await?;

    let (count, min_p, max_p, avg_p, min_alt, max_alt, first, last) = row;
    Ok(BarometerSummary {
        sample_count: count,
        min_pressure: opt_f64(min_p),
        max_pressure: opt_f64(max_p),
        avg_pressure: opt_f64(avg_p),
        min_altitude_from_pressure: opt_f64(min_alt),
        max_altitude_from_pressure: opt_f64(max_alt),
        first_sample_at: first.map(wire_time),
        last_sample_at: last.map(wire_time),
    })
}
