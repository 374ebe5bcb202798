use super::StoreResult;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool};

/// Session metadata carried by the first (or any later) frame of a session.
#[derive(Debug, Clone, Copy)]
pub struct SessionUpsert<'a> {
    pub session_id: &'a str,
    pub user_id: i32,
    pub event_name: Option<&'a str>,
    pub sport_type: Option<&'a str>,
    pub comment: Option<&'a str>,
    pub clothing: Option<&'a str>,
    pub start_date_time: Option<DateTime<Utc>>,
    pub min_distance_meters: Option<i32>,
    pub min_time_seconds: Option<i32>,
    pub voice_announcement_interval: Option<i32>,
}

/// Geocoded start/end addresses. All fields optional; frames patch whatever
/// they carry.
#[derive(Debug, Clone, Copy, Default)]
pub struct Geocoding<'a> {
    pub start_city: Option<&'a str>,
    pub start_country: Option<&'a str>,
    pub start_address: Option<&'a str>,
    pub end_city: Option<&'a str>,
    pub end_country: Option<&'a str>,
    pub end_address: Option<&'a str>,
}

impl Geocoding<'_> {
    pub fn any(&self) -> bool {
        self.start_city.is_some()
            || self.start_country.is_some()
            || self.start_address.is_some()
            || self.end_city.is_some()
            || self.end_country.is_some()
            || self.end_address.is_some()
    }
}

/// Upserts the session row. Later frames refresh `updated_at` and fill in
/// metadata fields that were absent when the session was first seen.
pub async fn ensure_session(
    conn: &mut PgConnection,
    session: &SessionUpsert<'_>,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO tracking_sessions (
            session_id, user_id, event_name, sport_type, comment, clothing,
            start_date_time, min_distance_meters, min_time_seconds,
            voice_announcement_interval
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (session_id) DO UPDATE SET
            user_id = EXCLUDED.user_id,
            event_name = COALESCE(tracking_sessions.event_name, EXCLUDED.event_name),
            sport_type = COALESCE(tracking_sessions.sport_type, EXCLUDED.sport_type),
            comment = COALESCE(tracking_sessions.comment, EXCLUDED.comment),
            clothing = COALESCE(tracking_sessions.clothing, EXCLUDED.clothing),
            start_date_time = COALESCE(tracking_sessions.start_date_time, EXCLUDED.start_date_time),
            min_distance_meters = COALESCE(tracking_sessions.min_distance_meters, EXCLUDED.min_distance_meters),
            min_time_seconds = COALESCE(tracking_sessions.min_time_seconds, EXCLUDED.min_time_seconds),
            voice_announcement_interval = COALESCE(tracking_sessions.voice_announcement_interval, EXCLUDED.voice_announcement_interval),
            updated_at = NOW()
        "#,
    )
    .bind(session.session_id)
    .bind(session.user_id)
    .bind(session.event_name)
    .bind(session.sport_type)
    .bind(session.comment)
    .bind(session.clothing)
    .bind(session.start_date_time)
    .bind(session.min_distance_meters)
    .bind(session.min_time_seconds)
    .bind(session.voice_announcement_interval)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Patches the geocoded address fields a frame carries.
pub async fn update_geocoding(
    conn: &mut PgConnection,
    session_id: &str,
    geocoding: &Geocoding<'_>,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        UPDATE tracking_sessions SET
            start_city = COALESCE($2, start_city),
            start_country = COALESCE($3, start_country),
            start_address = COALESCE($4, start_address),
            end_city = COALESCE($5, end_city),
            end_country = COALESCE($6, end_country),
            end_address = COALESCE($7, end_address),
            updated_at = NOW()
        WHERE session_id = $1
        "#,
    )
    .bind(session_id)
    .bind(geocoding.start_city)
    .bind(geocoding.start_country)
    .bind(geocoding.start_address)
    .bind(geocoding.end_city)
    .bind(geocoding.end_country)
    .bind(geocoding.end_address)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Deletes a session; points and laps cascade. Returns whether a row existed.
pub async fn delete_session(pool: &PgPool, session_id: &str) -> StoreResult<bool> {
    let result = sqlx::query("DELETE FROM tracking_sessions WHERE session_id = $1")
        .bind(session_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// A stored session that may cover the same activity as a bulk upload.
#[derive(Debug, Clone)]
pub struct DuplicateCandidate {
    pub session_id: String,
}

/// Sessions of this user whose start time lies inside the search window and
/// that have at least one stored point.
pub async fn duplicate_candidates(
    pool: &PgPool,
    user_id: i32,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> StoreResult<Vec<DuplicateCandidate>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT s.session_id
        FROM tracking_sessions s
        WHERE s.user_id = $1
          AND s.start_date_time BETWEEN $2 AND $3
          AND EXISTS (
              SELECT 1 FROM gps_tracking_points p
              WHERE p.session_id = s.session_id
          )
        ORDER BY s.start_date_time
        "#,
    )
    .bind(user_id)
    .bind(window_start)
    .bind(window_end)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(session_id,)| DuplicateCandidate { session_id })
        .collect())
}

/// A sampled point used for duplicate comparison.
#[derive(Debug, Clone, Copy)]
pub struct SamplePoint {
    pub latitude: f64,
    pub longitude: f64,
    pub received_at: DateTime<Utc>,
}

/// Fetches exactly the first, middle (by row number) and last stored points of
/// a session, ordered by `received_at`. Sessions with fewer than three points
/// return fewer rows.
pub async fn sample_points(pool: &PgPool, session_id: &str) -> StoreResult<Vec<SamplePoint>> {
    let rows: Vec<(Decimal, Decimal, DateTime<Utc>)> = sqlx::query_as(
        r#"
        WITH ordered AS (
            SELECT latitude, longitude, received_at,
                   ROW_NUMBER() OVER (ORDER BY received_at) AS rn,
                   COUNT(*) OVER () AS total
            FROM gps_tracking_points
            WHERE session_id = $1
        )
        SELECT latitude, longitude, received_at
        FROM ordered
        WHERE rn = 1 OR rn = (total + 1) / 2 OR rn = total
        ORDER BY rn
        "#,
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(latitude, longitude, received_at)| SamplePoint {
            latitude: latitude.to_f64().unwrap_or(0.0),
            longitude: longitude.to_f64().unwrap_or(0.0),
            received_at,
        })
        .collect())
}
