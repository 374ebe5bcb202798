use super::StoreResult;
use sqlx::PgPool;

/// Bootstraps the relational schema. Every statement is `IF NOT EXISTS`; an
/// existing database is never altered or dropped.
pub(crate) async fn ensure_schema(pool: &PgPool) -> StoreResult<()> {
    for statement in SCHEMA_STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::info!("database schema ensured");
    Ok(())
}

const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        user_id SERIAL PRIMARY KEY,
        firstname VARCHAR(100) NOT NULL,
        lastname VARCHAR(100) NOT NULL DEFAULT '',
        birthdate VARCHAR(20) NOT NULL DEFAULT '',
        height NUMERIC(5, 2),
        weight NUMERIC(5, 2),
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (firstname, lastname, birthdate)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS heart_rate_devices (
        device_id SERIAL PRIMARY KEY,
        device_name VARCHAR(100) NOT NULL UNIQUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tracking_sessions (
        session_id VARCHAR(255) PRIMARY KEY,
        user_id INTEGER REFERENCES users(user_id) ON DELETE CASCADE,
        event_name VARCHAR(255),
        sport_type VARCHAR(100),
        comment TEXT,
        clothing VARCHAR(255),
        start_date_time TIMESTAMPTZ,
        min_distance_meters INTEGER,
        min_time_seconds INTEGER,
        voice_announcement_interval INTEGER,
        start_city VARCHAR(255),
        start_country VARCHAR(255),
        start_address TEXT,
        end_city VARCHAR(255),
        end_country VARCHAR(255),
        end_address TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS gps_tracking_points (
        id BIGSERIAL PRIMARY KEY,
        session_id VARCHAR(255) NOT NULL
            REFERENCES tracking_sessions(session_id) ON DELETE CASCADE,
        latitude NUMERIC(10, 8) NOT NULL,
        longitude NUMERIC(11, 8) NOT NULL,
        altitude NUMERIC(10, 4),
        horizontal_accuracy NUMERIC(8, 4),
        vertical_accuracy_meters NUMERIC(8, 4),
        number_of_satellites INTEGER,
        used_number_of_satellites INTEGER,
        current_speed NUMERIC(8, 4) NOT NULL,
        average_speed NUMERIC(8, 4) NOT NULL,
        max_speed NUMERIC(8, 4) NOT NULL,
        moving_average_speed NUMERIC(8, 4) NOT NULL,
        speed NUMERIC(8, 4),
        speed_accuracy_meters_per_second NUMERIC(8, 4),
        distance NUMERIC(12, 4) NOT NULL,
        covered_distance NUMERIC(12, 4),
        cumulative_elevation_gain NUMERIC(10, 4),
        slope NUMERIC(6, 2),
        average_slope NUMERIC(6, 2),
        max_uphill_slope NUMERIC(6, 2),
        max_downhill_slope NUMERIC(6, 2),
        heart_rate INTEGER,
        heart_rate_device_id INTEGER REFERENCES heart_rate_devices(device_id),
        lap INTEGER DEFAULT 0,
        temperature NUMERIC(5, 2),
        wind_speed NUMERIC(6, 2),
        wind_direction NUMERIC(5, 1),
        humidity INTEGER,
        weather_timestamp BIGINT,
        weather_code INTEGER,
        pressure NUMERIC(8, 2),
        pressure_accuracy INTEGER,
        altitude_from_pressure NUMERIC(10, 4),
        sea_level_pressure NUMERIC(8, 2),
        received_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS lap_times (
        id BIGSERIAL PRIMARY KEY,
        session_id VARCHAR(255) NOT NULL
            REFERENCES tracking_sessions(session_id) ON DELETE CASCADE,
        user_id INTEGER REFERENCES users(user_id),
        lap_number INTEGER NOT NULL,
        start_time BIGINT NOT NULL,
        end_time BIGINT NOT NULL,
        duration BIGINT GENERATED ALWAYS AS (end_time - start_time) STORED,
        distance NUMERIC(8, 4) NOT NULL DEFAULT 1.0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (session_id, lap_number)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS waypoints (
        id BIGSERIAL PRIMARY KEY,
        session_id VARCHAR(255)
            REFERENCES tracking_sessions(session_id) ON DELETE CASCADE,
        name VARCHAR(255) NOT NULL,
        latitude NUMERIC(10, 8) NOT NULL,
        longitude NUMERIC(11, 8) NOT NULL,
        elevation NUMERIC(10, 4),
        recorded_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS planned_events (
        planned_event_id SERIAL PRIMARY KEY,
        user_id INTEGER REFERENCES users(user_id),
        planned_event_name VARCHAR(255) NOT NULL,
        planned_event_date DATE,
        planned_event_type VARCHAR(100),
        planned_event_country VARCHAR(100),
        planned_event_city VARCHAR(100),
        planned_latitude DOUBLE PRECISION,
        planned_longitude DOUBLE PRECISION,
        is_entered_and_finished BOOLEAN DEFAULT FALSE,
        website VARCHAR(500),
        comment TEXT,
        reminder_date_time TIMESTAMPTZ,
        is_reminder_active BOOLEAN DEFAULT FALSE,
        is_recurring BOOLEAN DEFAULT FALSE,
        recurring_type VARCHAR(50),
        recurring_interval INTEGER DEFAULT 1,
        recurring_end_date DATE,
        recurring_days_of_week VARCHAR(50),
        created_by_user_id INTEGER REFERENCES users(user_id),
        is_public BOOLEAN DEFAULT TRUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS session_media (
        media_id SERIAL PRIMARY KEY,
        session_id VARCHAR(255) NOT NULL
            REFERENCES tracking_sessions(session_id) ON DELETE CASCADE,
        media_uuid VARCHAR(36) NOT NULL UNIQUE,
        media_type VARCHAR(10) NOT NULL,
        file_extension VARCHAR(10) NOT NULL,
        original_filename VARCHAR(255),
        file_size_bytes BIGINT,
        thumbnail_generated BOOLEAN DEFAULT FALSE,
        caption TEXT,
        sort_order INTEGER DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_gps_points_session \
     ON gps_tracking_points (session_id)",
    "CREATE INDEX IF NOT EXISTS idx_gps_points_received_at \
     ON gps_tracking_points (received_at)",
    "CREATE INDEX IF NOT EXISTS idx_gps_points_session_received \
     ON gps_tracking_points (session_id, received_at)",
    "CREATE INDEX IF NOT EXISTS idx_gps_points_location \
     ON gps_tracking_points (latitude, longitude)",
    "CREATE INDEX IF NOT EXISTS idx_gps_points_weather \
     ON gps_tracking_points (session_id, received_at) \
     WHERE temperature IS NOT NULL OR wind_speed IS NOT NULL OR humidity IS NOT NULL",
    "CREATE INDEX IF NOT EXISTS idx_gps_points_barometer \
     ON gps_tracking_points (session_id, received_at) \
     WHERE pressure IS NOT NULL",
    "CREATE INDEX IF NOT EXISTS idx_tracking_sessions_user \
     ON tracking_sessions (user_id)",
    "CREATE INDEX IF NOT EXISTS idx_tracking_sessions_start \
     ON tracking_sessions (start_date_time)",
    "CREATE INDEX IF NOT EXISTS idx_lap_times_session \
     ON lap_times (session_id)",
];
