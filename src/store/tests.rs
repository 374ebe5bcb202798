use super::{identity, points, sessions, Store};
use crate::duplicate::{
    DuplicateConfig, ImportError, ImportLap, ImportPoint, SessionImport, SessionImporter,
};
use crate::frame::{NumberLike, TelemetryFrame};
use anyhow::Result;
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use std::env;

// These tests run against a real PostgreSQL in a throwaway schema. They are
// skipped unless GEOTRACKER_INTEGRATION_TEST=1 and
// GEOTRACKER_TEST_DATABASE_URL are set.

fn integration_database_url() -> Option<String> {
    if env::var("GEOTRACKER_INTEGRATION_TEST").ok().as_deref() != Some("1") {
        return None;
    }
    env::var("GEOTRACKER_TEST_DATABASE_URL").ok()
}

async fn setup_test_store(database_url: &str, schema: &str) -> Result<Store> {
    let admin_pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(database_url)
        .await?;
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
        .execute(&admin_pool)
        .await?;
    drop(admin_pool);

    let schema_name = schema.to_string();
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .after_connect(move |conn, _meta| {
            let schema = schema_name.clone();
            Box::pin(async move {
                sqlx::query(&format!("SET search_path TO {schema}"))
                    .execute(conn)
                    .await?;
                Ok(())
            })
        })
        .connect(database_url)
        .await?;

    let store = Store::from_pool(pool);
    store.ensure_schema().await?;
    Ok(store)
}

async fn drop_test_schema(database_url: &str, schema: &str) -> Result<()> {
    let admin_pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(database_url)
        .await?;
    let _ = sqlx::query(&format!("DROP SCHEMA IF EXISTS {schema} CASCADE"))
        .execute(&admin_pool)
        .await;
    Ok(())
}

fn telemetry_frame(session_id: &str) -> TelemetryFrame {
    TelemetryFrame {
        session_id: Some(session_id.to_string()),
        firstname: Some("Ann".to_string()),
        latitude: Some(NumberLike::Number(48.1818)),
        longitude: Some(NumberLike::Number(16.3607)),
        distance: Some(0.0),
        current_speed: Some(0.0),
        average_speed: Some(0.0),
        max_speed: Some(0.0),
        moving_average_speed: Some(0.0),
        current_date_time: Some("2024-05-01T10:00:00.000000".to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn ingest_frame_creates_user_session_and_point() -> Result<()> {
    let Some(database_url) = integration_database_url() else {
        return Ok(());
    };
    let schema = format!("geotracker_test_ingest_{}", std::process::id());
    let store = setup_test_store(&database_url, &schema).await?;

    let frame = telemetry_frame("s1");
    points::persist_frame(store.pool(), &frame, "s1", 48.1818, 16.3607, Utc::now()).await?;

    let users: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE firstname = 'Ann'")
        .fetch_one(store.pool())
        .await?;
    assert_eq!(users, 1);
    let sessions_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM tracking_sessions WHERE session_id = 's1'")
            .fetch_one(store.pool())
            .await?;
    assert_eq!(sessions_count, 1);
    let point_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM gps_tracking_points WHERE session_id = 's1'")
            .fetch_one(store.pool())
            .await?;
    assert_eq!(point_count, 1);

    // The same frame again appends a second point row but neither a second
    // user nor a second session.
    points::persist_frame(store.pool(), &frame, "s1", 48.1818, 16.3607, Utc::now()).await?;
    let (users, sessions_count, point_count): (i64, i64, i64) = (
        sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(store.pool())
            .await?,
        sqlx::query_scalar("SELECT COUNT(*) FROM tracking_sessions")
            .fetch_one(store.pool())
            .await?,
        sqlx::query_scalar("SELECT COUNT(*) FROM gps_tracking_points")
            .fetch_one(store.pool())
            .await?,
    );
    assert_eq!((users, sessions_count, point_count), (1, 1, 2));

    drop_test_schema(&database_url, &schema).await?;
    Ok(())
}

#[tokio::test]
async fn get_or_create_user_returns_a_stable_id() -> Result<()> {
    let Some(database_url) = integration_database_url() else {
        return Ok(());
    };
    let schema = format!("geotracker_test_users_{}", std::process::id());
    let store = setup_test_store(&database_url, &schema).await?;

    let mut conn = store.pool().acquire().await?;
    let first =
        identity::get_or_create_user(&mut conn, "Ann", Some("Runner"), Some("1990-01-01"), None, None)
            .await?;
    let second =
        identity::get_or_create_user(&mut conn, "Ann", Some("Runner"), Some("1990-01-01"), None, None)
            .await?;
    assert_eq!(first, second);

    // Height arriving later patches only the given field.
    identity::get_or_create_user(
        &mut conn,
        "Ann",
        Some("Runner"),
        Some("1990-01-01"),
        Some(172.0),
        None,
    )
    .await?;
    let height: Option<rust_decimal::Decimal> =
        sqlx::query_scalar("SELECT height FROM users WHERE user_id = $1")
            .bind(first)
            .fetch_one(store.pool())
            .await?;
    assert!(height.is_some());

    // A different birthdate is a different identity.
    let third =
        identity::get_or_create_user(&mut conn, "Ann", Some("Runner"), Some("1991-01-01"), None, None)
            .await?;
    assert_ne!(first, third);
    drop(conn);

    drop_test_schema(&database_url, &schema).await?;
    Ok(())
}

#[tokio::test]
async fn heart_rate_device_names_are_normalized() -> Result<()> {
    let Some(database_url) = integration_database_url() else {
        return Ok(());
    };
    let schema = format!("geotracker_test_devices_{}", std::process::id());
    let store = setup_test_store(&database_url, &schema).await?;

    let mut conn = store.pool().acquire().await?;
    assert_eq!(
        identity::get_or_create_heart_rate_device(&mut conn, None).await?,
        None
    );
    assert_eq!(
        identity::get_or_create_heart_rate_device(&mut conn, Some("   ")).await?,
        None
    );
    assert_eq!(
        identity::get_or_create_heart_rate_device(&mut conn, Some("None")).await?,
        None
    );

    let first = identity::get_or_create_heart_rate_device(&mut conn, Some("  Polar H10  "))
        .await?
        .expect("device created");
    let second = identity::get_or_create_heart_rate_device(&mut conn, Some("Polar H10"))
        .await?
        .expect("device found");
    assert_eq!(first, second);
    drop(conn);

    drop_test_schema(&database_url, &schema).await?;
    Ok(())
}

#[tokio::test]
async fn lap_upsert_replaces_on_conflict_and_delete_cascades() -> Result<()> {
    let Some(database_url) = integration_database_url() else {
        return Ok(());
    };
    let schema = format!("geotracker_test_laps_{}", std::process::id());
    let store = setup_test_store(&database_url, &schema).await?;

    let mut frame = telemetry_frame("s1");
    frame.lap_times = vec![crate::frame::LapTimeFrame {
        lap_number: 1,
        start_time: 1_000,
        end_time: 61_000,
        distance: 1.0,
    }];
    points::persist_frame(store.pool(), &frame, "s1", 48.1818, 16.3607, Utc::now()).await?;

    frame.lap_times[0].end_time = 62_000;
    frame.lap_times[0].distance = 2.0;
    points::persist_frame(store.pool(), &frame, "s1", 48.1818, 16.3607, Utc::now()).await?;

    let laps = points::session_laps(store.pool(), "s1").await?;
    assert_eq!(laps.len(), 1);
    assert_eq!(laps[0].end_time, 62_000);
    assert_eq!(laps[0].duration, 61_000);
    assert!((laps[0].distance - 2.0).abs() < f64::EPSILON);

    let deleted = sessions::delete_session(store.pool(), "s1").await?;
    assert!(deleted);
    let (point_count, lap_count): (i64, i64) = (
        sqlx::query_scalar("SELECT COUNT(*) FROM gps_tracking_points")
            .fetch_one(store.pool())
            .await?,
        sqlx::query_scalar("SELECT COUNT(*) FROM lap_times")
            .fetch_one(store.pool())
            .await?,
    );
    assert_eq!((point_count, lap_count), (0, 0));

    drop_test_schema(&database_url, &schema).await?;
    Ok(())
}

#[tokio::test]
async fn history_load_reshapes_rows_into_wire_points() -> Result<()> {
    let Some(database_url) = integration_database_url() else {
        return Ok(());
    };
    let schema = format!("geotracker_test_history_{}", std::process::id());
    let store = setup_test_store(&database_url, &schema).await?;

    let mut frame = telemetry_frame("s1");
    frame.heart_rate = Some(140);
    frame.heart_rate_device = Some("Polar H10".to_string());
    points::persist_frame(store.pool(), &frame, "s1", 48.1818, 16.3607, Utc::now()).await?;

    let rows =
        points::load_history_since(store.pool(), Utc::now() - chrono::Duration::hours(24)).await?;
    assert_eq!(rows.len(), 1);
    let point = rows[0].to_track_point();
    assert_eq!(point.session_id, "s1");
    assert_eq!(point.firstname, "Ann");
    assert_eq!(point.person, "Ann");
    assert_eq!(point.heart_rate, Some(140));
    assert_eq!(point.heart_rate_device.as_deref(), Some("Polar H10"));
    assert!(point.parsed_timestamp().is_some());

    drop_test_schema(&database_url, &schema).await?;
    Ok(())
}

fn import_points_spanning(offset_seconds: i64, coordinate_offset: f64) -> Vec<ImportPoint> {
    // 100 points spanning T+offset .. T+offset+99s on a coordinate ramp.
    (0..100i64)
        .map(|i| {
            let total = offset_seconds + i;
            ImportPoint {
                latitude: 48.18 + (i as f64) * 1e-5 + coordinate_offset,
                longitude: 16.36 + (i as f64) * 1e-5 + coordinate_offset,
                received_at: Some(format!(
                    "2024-05-01T10:{:02}:{:02}",
                    total / 60,
                    total % 60
                )),
                distance: Some(i as f64 * 0.01),
                ..Default::default()
            }
        })
        .collect()
}

fn import_doc(session_id: &str, points: Vec<ImportPoint>) -> SessionImport {
    SessionImport {
        session_id: session_id.to_string(),
        firstname: "Ann".to_string(),
        lastname: Some("Runner".to_string()),
        birthdate: Some("1990-01-01".to_string()),
        height: None,
        weight: None,
        event_name: Some("Morning loop".to_string()),
        sport_type: Some("running".to_string()),
        comment: None,
        clothing: None,
        start_date_time: Some("2024-05-01T10:00:00".to_string()),
        min_distance_meters: None,
        min_time_seconds: None,
        voice_announcement_interval: None,
        gps_points: points,
        lap_times: vec![ImportLap {
            lap_number: 1,
            start_time: 0,
            end_time: 99_000,
            distance: 1.0,
        }],
        waypoints: Vec::new(),
    }
}

#[tokio::test]
async fn duplicate_detector_refuses_matching_upload_and_admits_shifted_one() -> Result<()> {
    let Some(database_url) = integration_database_url() else {
        return Ok(());
    };
    let schema = format!("geotracker_test_dup_{}", std::process::id());
    let store = setup_test_store(&database_url, &schema).await?;

    let config = DuplicateConfig {
        enabled: true,
        time_tolerance_seconds: 5,
        coordinate_tolerance: 0.0001,
        search_window_days: 1,
    };
    let importer = SessionImporter::new(store.clone(), config);

    // First upload: the user is unknown, so the check skips and the session
    // lands.
    let original = import_doc("s6-original", import_points_spanning(0, 0.0));
    importer.import(&original).await.expect("first import succeeds");

    // Same activity 4 s and 0.00005 degrees off: refused with the stored id.
    let near = import_doc("s6-upload", import_points_spanning(4, 0.00005));
    match importer.import(&near).await {
        Err(ImportError::Duplicate { session_id }) => assert_eq!(session_id, "s6-original"),
        other => panic!("expected duplicate refusal, got {other:?}"),
    }

    // Push the coordinates past the tolerance and the upload proceeds.
    let far = import_doc("s6-far", import_points_spanning(4, 0.0002));
    let outcome = importer.import(&far).await.expect("shifted import succeeds");
    assert_eq!(outcome.points_inserted, 100);

    drop_test_schema(&database_url, &schema).await?;
    Ok(())
}
