use anyhow::Result;
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    pub postgres_host: String,
    pub postgres_port: u16,
    pub postgres_db: String,
    pub postgres_user: String,
    pub postgres_password: String,
    pub db_pool_min: u32,
    pub db_pool_max: u32,
    pub websocket_port: u16,
    pub data_retention_hours: i64,
    pub cleanup_interval_seconds: u64,
    pub enable_automatic_cleanup: bool,
    pub duplicate_check_enabled: bool,
    pub duplicate_time_tolerance_seconds: i64,
    pub duplicate_coordinate_tolerance: f64,
    pub duplicate_search_window_days: i64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let postgres_host = env::var("POSTGRES_HOST").unwrap_or_else(|_| "localhost".to_string());
        let postgres_port = env::var("POSTGRES_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(5432);
        let postgres_db = env::var("POSTGRES_DB").unwrap_or_else(|_| "geotracker".to_string());
        let postgres_user = env::var("POSTGRES_USER").unwrap_or_else(|_| "geotracker".to_string());
        let postgres_password = env::var("POSTGRES_PASSWORD").unwrap_or_default();

        let db_pool_min = env::var("DB_POOL_MIN")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(2);
        let db_pool_max = env::var("DB_POOL_MAX")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(10)
            .max(db_pool_min);

        let websocket_port = env::var("WEBSOCKET_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(6789);

        let data_retention_hours = env::var("DATA_RETENTION_HOURS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(24);
        let cleanup_interval_seconds = env::var("CLEANUP_INTERVAL_SECONDS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(3600);
        let enable_automatic_cleanup = env_bool("ENABLE_AUTOMATIC_CLEANUP", true);

        let duplicate_check_enabled = env_bool("DUPLICATE_CHECK_ENABLED", true);
        let duplicate_time_tolerance_seconds = env::var("DUPLICATE_TIME_TOLERANCE_SECONDS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|v| *v >= 0)
            .unwrap_or(5);
        let duplicate_coordinate_tolerance = env::var("DUPLICATE_COORDINATE_TOLERANCE")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v >= 0.0)
            .unwrap_or(0.0001);
        let duplicate_search_window_days = env::var("DUPLICATE_SEARCH_WINDOW_DAYS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(1);

        Ok(Self {
            postgres_host,
            postgres_port,
            postgres_db,
            postgres_user,
            postgres_password,
            db_pool_min,
            db_pool_max,
            websocket_port,
            data_retention_hours,
            cleanup_interval_seconds,
            enable_automatic_cleanup,
            duplicate_check_enabled,
            duplicate_time_tolerance_seconds,
            duplicate_coordinate_tolerance,
            duplicate_search_window_days,
        })
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.data_retention_hours)
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::from_env().expect("config from empty env");
        assert_eq!(config.websocket_port, 6789);
        assert_eq!(config.data_retention_hours, 24);
        assert_eq!(config.cleanup_interval_seconds, 3600);
        assert!(config.enable_automatic_cleanup);
        assert!(config.duplicate_check_enabled);
        assert_eq!(config.duplicate_time_tolerance_seconds, 5);
        assert!((config.duplicate_coordinate_tolerance - 0.0001).abs() < f64::EPSILON);
        assert_eq!(config.duplicate_search_window_days, 1);
    }
}
