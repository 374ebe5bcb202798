use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};

/// Wall-clock format used on the wire and as the history sort key.
pub const WIRE_TIMESTAMP_FORMAT: &str = "%d-%m-%Y %H:%M:%S";

const COORDINATE_SENTINEL: f64 = -999.0;

/// Outcome of coordinate validity gating for an inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinateCheck {
    Valid,
    Invalid { reason: String },
}

/// Classifies a coordinate pair. Invalid points stay out of the store and the
/// history cache but still count as session activity.
pub fn check_coordinates(latitude: f64, longitude: f64) -> CoordinateCheck {
    if !latitude.is_finite() || !longitude.is_finite() {
        return CoordinateCheck::Invalid {
            reason: "coordinates are not finite numbers".to_string(),
        };
    }
    if latitude == COORDINATE_SENTINEL || longitude == COORDINATE_SENTINEL {
        return CoordinateCheck::Invalid {
            reason: "coordinates carry the -999 no-fix sentinel".to_string(),
        };
    }
    if latitude == 0.0 && longitude == 0.0 {
        return CoordinateCheck::Invalid {
            reason: "coordinates are the 0,0 null island pair".to_string(),
        };
    }
    if !(-90.0..=90.0).contains(&latitude) {
        return CoordinateCheck::Invalid {
            reason: format!("latitude {latitude} outside [-90, 90]"),
        };
    }
    if !(-180.0..=180.0).contains(&longitude) {
        return CoordinateCheck::Invalid {
            reason: format!("longitude {longitude} outside [-180, 180]"),
        };
    }
    CoordinateCheck::Valid
}

/// The broadcast shape of a tracking point. This mirrors what observers see,
/// not the relational row; optional fields are omitted from the JSON frame
/// when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackPoint {
    pub timestamp: String,
    pub session_id: String,
    pub firstname: String,
    pub person: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lastname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub birthdate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_distance_meters: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_time_seconds: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_announcement_interval: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sport_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clothing: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub horizontal_accuracy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vertical_accuracy_meters: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_of_satellites: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub satellites: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_number_of_satellites: Option<i32>,
    pub current_speed: f64,
    pub average_speed: f64,
    pub max_speed: f64,
    pub moving_average_speed: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_accuracy_meters_per_second: Option<f64>,
    pub distance: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub covered_distance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cumulative_elevation_gain: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slope: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_slope: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_uphill_slope: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_downhill_slope: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lap: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heart_rate: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heart_rate_device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wind_speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wind_direction: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weather_timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weather_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressure_accuracy: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude_from_pressure: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sea_level_pressure: Option<f64>,
}

impl TrackPoint {
    /// Sort key for history replay and retention. Points the server produced
    /// always parse; anything else is treated as expired.
    pub fn parsed_timestamp(&self) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(&self.timestamp, WIRE_TIMESTAMP_FORMAT).ok()
    }

    /// The reduced shape sent to followers of a session.
    pub fn reduced(&self) -> ReducedPoint {
        ReducedPoint {
            timestamp: self.timestamp.clone(),
            session_id: self.session_id.clone(),
            firstname: self.firstname.clone(),
            person: self.person.clone(),
            latitude: self.latitude,
            longitude: self.longitude,
            altitude: self.altitude,
            current_speed: self.current_speed,
            average_speed: self.average_speed,
            max_speed: self.max_speed,
            moving_average_speed: self.moving_average_speed,
            distance: self.distance,
            heart_rate: self.heart_rate,
            heart_rate_device: self.heart_rate_device.clone(),
            lap: self.lap,
            lap_times: Vec::new(),
        }
    }
}

/// What followers receive on every update of a followed session: the live
/// essentials plus the session's current lap times.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReducedPoint {
    pub timestamp: String,
    pub session_id: String,
    pub firstname: String,
    pub person: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    pub current_speed: f64,
    pub average_speed: f64,
    pub max_speed: f64,
    pub moving_average_speed: f64,
    pub distance: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heart_rate: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heart_rate_device: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lap: Option<i32>,
    pub lap_times: Vec<LapTimeInfo>,
}

/// Lap rows as they appear inside `followed_user_update` frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LapTimeInfo {
    pub lap_number: i32,
    pub start_time: i64,
    pub end_time: i64,
    pub duration: i64,
    pub distance: f64,
}

/// Parses a producer ISO-8601 timestamp into local wall-clock time. Fractional
/// seconds are normalized to exactly six digits first; producers emit anything
/// from none to nine.
pub fn parse_iso_local(raw: &str) -> Option<DateTime<Local>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(with_offset) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(with_offset.with_timezone(&Local));
    }
    let normalized = normalize_fractional_seconds(trimmed);
    let naive = NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M:%S%.6f")
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S"))
        .ok()?;
    Local.from_local_datetime(&naive).single()
}

/// Parses a wire-format timestamp (`DD-MM-YYYY HH:MM:SS`) into local time.
pub fn parse_wire_local(raw: &str) -> Option<DateTime<Local>> {
    let naive = NaiveDateTime::parse_from_str(raw.trim(), WIRE_TIMESTAMP_FORMAT).ok()?;
    Local.from_local_datetime(&naive).single()
}

fn normalize_fractional_seconds(raw: &str) -> String {
    let Some(dot) = raw.find('.') else {
        return raw.to_string();
    };
    let (head, tail) = raw.split_at(dot);
    let digits: String = tail
        .chars()
        .skip(1)
        .take_while(|c| c.is_ascii_digit())
        .collect();
    let mut fraction = digits;
    fraction.truncate(6);
    while fraction.len() < 6 {
        fraction.push('0');
    }
    format!("{head}.{fraction}")
}
