use crate::track::{ReducedPoint, TrackPoint};
use serde::{Deserialize, Serialize};

/// A decoded inbound frame. Frames with a `type` key dispatch as control
/// frames; frames without one are treated as telemetry for backward
/// compatibility with producers that never send a discriminator.
#[derive(Debug)]
pub enum Inbound {
    Control(ControlFrame),
    Telemetry(Box<TelemetryFrame>),
    Unknown { frame_type: String },
    Malformed { error: String },
}

/// Decodes a raw text frame. Never panics and never fails the connection;
/// undecodable input is reported as `Malformed` for the caller to log.
pub fn decode(payload: &mut [u8]) -> Inbound {
    let value: serde_json::Value = match simd_json::serde::from_slice(payload) {
        Ok(value) => value,
        Err(err) => {
            return Inbound::Malformed {
                error: err.to_string(),
            }
        }
    };

    match value.get("type").and_then(|t| t.as_str()) {
        Some(frame_type) => match ControlFrame::deserialize(&value) {
            Ok(frame) => Inbound::Control(frame),
            Err(_) => Inbound::Unknown {
                frame_type: frame_type.to_string(),
            },
        },
        None => match TelemetryFrame::deserialize(value) {
            Ok(frame) => Inbound::Telemetry(Box::new(frame)),
            Err(err) => Inbound::Malformed {
                error: err.to_string(),
            },
        },
    }
}

/// Control frames observers and producers send, keyed on `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ControlFrame {
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "request_history")]
    RequestHistory,
    #[serde(rename = "cleanup_memory")]
    CleanupMemory,
    #[serde(rename = "get_active_users")]
    GetActiveUsers,
    #[serde(rename = "follow_users")]
    FollowUsers {
        #[serde(rename = "sessionIds", default)]
        session_ids: Vec<String>,
    },
    #[serde(rename = "unfollow_users")]
    UnfollowUsers,
    #[serde(rename = "request_sessions")]
    RequestSessions,
    #[serde(rename = "delete_session")]
    DeleteSession {
        #[serde(rename = "sessionId", default)]
        session_id: Option<String>,
    },
    #[serde(rename = "get_weather")]
    GetWeather {
        #[serde(rename = "sessionId", default)]
        session_id: Option<String>,
    },
    #[serde(rename = "get_weather_summary")]
    GetWeatherSummary {
        #[serde(rename = "sessionId", default)]
        session_id: Option<String>,
    },
    #[serde(rename = "get_barometer")]
    GetBarometer {
        #[serde(rename = "sessionId", default)]
        session_id: Option<String>,
    },
    #[serde(rename = "get_barometer_summary")]
    GetBarometerSummary {
        #[serde(rename = "sessionId", default)]
        session_id: Option<String>,
    },
}

/// A numeric wire value that historical producers sometimes send as a string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum NumberLike {
    Number(f64),
    Text(String),
}

impl NumberLike {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            NumberLike::Number(value) => Some(*value),
            NumberLike::Text(raw) => raw.trim().parse::<f64>().ok(),
        }
    }
}

/// A raw telemetry frame as producers send it. Every field is optional at the
/// decode layer; required-key checks happen in `missing_required_fields` so a
/// partial frame is logged with what it lacks instead of failing decode.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryFrame {
    pub session_id: Option<String>,
    pub firstname: Option<String>,
    pub person: Option<String>,
    pub lastname: Option<String>,
    pub birthdate: Option<String>,
    pub height: Option<f64>,
    pub weight: Option<f64>,
    pub min_distance_meters: Option<i32>,
    pub min_time_seconds: Option<i32>,
    pub voice_announcement_interval: Option<i32>,
    pub event_name: Option<String>,
    pub sport_type: Option<String>,
    pub comment: Option<String>,
    pub clothing: Option<String>,
    pub latitude: Option<NumberLike>,
    pub longitude: Option<NumberLike>,
    pub altitude: Option<f64>,
    pub horizontal_accuracy: Option<f64>,
    pub vertical_accuracy_meters: Option<f64>,
    pub number_of_satellites: Option<i32>,
    pub satellites: Option<i32>,
    pub used_number_of_satellites: Option<i32>,
    pub current_speed: Option<f64>,
    pub average_speed: Option<f64>,
    pub max_speed: Option<f64>,
    pub moving_average_speed: Option<f64>,
    pub speed: Option<f64>,
    pub speed_accuracy_meters_per_second: Option<f64>,
    pub distance: Option<f64>,
    pub covered_distance: Option<f64>,
    pub cumulative_elevation_gain: Option<f64>,
    pub slope: Option<f64>,
    pub average_slope: Option<f64>,
    pub max_uphill_slope: Option<f64>,
    pub max_downhill_slope: Option<f64>,
    pub lap: Option<i32>,
    pub heart_rate: Option<i32>,
    pub heart_rate_device: Option<String>,
    pub temperature: Option<f64>,
    pub wind_speed: Option<f64>,
    pub wind_direction: Option<NumberLike>,
    pub humidity: Option<i32>,
    pub weather_timestamp: Option<i64>,
    pub weather_code: Option<i32>,
    pub pressure: Option<f64>,
    pub pressure_accuracy: Option<i32>,
    pub altitude_from_pressure: Option<f64>,
    pub sea_level_pressure: Option<f64>,
    pub current_date_time: Option<String>,
    pub formatted_timestamp: Option<String>,
    pub start_date_time: Option<String>,
    #[serde(default)]
    pub lap_times: Vec<LapTimeFrame>,
    pub start_city: Option<String>,
    pub start_country: Option<String>,
    pub start_address: Option<String>,
    pub end_city: Option<String>,
    pub end_country: Option<String>,
    pub end_address: Option<String>,
}

impl TelemetryFrame {
    /// The producer name, preferring `firstname` over the legacy `person` key.
    pub fn producer_name(&self) -> Option<&str> {
        self.firstname
            .as_deref()
            .or(self.person.as_deref())
            .filter(|name| !name.is_empty())
    }

    /// Names of required keys that are absent or null. An empty result means
    /// the frame passes schema validation.
    pub fn missing_required_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.session_id.as_deref().is_none_or(str::is_empty) {
            missing.push("sessionId");
        }
        if self.producer_name().is_none() {
            missing.push("firstname or person");
        }
        if self.latitude.is_none() {
            missing.push("latitude");
        }
        if self.longitude.is_none() {
            missing.push("longitude");
        }
        if self.distance.is_none() {
            missing.push("distance");
        }
        if self.current_speed.is_none() {
            missing.push("currentSpeed");
        }
        if self.max_speed.is_none() {
            missing.push("maxSpeed");
        }
        if self.moving_average_speed.is_none() {
            missing.push("movingAverageSpeed");
        }
        if self.average_speed.is_none() {
            missing.push("averageSpeed");
        }
        missing
    }

    pub fn wind_direction_degrees(&self) -> Option<f64> {
        self.wind_direction.as_ref().and_then(NumberLike::as_f64)
    }
}

/// A lap entry on a telemetry frame.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LapTimeFrame {
    pub lap_number: i32,
    pub start_time: i64,
    pub end_time: i64,
    #[serde(default = "default_lap_distance")]
    pub distance: f64,
}

fn default_lap_distance() -> f64 {
    1.0
}

/// Session entry inside `session_list` frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "isActive")]
    pub is_active: bool,
}

/// Entry inside `active_users` frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveUser {
    pub session_id: String,
    pub person: String,
    pub last_update: String,
}

/// Non-GPS payload attached to an `invalid_coordinates` diagnostic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtherData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heart_rate: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slope: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_speed: Option<f64>,
    pub timestamp: String,
}

/// One weather sample from a session's stored points.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeatherSample {
    pub received_at: String,
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
}

/// Aggregates over a session's weather samples.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeatherSummary {
    pub sample_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_wind_speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_wind_speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_humidity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_sample_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sample_at: Option<String>,
}

/// One barometer sample from a session's stored points.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BarometerSample {
    pub received_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressure_accuracy: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude_from_pressure: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sea_level_pressure: Option<f64>,
}

/// Aggregates over a session's barometer samples.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BarometerSummary {
    pub sample_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_pressure: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_pressure: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_pressure: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_altitude_from_pressure: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_altitude_from_pressure: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_sample_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sample_at: Option<String>,
}

/// Every frame the server emits.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Pong,
    HistoryBatch {
        points: Vec<TrackPoint>,
    },
    SessionList {
        sessions: Vec<SessionInfo>,
    },
    HistoryComplete,
    Update {
        point: TrackPoint,
    },
    FollowedUserUpdate {
        point: ReducedPoint,
    },
    InvalidCoordinates {
        #[serde(rename = "sessionId")]
        session_id: String,
        reason: String,
        #[serde(rename = "otherData")]
        other_data: OtherData,
    },
    SessionDeleted {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    ActiveUsers {
        users: Vec<ActiveUser>,
    },
    CleanupResponse {
        success: bool,
        message: String,
    },
    FollowResponse {
        success: bool,
        following: Vec<String>,
    },
    UnfollowResponse {
        success: bool,
    },
    DeleteResponse {
        #[serde(rename = "sessionId")]
        session_id: String,
        success: bool,
        reason: String,
    },
    WeatherData {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Vec<WeatherSample>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    WeatherSummary {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        summary: Option<WeatherSummary>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    BarometerData {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Vec<BarometerSample>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    BarometerSummary {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        summary: Option<BarometerSummary>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl OutboundFrame {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_str(raw: &str) -> Inbound {
        let mut bytes = raw.as_bytes().to_vec();
        decode(&mut bytes)
    }

    #[test]
    fn json_ping_decodes_as_control() {
        assert!(matches!(
            decode_str(r#"{"type":"ping"}"#),
            Inbound::Control(ControlFrame::Ping)
        ));
    }

    #[test]
    fn unknown_type_is_reported_not_fatal() {
        match decode_str(r#"{"type":"warp_drive"}"#) {
            Inbound::Unknown { frame_type } => assert_eq!(frame_type, "warp_drive"),
            other => panic!("expected unknown frame, got {other:?}"),
        }
    }

    #[test]
    fn untyped_frame_decodes_as_telemetry() {
        let raw = r#"{"sessionId":"s1","firstname":"Ann","latitude":48.1818,
            "longitude":16.3607,"distance":0,"currentSpeed":0,"maxSpeed":0,
            "movingAverageSpeed":0,"averageSpeed":0}"#;
        match decode_str(raw) {
            Inbound::Telemetry(frame) => {
                assert!(frame.missing_required_fields().is_empty());
                assert_eq!(frame.producer_name(), Some("Ann"));
            }
            other => panic!("expected telemetry, got {other:?}"),
        }
    }

    #[test]
    fn person_satisfies_the_name_requirement() {
        let raw = r#"{"sessionId":"s1","person":"Ann","latitude":1.0,
            "longitude":2.0,"distance":0,"currentSpeed":0,"maxSpeed":0,
            "movingAverageSpeed":0,"averageSpeed":0}"#;
        match decode_str(raw) {
            Inbound::Telemetry(frame) => {
                assert!(frame.missing_required_fields().is_empty())
            }
            other => panic!("expected telemetry, got {other:?}"),
        }
    }

    #[test]
    fn missing_fields_are_named() {
        let raw = r#"{"sessionId":"s1","latitude":1.0}"#;
        match decode_str(raw) {
            Inbound::Telemetry(frame) => {
                let missing = frame.missing_required_fields();
                assert!(missing.contains(&"firstname or person"));
                assert!(missing.contains(&"longitude"));
                assert!(missing.contains(&"averageSpeed"));
                assert!(!missing.contains(&"latitude"));
            }
            other => panic!("expected telemetry, got {other:?}"),
        }
    }

    #[test]
    fn wind_direction_accepts_string_and_number() {
        let numeric = r#"{"windDirection": 270}"#;
        let text = r#"{"windDirection": "270.5"}"#;
        for (raw, expected) in [(numeric, 270.0), (text, 270.5)] {
            match decode_str(raw) {
                Inbound::Telemetry(frame) => {
                    assert_eq!(frame.wind_direction_degrees(), Some(expected))
                }
                other => panic!("expected telemetry, got {other:?}"),
            }
        }
    }

    #[test]
    fn malformed_json_is_reported() {
        assert!(matches!(
            decode_str("{not json"),
            Inbound::Malformed { .. }
        ));
    }

    #[test]
    fn outbound_frames_tag_with_snake_case_type() {
        let encoded = OutboundFrame::HistoryComplete.encode().expect("encodes");
        assert_eq!(encoded, r#"{"type":"history_complete"}"#);

        let encoded = OutboundFrame::DeleteResponse {
            session_id: "s1".to_string(),
            success: false,
            reason: "Cannot delete active session".to_string(),
        }
        .encode()
        .expect("encodes");
        assert!(encoded.contains(r#""type":"delete_response""#));
        assert!(encoded.contains(r#""sessionId":"s1""#));
    }
}
