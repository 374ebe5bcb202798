mod registry;
mod reset;

use crate::frame::{
    ActiveUser, NumberLike, OtherData, OutboundFrame, SessionInfo, TelemetryFrame,
};
use crate::store::{points, sessions, Store};
use crate::track::{
    self, check_coordinates, CoordinateCheck, TrackPoint, WIRE_TIMESTAMP_FORMAT,
};
use chrono::{DateTime, Duration as ChronoDuration, Local, Utc};
use registry::SessionRegistry;
use reset::ResetDetector;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

pub use registry::RetentionSweep;

/// Observers get at most one `active_users` refresh per window outside of
/// activation edges.
const ACTIVE_USERS_BROADCAST_SECONDS: u64 = 30;

/// Outbound queue depth per connection. An observer that falls this far
/// behind is dropped rather than allowed to stall ingest.
pub const SEND_QUEUE_CAPACITY: usize = 256;

/// Outcome of a session delete request.
#[derive(Debug, Clone)]
pub struct DeleteOutcome {
    pub success: bool,
    pub reason: String,
}

struct HubState {
    registry: SessionRegistry,
    reset: ResetDetector,
    connections: HashMap<Uuid, mpsc::Sender<Message>>,
    follows: HashMap<Uuid, HashSet<String>>,
    followers: HashMap<String, HashSet<Uuid>>,
    last_active_users_broadcast: Option<Instant>,
}

impl HubState {
    fn new() -> Self {
        Self {
            registry: SessionRegistry::new(),
            reset: ResetDetector::new(),
            connections: HashMap::new(),
            follows: HashMap::new(),
            followers: HashMap::new(),
            last_active_users_broadcast: None,
        }
    }

    /// Removes a connection and both sides of its follow relation in one
    /// step so the indices never disagree.
    fn remove_connection(&mut self, connection_id: Uuid) {
        self.connections.remove(&connection_id);
        self.clear_follows(connection_id);
    }

    fn clear_follows(&mut self, connection_id: Uuid) {
        if let Some(followed) = self.follows.remove(&connection_id) {
            for session_id in followed {
                let emptied = self
                    .followers
                    .get_mut(&session_id)
                    .map(|conns| {
                        conns.remove(&connection_id);
                        conns.is_empty()
                    })
                    .unwrap_or(false);
                if emptied {
                    self.followers.remove(&session_id);
                }
            }
        }
    }
}

/// The stateful heart of the server: terminates nothing itself, but owns all
/// connection, subscription and session state, and drives the ingest
/// pipeline. Cheap to clone; all mutation goes through one lock, and no
/// network send happens while it is held.
#[derive(Clone)]
pub struct TrackingHub {
    store: Option<Store>,
    state: Arc<Mutex<HubState>>,
    retention: ChronoDuration,
}

impl TrackingHub {
    pub fn new(store: Option<Store>, retention: ChronoDuration) -> Self {
        Self {
            store,
            state: Arc::new(Mutex::new(HubState::new())),
            retention,
        }
    }

    pub fn store(&self) -> Option<&Store> {
        self.store.as_ref()
    }

    /// Seeds the in-memory history from the store at startup. Failure leaves
    /// the history empty; the hub still serves live traffic.
    pub async fn load_history(&self) {
        let Some(store) = &self.store else {
            tracing::info!("store unavailable; starting with empty history");
            return;
        };
        let cutoff = Utc::now() - self.retention;
        match points::load_history_since(store.pool(), cutoff).await {
            Ok(rows) => {
                let count = rows.len();
                let mut state = self.state.lock().await;
                for row in rows {
                    state.registry.append(&row.session_id, row.to_track_point());
                }
                tracing::info!(points = count, "loaded tracking history from database");
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to load tracking history from database");
            }
        }
    }

    pub async fn register(&self, connection_id: Uuid, sender: mpsc::Sender<Message>) {
        let mut state = self.state.lock().await;
        state.connections.insert(connection_id, sender);
        tracing::info!(connection = %connection_id, total = state.connections.len(), "client connected");
    }

    /// Connection teardown. Unconditionally clears follow indices.
    pub async fn unregister(&self, connection_id: Uuid) {
        let mut state = self.state.lock().await;
        state.remove_connection(connection_id);
        tracing::info!(connection = %connection_id, total = state.connections.len(), "client disconnected");
    }

    /// Replaces the connection's follow set. Only currently-active sessions
    /// are accepted; the rest are silently dropped from the returned set.
    pub async fn follow(&self, connection_id: Uuid, requested: Vec<String>) -> Vec<String> {
        let now = Local::now();
        let mut state = self.state.lock().await;
        state.registry.sweep(now);

        let mut accepted = Vec::new();
        let mut seen = HashSet::new();
        for session_id in requested {
            if state.registry.is_active(&session_id) && seen.insert(session_id.clone()) {
                accepted.push(session_id);
            }
        }

        state.clear_follows(connection_id);
        if !accepted.is_empty() {
            for session_id in &accepted {
                state
                    .followers
                    .entry(session_id.clone())
                    .or_default()
                    .insert(connection_id);
            }
            state
                .follows
                .insert(connection_id, accepted.iter().cloned().collect());
        }
        accepted
    }

    pub async fn unfollow(&self, connection_id: Uuid) {
        let mut state = self.state.lock().await;
        state.clear_follows(connection_id);
    }

    /// The ingest pipeline for one schema-valid telemetry frame.
    pub async fn ingest(&self, frame: TelemetryFrame) {
        let Some(session_id) = frame.session_id.clone().filter(|id| !id.is_empty()) else {
            return;
        };
        let now = Local::now();

        let latitude = frame.latitude.as_ref().and_then(NumberLike::as_f64);
        let longitude = frame.longitude.as_ref().and_then(NumberLike::as_f64);
        let gate = match (latitude, longitude) {
            (Some(lat), Some(lon)) => check_coordinates(lat, lon),
            _ => CoordinateCheck::Invalid {
                reason: "coordinates could not be parsed as numbers".to_string(),
            },
        };

        if let CoordinateCheck::Invalid { reason } = gate {
            self.handle_invalid_coordinates(&frame, &session_id, reason, now)
                .await;
            return;
        }
        let (latitude, longitude) = (latitude.unwrap_or(0.0), longitude.unwrap_or(0.0));
        let distance = frame.distance.unwrap_or(0.0);

        let (effective_id, newly_active) = {
            let mut state = self.state.lock().await;
            let mut effective_id = session_id.clone();
            if let Some(reason) =
                state
                    .reset
                    .check(&session_id, latitude, longitude, distance, now)
            {
                let millis = now.timestamp_millis();
                effective_id = format!("{session_id}_reset_{millis}");
                let archive_key = format!("{session_id}_archived_{millis}");
                tracing::info!(
                    session = %session_id,
                    new_session = %effective_id,
                    reason = %reason,
                    "producer restart detected; rewriting session id"
                );
                state.registry.archive(&session_id, archive_key);
                state.reset.clear(&session_id);
            }
            state
                .reset
                .observe(&effective_id, latitude, longitude, distance, now);
            let newly_active = state.registry.touch(&effective_id, now);
            (effective_id, newly_active)
        };

        let point_time = producer_timestamp(&frame).unwrap_or(now);
        let point = make_track_point(&frame, &effective_id, latitude, longitude, point_time);

        if let Some(store) = &self.store {
            if let Err(err) = points::persist_frame(
                store.pool(),
                &frame,
                &effective_id,
                latitude,
                longitude,
                point_time.with_timezone(&Utc),
            )
            .await
            {
                // Live visibility outranks durability: the point still goes
                // to memory and to observers.
                tracing::warn!(
                    error = %err,
                    session = %effective_id,
                    "failed to persist tracking point; keeping in-memory state"
                );
            }
        } else {
            tracing::debug!(session = %effective_id, "store unavailable; point kept in memory only");
        }

        {
            let mut state = self.state.lock().await;
            state.registry.append(&effective_id, point.clone());
        }

        if newly_active {
            self.broadcast_active_users().await;
        }
        self.broadcast_all(&OutboundFrame::Update {
            point: point.clone(),
        })
        .await;
        self.send_followed_update(&effective_id, &point).await;
    }

    async fn handle_invalid_coordinates(
        &self,
        frame: &TelemetryFrame,
        session_id: &str,
        reason: String,
        now: DateTime<Local>,
    ) {
        tracing::warn!(session = %session_id, reason = %reason, "invalid coordinates");
        {
            // A GPS outage must not let the session time out.
            let mut state = self.state.lock().await;
            state.registry.touch(session_id, now);
        }
        let diagnostic = OutboundFrame::InvalidCoordinates {
            session_id: session_id.to_string(),
            reason,
            other_data: OtherData {
                heart_rate: frame.heart_rate.filter(|hr| *hr > 0),
                slope: frame.slope,
                current_speed: frame.current_speed,
                timestamp: now.format(WIRE_TIMESTAMP_FORMAT).to_string(),
            },
        };
        self.broadcast_all(&diagnostic).await;
    }

    /// Sends a frame to every connection. The recipient set is copied under
    /// the lock; sends happen outside it. A full or closed queue drops the
    /// observer, never the ingest path.
    pub async fn broadcast_all(&self, frame: &OutboundFrame) {
        let text = match frame.encode() {
            Ok(text) => text,
            Err(err) => {
                tracing::error!(error = %err, "failed to encode broadcast frame");
                return;
            }
        };
        let recipients: Vec<(Uuid, mpsc::Sender<Message>)> = {
            let state = self.state.lock().await;
            state
                .connections
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect()
        };
        let mut dead = Vec::new();
        for (connection_id, tx) in recipients {
            if tx.try_send(Message::text(text.clone())).is_err() {
                dead.push(connection_id);
            }
        }
        self.drop_connections(dead).await;
    }

    /// Sends the reduced update (enriched with the session's laps) to the
    /// session's followers only.
    async fn send_followed_update(&self, session_id: &str, point: &TrackPoint) {
        let recipients: Vec<(Uuid, mpsc::Sender<Message>)> = {
            let state = self.state.lock().await;
            let Some(follower_ids) = state.followers.get(session_id) else {
                return;
            };
            follower_ids
                .iter()
                .filter_map(|id| state.connections.get(id).map(|tx| (*id, tx.clone())))
                .collect()
        };
        if recipients.is_empty() {
            return;
        }

        let mut reduced = point.reduced();
        if let Some(store) = &self.store {
            match points::session_laps(store.pool(), session_id).await {
                Ok(laps) => reduced.lap_times = laps,
                Err(err) => {
                    tracing::debug!(error = %err, session = %session_id, "failed to load laps for followed update");
                }
            }
        }
        let frame = OutboundFrame::FollowedUserUpdate { point: reduced };
        let text = match frame.encode() {
            Ok(text) => text,
            Err(err) => {
                tracing::error!(error = %err, "failed to encode followed update");
                return;
            }
        };
        let mut dead = Vec::new();
        for (connection_id, tx) in recipients {
            if tx.try_send(Message::text(text.clone())).is_err() {
                dead.push(connection_id);
            }
        }
        self.drop_connections(dead).await;
    }

    /// The latest point of a followed session, shaped as a
    /// `followed_user_update`; sent right after a successful follow.
    pub async fn latest_followed_update(&self, session_id: &str) -> Option<OutboundFrame> {
        let point = {
            let state = self.state.lock().await;
            state.registry.latest_point(session_id).cloned()
        }?;
        let mut reduced = point.reduced();
        if let Some(store) = &self.store {
            if let Ok(laps) = points::session_laps(store.pool(), session_id).await {
                reduced.lap_times = laps;
            }
        }
        Some(OutboundFrame::FollowedUserUpdate { point: reduced })
    }

    async fn drop_connections(&self, dead: Vec<Uuid>) {
        if dead.is_empty() {
            return;
        }
        let mut state = self.state.lock().await;
        for connection_id in dead {
            tracing::info!(connection = %connection_id, "dropping unresponsive client");
            state.remove_connection(connection_id);
        }
    }

    /// Sweeps, then returns the full replay (all points, time-ordered) plus
    /// the session list.
    pub async fn history_snapshot(&self) -> (Vec<TrackPoint>, Vec<SessionInfo>) {
        let mut state = self.state.lock().await;
        state.registry.sweep(Local::now());
        (
            state.registry.all_points_sorted(),
            state.registry.session_infos(),
        )
    }

    pub async fn session_list(&self) -> Vec<SessionInfo> {
        let mut state = self.state.lock().await;
        state.registry.sweep(Local::now());
        state.registry.session_infos()
    }

    pub async fn active_users(&self) -> Vec<ActiveUser> {
        let mut state = self.state.lock().await;
        state.registry.sweep(Local::now());
        state.registry.active_users()
    }

    /// Deletes a known, non-active session from memory and the store, then
    /// notifies all clients. Store failure after the memory delete is logged
    /// and the deletion still succeeds.
    pub async fn delete_session(&self, session_id: &str) -> DeleteOutcome {
        {
            let mut state = self.state.lock().await;
            state.registry.sweep(Local::now());
            if !state.registry.contains(session_id) {
                tracing::warn!(session = %session_id, "delete requested for unknown session");
                return DeleteOutcome {
                    success: false,
                    reason: "Session does not exist".to_string(),
                };
            }
            if state.registry.is_active(session_id) {
                tracing::warn!(session = %session_id, "delete requested for active session");
                return DeleteOutcome {
                    success: false,
                    reason: "Cannot delete active session".to_string(),
                };
            }
            state.registry.remove_session(session_id);
            state.reset.clear(session_id);
            if let Some(conns) = state.followers.remove(session_id) {
                for connection_id in conns {
                    let emptied = state
                        .follows
                        .get_mut(&connection_id)
                        .map(|followed| {
                            followed.remove(session_id);
                            followed.is_empty()
                        })
                        .unwrap_or(false);
                    if emptied {
                        state.follows.remove(&connection_id);
                    }
                }
            }
        }

        if let Some(store) = &self.store {
            match sessions::delete_session(store.pool(), session_id).await {
                Ok(existed) => {
                    tracing::info!(session = %session_id, existed, "session deleted from database")
                }
                Err(err) => {
                    tracing::error!(error = %err, session = %session_id, "failed to delete session from database");
                }
            }
        }

        self.broadcast_all(&OutboundFrame::SessionDeleted {
            session_id: session_id.to_string(),
        })
        .await;
        DeleteOutcome {
            success: true,
            reason: String::new(),
        }
    }

    /// Prunes in-memory history by wall-clock age. Broadcasts a fresh
    /// `session_list` when anything changed. The store's retention is its own
    /// concern and is deliberately untouched here.
    pub async fn cleanup_memory(&self) -> RetentionSweep {
        let now = Local::now();
        let cutoff = now.naive_local() - self.retention;
        let sweep = {
            let mut state = self.state.lock().await;
            let sweep = state.registry.retain_since(cutoff);
            state.registry.sweep(now);
            sweep
        };
        if sweep.changed() {
            tracing::info!(
                points_removed = sweep.points_removed,
                sessions_removed = sweep.sessions_removed,
                "memory retention sweep removed expired data"
            );
            let sessions = self.session_list().await;
            self.broadcast_all(&OutboundFrame::SessionList { sessions })
                .await;
        }
        sweep
    }

    /// Opportunistic `active_users` refresh from connection loops; at most
    /// one broadcast per window.
    pub async fn maybe_broadcast_active_users(&self) {
        let due = {
            let mut state = self.state.lock().await;
            let due = state
                .last_active_users_broadcast
                .map(|at| at.elapsed() >= Duration::from_secs(ACTIVE_USERS_BROADCAST_SECONDS))
                .unwrap_or(true);
            if due {
                state.last_active_users_broadcast = Some(Instant::now());
            }
            due
        };
        if due {
            self.broadcast_active_users().await;
        }
    }

    async fn broadcast_active_users(&self) {
        let users = {
            let mut state = self.state.lock().await;
            state.registry.sweep(Local::now());
            state.last_active_users_broadcast = Some(Instant::now());
            state.registry.active_users()
        };
        self.broadcast_all(&OutboundFrame::ActiveUsers { users })
            .await;
    }

    #[cfg(test)]
    pub(crate) async fn seed_point(&self, session_id: &str, point: TrackPoint) {
        let mut state = self.state.lock().await;
        state.registry.append(session_id, point);
    }

    #[cfg(test)]
    pub(crate) async fn follow_indices(
        &self,
    ) -> (HashMap<Uuid, HashSet<String>>, HashMap<String, HashSet<Uuid>>) {
        let state = self.state.lock().await;
        (state.follows.clone(), state.followers.clone())
    }

    #[cfg(test)]
    pub(crate) async fn history_len(&self, session_id: &str) -> Option<usize> {
        let state = self.state.lock().await;
        state.registry.points_len(session_id)
    }

    #[cfg(test)]
    pub(crate) async fn is_session_active(&self, session_id: &str) -> bool {
        let state = self.state.lock().await;
        state.registry.is_active(session_id)
    }
}

/// Producer timestamp preference: ISO `currentDateTime`, then the wire-format
/// `formattedTimestamp`, then ISO `startDateTime`. Callers fall back to
/// server now.
fn producer_timestamp(frame: &TelemetryFrame) -> Option<DateTime<Local>> {
    frame
        .current_date_time
        .as_deref()
        .and_then(track::parse_iso_local)
        .or_else(|| {
            frame
                .formatted_timestamp
                .as_deref()
                .and_then(track::parse_wire_local)
        })
        .or_else(|| {
            frame
                .start_date_time
                .as_deref()
                .and_then(track::parse_iso_local)
        })
}

fn make_track_point(
    frame: &TelemetryFrame,
    session_id: &str,
    latitude: f64,
    longitude: f64,
    timestamp: DateTime<Local>,
) -> TrackPoint {
    let name = frame.producer_name().unwrap_or_default().to_string();
    TrackPoint {
        timestamp: timestamp.format(WIRE_TIMESTAMP_FORMAT).to_string(),
        session_id: session_id.to_string(),
        firstname: name.clone(),
        person: name,
        lastname: frame.lastname.clone(),
        birthdate: frame.birthdate.clone(),
        height: frame.height,
        weight: frame.weight,
        min_distance_meters: frame.min_distance_meters,
        min_time_seconds: frame.min_time_seconds,
        voice_announcement_interval: frame.voice_announcement_interval,
        event_name: frame.event_name.clone(),
        sport_type: frame.sport_type.clone(),
        comment: frame.comment.clone(),
        clothing: frame.clothing.clone(),
        latitude,
        longitude,
        altitude: frame.altitude,
        horizontal_accuracy: frame.horizontal_accuracy,
        vertical_accuracy_meters: frame.vertical_accuracy_meters,
        number_of_satellites: frame.number_of_satellites,
        satellites: frame.satellites,
        used_number_of_satellites: frame.used_number_of_satellites,
        current_speed: frame.current_speed.unwrap_or(0.0),
        average_speed: frame.average_speed.unwrap_or(0.0),
        max_speed: frame.max_speed.unwrap_or(0.0),
        moving_average_speed: frame.moving_average_speed.unwrap_or(0.0),
        speed: frame.speed,
        speed_accuracy_meters_per_second: frame.speed_accuracy_meters_per_second,
        distance: frame.distance.unwrap_or(0.0),
        covered_distance: frame.covered_distance,
        cumulative_elevation_gain: frame.cumulative_elevation_gain,
        slope: frame.slope,
        average_slope: frame.average_slope,
        max_uphill_slope: frame.max_uphill_slope,
        max_downhill_slope: frame.max_downhill_slope,
        lap: frame.lap,
        heart_rate: frame.heart_rate.filter(|hr| *hr > 0),
        heart_rate_device: frame.heart_rate_device.clone(),
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn telemetry(session_id: &str, latitude: f64, longitude: f64, distance: f64) -> TelemetryFrame {
        TelemetryFrame {
            session_id: Some(session_id.to_string()),
            firstname: Some("Ann".to_string()),
            latitude: Some(NumberLike::Number(latitude)),
            longitude: Some(NumberLike::Number(longitude)),
            distance: Some(distance),
            current_speed: Some(0.0),
            average_speed: Some(0.0),
            max_speed: Some(0.0),
            moving_average_speed: Some(0.0),
            ..Default::default()
        }
    }

    async fn hub_with_observer() -> (TrackingHub, Uuid, mpsc::Receiver<Message>) {
        let hub = TrackingHub::new(None, ChronoDuration::hours(24));
        let (tx, rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let connection_id = Uuid::new_v4();
        hub.register(connection_id, tx).await;
        (hub, connection_id, rx)
    }

    fn frame_type(message: &Message) -> String {
        let value: Value = serde_json::from_str(message.to_text().expect("text frame"))
            .expect("json frame");
        value["type"].as_str().unwrap_or_default().to_string()
    }

    #[tokio::test]
    async fn valid_ingest_broadcasts_active_users_then_update() {
        let (hub, _conn, mut rx) = hub_with_observer().await;
        hub.ingest(telemetry("s1", 48.1818, 16.3607, 0.0)).await;

        let first = rx.try_recv().expect("active_users frame");
        assert_eq!(frame_type(&first), "active_users");
        let second = rx.try_recv().expect("update frame");
        assert_eq!(frame_type(&second), "update");
        let value: Value =
            serde_json::from_str(second.to_text().expect("text")).expect("json");
        assert_eq!(value["point"]["sessionId"], "s1");
        assert_eq!(value["point"]["person"], "Ann");

        assert!(hub.is_session_active("s1").await);
    }

    #[tokio::test]
    async fn invalid_coordinates_do_not_enter_history_but_keep_session_alive() {
        let (hub, _conn, mut rx) = hub_with_observer().await;
        hub.ingest(telemetry("s1", -999.0, -999.0, 0.0)).await;

        let frame = rx.try_recv().expect("diagnostic frame");
        assert_eq!(frame_type(&frame), "invalid_coordinates");
        let value: Value = serde_json::from_str(frame.to_text().expect("text")).expect("json");
        assert!(value["reason"].as_str().unwrap_or_default().contains("-999"));

        assert!(hub.is_session_active("s1").await);
        assert_eq!(hub.history_len("s1").await, Some(0));
    }

    #[tokio::test]
    async fn no_update_frame_ever_carries_invalid_coordinates() {
        let (hub, _conn, mut rx) = hub_with_observer().await;
        hub.ingest(telemetry("s1", 48.1818, 16.3607, 0.0)).await;
        hub.ingest(telemetry("s1", -999.0, -999.0, 0.1)).await;
        hub.ingest(telemetry("s1", 48.1819, 16.3608, 0.2)).await;

        while let Ok(message) = rx.try_recv() {
            let value: Value =
                serde_json::from_str(message.to_text().expect("text")).expect("json");
            if value["type"] == "update" {
                let lat = value["point"]["latitude"].as_f64().expect("latitude");
                assert!((-90.0..=90.0).contains(&lat));
            }
        }
    }

    #[tokio::test]
    async fn coordinate_jump_rewrites_session_id_end_to_end() {
        let (hub, _conn, mut rx) = hub_with_observer().await;
        hub.ingest(telemetry("s1", 48.1818, 16.3607, 4.8)).await;
        hub.ingest(telemetry("s1", 55.71, 13.23, 5.0)).await;

        let mut update_sessions = Vec::new();
        let mut last_active_users: Option<Value> = None;
        while let Ok(message) = rx.try_recv() {
            let value: Value =
                serde_json::from_str(message.to_text().expect("text")).expect("json");
            match value["type"].as_str() {
                Some("update") => update_sessions
                    .push(value["point"]["sessionId"].as_str().unwrap_or("").to_string()),
                Some("active_users") => last_active_users = Some(value),
                _ => {}
            }
        }

        assert_eq!(update_sessions.len(), 2);
        assert_eq!(update_sessions[0], "s1");
        assert!(update_sessions[1].starts_with("s1_reset_"));

        assert!(!hub.is_session_active("s1").await);
        assert!(hub.is_session_active(&update_sessions[1]).await);

        let users = last_active_users.expect("active_users was broadcast");
        let listed: Vec<&str> = users["users"]
            .as_array()
            .expect("users array")
            .iter()
            .filter_map(|u| u["sessionId"].as_str())
            .collect();
        assert!(listed.iter().any(|id| id.starts_with("s1_reset_")));
        assert!(!listed.contains(&"s1"));
    }

    #[tokio::test]
    async fn follow_replaces_the_whole_set() {
        let (hub, observer, _rx) = hub_with_observer().await;
        hub.ingest(telemetry("a", 48.0, 16.0, 0.0)).await;
        hub.ingest(telemetry("b", 48.2, 16.2, 0.0)).await;
        hub.ingest(telemetry("c", 48.4, 16.4, 0.0)).await;

        let first = hub
            .follow(observer, vec!["a".to_string(), "b".to_string()])
            .await;
        assert_eq!(first, vec!["a".to_string(), "b".to_string()]);

        let second = hub
            .follow(observer, vec!["b".to_string(), "c".to_string()])
            .await;
        assert_eq!(second, vec!["b".to_string(), "c".to_string()]);

        let (follows, followers) = hub.follow_indices().await;
        let followed = follows.get(&observer).expect("observer has follows");
        assert_eq!(
            *followed,
            HashSet::from(["b".to_string(), "c".to_string()])
        );
        assert!(!followers.contains_key("a"));
    }

    #[tokio::test]
    async fn follow_drops_inactive_sessions_silently() {
        let (hub, observer, _rx) = hub_with_observer().await;
        hub.ingest(telemetry("live", 48.0, 16.0, 0.0)).await;

        let accepted = hub
            .follow(observer, vec!["live".to_string(), "ghost".to_string()])
            .await;
        assert_eq!(accepted, vec!["live".to_string()]);
    }

    #[tokio::test]
    async fn follow_indices_stay_symmetric_through_the_lifecycle() {
        let (hub, observer, _rx) = hub_with_observer().await;
        hub.ingest(telemetry("a", 48.0, 16.0, 0.0)).await;
        hub.ingest(telemetry("b", 48.2, 16.2, 0.0)).await;

        async fn assert_symmetric(hub: &TrackingHub) {
            let (follows, followers) = hub.follow_indices().await;
            for (conn, sessions) in &follows {
                for session in sessions {
                    assert!(
                        followers
                            .get(session)
                            .map(|set| set.contains(conn))
                            .unwrap_or(false),
                        "follows has {session} for {conn} but followers disagrees"
                    );
                }
            }
            for (session, conns) in &followers {
                for conn in conns {
                    assert!(
                        follows
                            .get(conn)
                            .map(|set| set.contains(session))
                            .unwrap_or(false),
                        "followers has {conn} for {session} but follows disagrees"
                    );
                }
            }
        }

        hub.follow(observer, vec!["a".to_string(), "b".to_string()])
            .await;
        assert_symmetric(&hub).await;

        hub.follow(observer, vec!["b".to_string()]).await;
        assert_symmetric(&hub).await;

        hub.unfollow(observer).await;
        assert_symmetric(&hub).await;
        let (follows, followers) = hub.follow_indices().await;
        assert!(follows.is_empty());
        assert!(followers.is_empty());

        hub.follow(observer, vec!["a".to_string()]).await;
        hub.unregister(observer).await;
        assert_symmetric(&hub).await;
        let (follows, followers) = hub.follow_indices().await;
        assert!(follows.is_empty());
        assert!(followers.is_empty());
    }

    #[tokio::test]
    async fn followers_receive_followed_user_update() {
        let hub = TrackingHub::new(None, ChronoDuration::hours(24));
        let (producer_tx, mut _producer_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let producer = Uuid::new_v4();
        hub.register(producer, producer_tx).await;
        hub.ingest(telemetry("s1", 48.1818, 16.3607, 0.0)).await;

        let (observer_tx, mut observer_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let observer = Uuid::new_v4();
        hub.register(observer, observer_tx).await;
        hub.follow(observer, vec!["s1".to_string()]).await;

        hub.ingest(telemetry("s1", 48.1819, 16.3608, 0.1)).await;

        let mut seen_update = false;
        let mut seen_followed = false;
        while let Ok(message) = observer_rx.try_recv() {
            match frame_type(&message).as_str() {
                "update" => seen_update = true,
                "followed_user_update" => {
                    seen_followed = true;
                    let value: Value =
                        serde_json::from_str(message.to_text().expect("text")).expect("json");
                    assert_eq!(value["point"]["sessionId"], "s1");
                    assert!(value["point"]["lapTimes"].is_array());
                }
                _ => {}
            }
        }
        assert!(seen_update);
        assert!(seen_followed);
    }

    #[tokio::test]
    async fn delete_refuses_active_and_unknown_sessions() {
        let (hub, _conn, _rx) = hub_with_observer().await;
        hub.ingest(telemetry("s1", 48.1818, 16.3607, 0.0)).await;

        let unknown = hub.delete_session("nope").await;
        assert!(!unknown.success);
        assert_eq!(unknown.reason, "Session does not exist");

        let active = hub.delete_session("s1").await;
        assert!(!active.success);
        assert_eq!(active.reason, "Cannot delete active session");
    }

    #[tokio::test]
    async fn retention_sweep_prunes_expired_points_and_announces() {
        let (hub, _conn, mut rx) = hub_with_observer().await;
        hub.ingest(telemetry("fresh", 48.1818, 16.3607, 0.0)).await;

        let stale_point = make_track_point(
            &telemetry("stale", 48.0, 16.0, 0.0),
            "stale",
            48.0,
            16.0,
            Local::now() - ChronoDuration::hours(25),
        );
        hub.seed_point("stale", stale_point).await;
        while rx.try_recv().is_ok() {}

        let sweep = hub.cleanup_memory().await;
        assert_eq!(sweep.points_removed, 1);
        assert_eq!(sweep.sessions_removed, 1);

        let mut announced: Option<Value> = None;
        while let Ok(message) = rx.try_recv() {
            let value: Value =
                serde_json::from_str(message.to_text().expect("text")).expect("json");
            if value["type"] == "session_list" {
                announced = Some(value);
            }
        }
        let sessions = announced.expect("session_list broadcast after sweep");
        let ids: Vec<&str> = sessions["sessions"]
            .as_array()
            .expect("sessions array")
            .iter()
            .filter_map(|s| s["sessionId"].as_str())
            .collect();
        assert!(ids.contains(&"fresh"));
        assert!(!ids.contains(&"stale"));
    }

    #[tokio::test]
    async fn cleanup_on_fresh_data_changes_nothing() {
        let (hub, _conn, mut rx) = hub_with_observer().await;
        hub.ingest(telemetry("s1", 48.1818, 16.3607, 0.0)).await;
        while rx.try_recv().is_ok() {}

        let sweep = hub.cleanup_memory().await;
        assert!(!sweep.changed());
        assert!(rx.try_recv().is_err());
    }
}
