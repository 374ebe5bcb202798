use crate::frame::{ActiveUser, SessionInfo};
use crate::track::{TrackPoint, WIRE_TIMESTAMP_FORMAT};
use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDateTime};
use std::collections::{HashMap, HashSet};

/// A session without updates for this long falls out of the active set.
pub(crate) const ACTIVITY_TIMEOUT_SECONDS: i64 = 60;

/// Result of a retention pass over the in-memory history.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetentionSweep {
    pub points_removed: usize,
    pub sessions_removed: usize,
}

impl RetentionSweep {
    pub fn changed(&self) -> bool {
        self.points_removed > 0 || self.sessions_removed > 0
    }
}

/// In-memory index of known and active sessions. `history` mirrors what
/// observers see; `active` is a cache over `last_activity` rebuilt by
/// `sweep` at every query point.
#[derive(Debug, Default)]
pub(crate) struct SessionRegistry {
    history: HashMap<String, Vec<TrackPoint>>,
    active: HashSet<String>,
    last_activity: HashMap<String, DateTime<Local>>,
}

impl SessionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records activity for a session. Returns true when the session was not
    /// active before. Ensures a history entry exists so that an active
    /// session is always a known session.
    pub(crate) fn touch(&mut self, session_id: &str, now: DateTime<Local>) -> bool {
        self.history.entry(session_id.to_string()).or_default();
        self.last_activity.insert(session_id.to_string(), now);
        self.active.insert(session_id.to_string())
    }

    /// Drops sessions from `active` whose last activity is older than the
    /// activity timeout. Cheap; runs on demand from every query point.
    pub(crate) fn sweep(&mut self, now: DateTime<Local>) -> Vec<String> {
        let timeout = ChronoDuration::seconds(ACTIVITY_TIMEOUT_SECONDS);
        let mut deactivated = Vec::new();
        for (session_id, last) in &self.last_activity {
            if now.signed_duration_since(*last) > timeout && self.active.remove(session_id) {
                deactivated.push(session_id.clone());
            }
        }
        for session_id in &deactivated {
            tracing::info!(
                session = %session_id,
                timeout_seconds = ACTIVITY_TIMEOUT_SECONDS,
                "session marked inactive"
            );
        }
        deactivated
    }

    pub(crate) fn is_active(&self, session_id: &str) -> bool {
        self.active.contains(session_id)
    }

    pub(crate) fn contains(&self, session_id: &str) -> bool {
        self.history.contains_key(session_id)
    }

    pub(crate) fn append(&mut self, session_id: &str, point: TrackPoint) {
        self.history
            .entry(session_id.to_string())
            .or_default()
            .push(point);
    }

    /// Moves a session's history to an archive key after a reset. The
    /// original id leaves `active` and `last_activity`; the archived points
    /// are never mutated again.
    pub(crate) fn archive(&mut self, session_id: &str, archive_key: String) {
        if let Some(points) = self.history.remove(session_id) {
            if !points.is_empty() {
                self.history.insert(archive_key, points);
            }
        }
        self.active.remove(session_id);
        self.last_activity.remove(session_id);
    }

    /// Removes a known, non-active session entirely. Callers sweep first and
    /// check `is_active`.
    pub(crate) fn remove_session(&mut self, session_id: &str) {
        self.history.remove(session_id);
        self.last_activity.remove(session_id);
        self.active.remove(session_id);
    }

    pub(crate) fn points_len(&self, session_id: &str) -> Option<usize> {
        self.history.get(session_id).map(Vec::len)
    }

    pub(crate) fn latest_point(&self, session_id: &str) -> Option<&TrackPoint> {
        self.history.get(session_id).and_then(|points| points.last())
    }

    pub(crate) fn session_infos(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .history
            .keys()
            .map(|session_id| SessionInfo {
                session_id: session_id.clone(),
                is_active: self.active.contains(session_id),
            })
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    /// Every point of every session, ordered by wire timestamp. This is the
    /// replay order observers see on connect.
    pub(crate) fn all_points_sorted(&self) -> Vec<TrackPoint> {
        let mut points: Vec<TrackPoint> = self
            .history
            .values()
            .flat_map(|points| points.iter().cloned())
            .collect();
        points.sort_by_key(TrackPoint::parsed_timestamp);
        points
    }

    pub(crate) fn active_users(&self) -> Vec<ActiveUser> {
        let mut users: Vec<ActiveUser> = self
            .active
            .iter()
            .map(|session_id| ActiveUser {
                session_id: session_id.clone(),
                person: self
                    .latest_point(session_id)
                    .map(|point| point.person.clone())
                    .unwrap_or_default(),
                last_update: self
                    .last_activity
                    .get(session_id)
                    .map(|ts| ts.format(WIRE_TIMESTAMP_FORMAT).to_string())
                    .unwrap_or_default(),
            })
            .collect();
        users.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        users
    }

    /// Retains only points younger than the cutoff; sessions that empty out
    /// are forgotten entirely. Touches memory only, the store keeps its own
    /// retention.
    pub(crate) fn retain_since(&mut self, cutoff: NaiveDateTime) -> RetentionSweep {
        let mut sweep = RetentionSweep::default();
        let mut emptied = Vec::new();

        for (session_id, points) in &mut self.history {
            let before = points.len();
            points.retain(|point| {
                point
                    .parsed_timestamp()
                    .map(|ts| ts >= cutoff)
                    .unwrap_or(false)
            });
            sweep.points_removed += before - points.len();
            if points.is_empty() && before > 0 {
                emptied.push(session_id.clone());
            }
        }

        for session_id in emptied {
            self.history.remove(&session_id);
            self.last_activity.remove(&session_id);
            self.active.remove(&session_id);
            sweep.sessions_removed += 1;
        }
        self.active.retain(|session_id| self.history.contains_key(session_id));

        sweep
    }
}
