use chrono::{DateTime, Duration as ChronoDuration, Local};
use std::collections::HashMap;

/// A producer silent for longer than this is treated as restarted when it
/// comes back on the same session id.
const TIME_GAP_SECONDS: i64 = 300;

/// Jump threshold as raw Euclidean distance in degrees. Latitude-biased near
/// the poles; acceptable for the several-kilometer jumps this guards against.
const JUMP_THRESHOLD_DEGREES: f64 = 0.045;

/// A cumulative distance counter falling below this ratio of its previous
/// value means the producer's trip state was wiped.
const DISTANCE_DROP_RATIO: f64 = 0.5;

#[derive(Debug, Clone, Copy)]
struct SessionTrace {
    last_latitude: f64,
    last_longitude: f64,
    last_distance: f64,
    last_seen: DateTime<Local>,
}

/// Per-session anomaly detector flagging producer restarts. Only valid
/// coordinates reach this detector; invalid points neither trigger resets nor
/// mutate its state.
#[derive(Debug, Default)]
pub(crate) struct ResetDetector {
    sessions: HashMap<String, SessionTrace>,
}

impl ResetDetector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns the trigger description when the incoming point looks like a
    /// producer restart. Pure check; state is only advanced by `observe`.
    pub(crate) fn check(
        &self,
        session_id: &str,
        latitude: f64,
        longitude: f64,
        distance: f64,
        now: DateTime<Local>,
    ) -> Option<String> {
        let trace = self.sessions.get(session_id)?;

        let idle = now.signed_duration_since(trace.last_seen);
        if idle > ChronoDuration::seconds(TIME_GAP_SECONDS) {
            return Some(format!(
                "no activity for {}s (threshold {}s)",
                idle.num_seconds(),
                TIME_GAP_SECONDS
            ));
        }

        let delta_lat = latitude - trace.last_latitude;
        let delta_lon = longitude - trace.last_longitude;
        let jump = (delta_lat * delta_lat + delta_lon * delta_lon).sqrt();
        if jump > JUMP_THRESHOLD_DEGREES {
            return Some(format!(
                "coordinate jump of {jump:.4} degrees (threshold {JUMP_THRESHOLD_DEGREES})"
            ));
        }

        if distance > 0.0
            && trace.last_distance > 0.0
            && distance < trace.last_distance * DISTANCE_DROP_RATIO
        {
            return Some(format!(
                "cumulative distance dropped from {} to {}",
                trace.last_distance, distance
            ));
        }

        None
    }

    pub(crate) fn observe(
        &mut self,
        session_id: &str,
        latitude: f64,
        longitude: f64,
        distance: f64,
        now: DateTime<Local>,
    ) {
        self.sessions.insert(
            session_id.to_string(),
            SessionTrace {
                last_latitude: latitude,
                last_longitude: longitude,
                last_distance: distance,
                last_seen: now,
            },
        );
    }

    pub(crate) fn clear(&mut self, session_id: &str) {
        self.sessions.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Local> {
        Local::now()
    }

    #[test]
    fn first_point_of_a_session_never_triggers() {
        let detector = ResetDetector::new();
        assert_eq!(detector.check("s1", 48.18, 16.36, 0.0, now()), None);
    }

    #[test]
    fn small_movement_does_not_trigger() {
        let mut detector = ResetDetector::new();
        let t0 = now();
        detector.observe("s1", 48.1818, 16.3607, 1.0, t0);
        assert_eq!(
            detector.check("s1", 48.1820, 16.3610, 1.1, t0 + ChronoDuration::seconds(1)),
            None
        );
    }

    #[test]
    fn long_silence_triggers() {
        let mut detector = ResetDetector::new();
        let t0 = now();
        detector.observe("s1", 48.1818, 16.3607, 1.0, t0);
        let reason = detector
            .check("s1", 48.1818, 16.3607, 1.1, t0 + ChronoDuration::seconds(400))
            .expect("time gap triggers");
        assert!(reason.contains("no activity"));
    }

    #[test]
    fn coordinate_jump_triggers() {
        let mut detector = ResetDetector::new();
        let t0 = now();
        detector.observe("s1", 48.1818, 16.3607, 1.0, t0);
        let reason = detector
            .check("s1", 55.71, 13.23, 5.0, t0 + ChronoDuration::seconds(1))
            .expect("jump triggers");
        assert!(reason.contains("coordinate jump"));
    }

    #[test]
    fn distance_drop_triggers_only_when_both_positive() {
        let mut detector = ResetDetector::new();
        let t0 = now();
        detector.observe("s1", 48.1818, 16.3607, 10.0, t0);
        let reason = detector
            .check("s1", 48.1818, 16.3607, 4.0, t0 + ChronoDuration::seconds(1))
            .expect("distance drop triggers");
        assert!(reason.contains("distance dropped"));

        detector.observe("s2", 48.1818, 16.3607, 0.0, t0);
        assert_eq!(
            detector.check("s2", 48.1818, 16.3607, 0.0, t0 + ChronoDuration::seconds(1)),
            None
        );
    }

    #[test]
    fn clear_forgets_the_session() {
        let mut detector = ResetDetector::new();
        let t0 = now();
        detector.observe("s1", 48.1818, 16.3607, 10.0, t0);
        detector.clear("s1");
        assert_eq!(
            detector.check("s1", 55.71, 13.23, 0.1, t0 + ChronoDuration::seconds(500)),
            None
        );
    }
}
