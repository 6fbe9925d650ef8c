use chrono::{DateTime, Utc};

use crate::{config::Settings, session::Session};

/// Whether a session has been idle past the configured window.
///
/// A session is culled when the activity probe has recorded a last-activity
/// timestamp, that timestamp is older than the idle window, and the session
/// has not already been stopped. Sessions with no recorded activity are left
/// alone; the probe owns that annotation.
pub fn needs_culling(session: &Session, now: DateTime<Utc>, settings: &Settings) -> bool {
    if !settings.enable_culling || session.is_stopped() {
        return false;
    }
    match session.last_activity() {
        Some(last) => {
            let idle = now.signed_duration_since(last);
            idle.to_std().map(|idle| idle > settings.idle_time).unwrap_or(false)
        }
        None => false,
    }
}
