//! The cached session record: the locally authoritative answer to "who is
//! logged in". The record is replaced wholesale on every update; nothing
//! mutates `user` field-by-field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;
use uuid::Uuid;

/// Bumped whenever the persisted shape changes. A stored record carrying
/// any other version is treated as absent, never upgraded in place.
pub const SESSION_SCHEMA_VERSION: u32 = 3;

/// Denormalized profile attributes, keyed by the identity provider's user id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub email: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub password_changed_at: Option<DateTime<Utc>>,
}

/// Partial profile update; only supplied fields are written.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ProfilePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_changed_at: Option<DateTime<Utc>>,
}

impl ProfilePatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.full_name.is_none() && self.phone.is_none() && self.password_changed_at.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub version: u32,
    /// Locally minted id, only used to correlate log lines.
    pub session_id: Ulid,
    pub user: UserProfile,
    pub logged_in_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub is_authenticated: bool,
}

impl SessionRecord {
    /// Build a fresh record for `user`. `logged_in_at` is fixed here and
    /// never advances for the lifetime of the session.
    #[must_use]
    pub fn new(user: UserProfile) -> Self {
        let now = Utc::now();
        Self {
            version: SESSION_SCHEMA_VERSION,
            session_id: Ulid::new(),
            user,
            logged_in_at: now,
            last_active_at: now,
            is_authenticated: true,
        }
    }

    /// Advance `last_active_at`; called on every successful refresh.
    pub fn touch(&mut self) {
        self.last_active_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> UserProfile {
        UserProfile {
            id: Uuid::new_v4(),
            email: "ops@station.example".to_string(),
            full_name: Some("Station Ops".to_string()),
            phone: None,
            role: Some("manager".to_string()),
            password_changed_at: None,
        }
    }

    #[test]
    fn new_record_is_authenticated_and_stamped() {
        let record = SessionRecord::new(profile());
        assert!(record.is_authenticated);
        assert_eq!(record.version, SESSION_SCHEMA_VERSION);
        assert_eq!(record.logged_in_at, record.last_active_at);
    }

    #[test]
    fn touch_advances_only_last_active() {
        let mut record = SessionRecord::new(profile());
        let logged_in_at = record.logged_in_at;
        std::thread::sleep(std::time::Duration::from_millis(2));
        record.touch();
        assert_eq!(record.logged_in_at, logged_in_at);
        assert!(record.last_active_at > logged_in_at);
    }

    #[test]
    fn empty_patch_reports_empty() {
        assert!(ProfilePatch::default().is_empty());
        let patch = ProfilePatch {
            phone: Some("+34 600 000 000".to_string()),
            ..ProfilePatch::default()
        };
        assert!(!patch.is_empty());
    }
}
