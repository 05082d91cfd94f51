//! ID generation helpers.

use uuid::Uuid;

/// New opaque identifier (UUID v4, string form).
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Short random suffix for worker/leader instance names.
pub fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}
