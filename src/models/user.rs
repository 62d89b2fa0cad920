use serde::{Deserialize, Serialize};

/// Signed-in user profile, as returned by the sessions endpoint and
/// persisted next to the credential pair.
///
/// Treated as an immutable value: a profile update replaces the whole
/// record, it never mutates fields of a shared instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
}
