// Authentication types

use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// `POST /auth/login` response
#[derive(Debug, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    #[serde(default)]
    pub user: Option<UserProfile>,
}

/// `POST /auth/refresh` response
#[derive(Debug, Deserialize)]
pub struct RefreshResponse {
    pub access_token: String,
}

/// `GET /auth/me` response
#[derive(Debug, Clone, Deserialize)]
pub struct UserProfile {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub email: String,
    pub role: String,
    #[serde(default, deserialize_with = "optional_string_or_number")]
    pub practice_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub password_change_required: bool,
}

/// Identifiers arrive as strings or integers depending on the backend version
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

fn optional_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(de::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

/// The signed-in user, derived entirely from the profile fetch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub user_id: String,
    pub email: String,
    pub role: String,
    pub tenant_id: Option<String>,
    pub display_name: String,
    pub password_change_required: bool,
}

impl From<UserProfile> for Session {
    fn from(profile: UserProfile) -> Self {
        // Fall back to the email when the backend has no display name
        let display_name = profile
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| profile.email.clone());

        Session {
            user_id: profile.id,
            email: profile.email,
            role: profile.role,
            tenant_id: profile.practice_id,
            display_name,
            password_change_required: profile.password_change_required,
        }
    }
}
