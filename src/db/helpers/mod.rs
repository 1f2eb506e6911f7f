use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};

pub const SESSION_KEY_PREFIX: &str = "session:";
pub const CURRENT_SESSION_KEY: &str = "current_session_id";

pub fn session_key(session_id: &str) -> String {
    format!("{SESSION_KEY_PREFIX}{session_id}")
}

pub fn encode_json<T: Serialize>(value: &T, field: &str) -> Result<String> {
    serde_json::to_string(value).with_context(|| format!("failed to serialize {field}"))
}

pub fn decode_json<T: DeserializeOwned>(raw: &str, field: &str) -> Result<T> {
    serde_json::from_str(raw).with_context(|| format!("failed to deserialize {field}"))
}
