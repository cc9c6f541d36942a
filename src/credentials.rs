use crate::error::Error;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

/// Bearer token of one test account, plus whatever identity the registration
/// step stored next to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub token: String,
    #[serde(default, alias = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl Credential {
    pub fn from_token(token: &str) -> Self {
        Self {
            token: String::from(token),
            id: None,
            username: None,
            email: None,
        }
    }
}

/// Loads a token file. Both layouts produced by the account registration step
/// are accepted: a plain array of tokens, or an array of user objects carrying
/// a `token` field.
pub fn load_from_file(path: &Path) -> Result<Vec<Credential>, Error> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::CredentialError(format!("failed to read {}: {}", path.display(), e))
    })?;
    let credentials = parse_credentials(&content)?;

    if credentials.is_empty() {
        warn!("{} contains no credentials", path.display());
    } else {
        info!("loaded {} credentials from {}", credentials.len(), path.display());
    }
    Ok(credentials)
}

pub fn parse_credentials(content: &str) -> Result<Vec<Credential>, Error> {
    let document: Value = serde_json::from_str(content)
        .map_err(|e| Error::CredentialError(format!("invalid JSON: {}", e)))?;

    let entries = match document {
        Value::Array(entries) => entries,
        _ => {
            return Err(Error::CredentialError(String::from(
                "expected an array of tokens or user objects",
            )))
        }
    };

    entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| match entry {
            Value::String(token) => Ok(Credential::from_token(&token)),
            Value::Object(_) => serde_json::from_value(entry).map_err(|e| {
                Error::CredentialError(format!("entry {} is not a valid user: {}", index, e))
            }),
            _ => Err(Error::CredentialError(format!(
                "entry {} is neither a token nor a user object",
                index
            ))),
        })
        .collect()
}
