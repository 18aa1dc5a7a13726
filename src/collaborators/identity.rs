//! Identity and contact lookup
//!
//! The core only reads from this collaborator. Profile management lives in the
//! surrounding product, not here.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::responders::ResponderSeed;
use crate::types::{LifelineError, Result};

/// Someone the user listed to be told about emergencies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyContact {
    pub name: String,
    pub phone: String,
    #[serde(default)]
    pub relation: Option<String>,
}

/// Read-only view of a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub emergency_contacts: Vec<EmergencyContact>,
}

/// Identity/contacts collaborator
#[async_trait::async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn resolve_user(&self, user_id: &str) -> Result<UserProfile>;

    /// Guardians the user has linked, as directory seeds
    async fn resolve_guardians(&self, user_id: &str) -> Result<Vec<ResponderSeed>>;
}

/// On-disk shape of an identity fixture file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityFile {
    #[serde(default)]
    pub users: Vec<IdentityRecord>,
}

/// One user plus their guardian links
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
    #[serde(flatten)]
    pub profile: UserProfile,
    #[serde(default)]
    pub guardians: Vec<ResponderSeed>,
}

/// In-memory identity directory
#[derive(Default)]
pub struct InMemoryIdentity {
    users: Arc<RwLock<HashMap<String, IdentityRecord>>>,
}

impl InMemoryIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load users and guardian links from a JSON file
    pub async fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| LifelineError::Storage(format!("identity file: {e}")))?;
        let file: IdentityFile = serde_json::from_str(&content)
            .map_err(|e| LifelineError::Validation(format!("identity file: {e}")))?;

        let identity = Self::new();
        let count = file.users.len();
        for record in file.users {
            identity.upsert(record.profile, record.guardians).await;
        }
        info!(path = %path.as_ref().display(), users = count, "Loaded identity fixtures");
        Ok(identity)
    }

    /// Insert or replace a user and their guardians
    pub async fn upsert(&self, profile: UserProfile, guardians: Vec<ResponderSeed>) {
        self.users.write().await.insert(
            profile.user_id.clone(),
            IdentityRecord { profile, guardians },
        );
    }
}

#[async_trait::async_trait]
impl IdentityDirectory for InMemoryIdentity {
    async fn resolve_user(&self, user_id: &str) -> Result<UserProfile> {
        self.users
            .read()
            .await
            .get(user_id)
            .map(|r| r.profile.clone())
            .ok_or_else(|| LifelineError::NotFound(format!("user {user_id}")))
    }

    async fn resolve_guardians(&self, user_id: &str) -> Result<Vec<ResponderSeed>> {
        self.users
            .read()
            .await
            .get(user_id)
            .map(|r| r.guardians.clone())
            .ok_or_else(|| LifelineError::NotFound(format!("user {user_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_identity_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("identity.json");
        std::fs::write(
            &path,
            r#"{
                "users": [{
                    "user_id": "u-1",
                    "name": "Asha",
                    "phone": "+15550100",
                    "emergency_contacts": [{"name": "Ravi", "phone": "+15550101"}],
                    "guardians": [{
                        "responder_id": "g-1",
                        "name": "Ravi",
                        "trust_score": 0.9,
                        "channels": {"sms_phone": "+15550101"}
                    }]
                }]
            }"#,
        )
        .unwrap();

        let identity = InMemoryIdentity::from_json_file(&path).await.unwrap();
        let user = identity.resolve_user("u-1").await.unwrap();
        assert_eq!(user.name, "Asha");
        assert_eq!(user.emergency_contacts.len(), 1);

        let guardians = identity.resolve_guardians("u-1").await.unwrap();
        assert_eq!(guardians.len(), 1);
        assert_eq!(guardians[0].responder_id, "g-1");
    }

    #[tokio::test]
    async fn test_unknown_user() {
        let identity = InMemoryIdentity::new();
        assert!(matches!(
            identity.resolve_user("nobody").await,
            Err(LifelineError::NotFound(_))
        ));
    }
}
