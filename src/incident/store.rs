//! In-memory incident state
//!
//! One `tokio::sync::Mutex` per incident, no global lock. Everything that must be
//! linearizable for an incident (tier advancement, response recording,
//! settlement) happens while holding that incident's mutex.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{Incident, IncidentView};
use crate::types::{LifelineError, Result};

pub type IncidentCell = Arc<Mutex<Incident>>;

#[derive(Default)]
pub struct IncidentStore {
    incidents: DashMap<String, IncidentCell>,
    /// user_id -> incident ids, oldest first
    by_user: DashMap<String, Vec<String>>,
}

impl IncidentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, incident: Incident) -> IncidentCell {
        let id = incident.id.clone();
        self.by_user
            .entry(incident.user_id.clone())
            .or_default()
            .push(id.clone());
        let cell = Arc::new(Mutex::new(incident));
        self.incidents.insert(id, cell.clone());
        cell
    }

    pub fn get(&self, incident_id: &str) -> Result<IncidentCell> {
        self.incidents
            .get(incident_id)
            .map(|c| c.value().clone())
            .ok_or_else(|| LifelineError::NotFound(format!("incident {incident_id}")))
    }

    pub async fn view(&self, incident_id: &str) -> Result<IncidentView> {
        let cell = self.get(incident_id)?;
        let incident = cell.lock().await;
        Ok(incident.view())
    }

    pub fn incidents_for_user(&self, user_id: &str) -> Vec<String> {
        self.by_user
            .get(user_id)
            .map(|ids| ids.value().clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.incidents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.incidents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::GeoPoint;
    use crate::incident::IncidentType;

    fn incident(id: &str, user: &str) -> Incident {
        Incident::new(
            id.into(),
            user.into(),
            "Asha".into(),
            None,
            IncidentType::Sos,
            GeoPoint::new(1.0, 1.0),
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let store = IncidentStore::new();
        store.insert(incident("inc-1", "u-1"));
        store.insert(incident("inc-2", "u-1"));

        assert_eq!(store.len(), 2);
        assert_eq!(store.view("inc-2").await.unwrap().user_id, "u-1");
        assert_eq!(store.incidents_for_user("u-1"), vec!["inc-1", "inc-2"]);
        assert!(matches!(store.get("inc-9"), Err(LifelineError::NotFound(_))));
    }
}
