//! Responder directory with snapshot reads
//!
//! Read-heavy, write-light: every SOS ranks candidates, while heartbeats trickle
//! in. The whole index lives behind an `Arc` that writers replace
//! (copy-on-write). A ranking call clones the `Arc` once and works on that
//! consistent view, so concurrent heartbeats never tear a ranking and readers
//! never wait for a writer to finish its update.
//!
//! ## Ranking
//!
//! ```text
//! recency = 1 - age / horizon        (age >= horizon: excluded)
//! score   = trust_score × recency
//! order   = score desc, distance asc, responder_id asc
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info};

use super::{ContactChannels, ResponderCandidate, ResponderKind, ResponderSeed};
use crate::geo::GeoPoint;
use crate::types::{LifelineError, Result};

/// Directory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Search radius used when the caller does not pass one (meters)
    pub default_radius_meters: f64,
    /// Candidates frozen into each incident
    pub max_candidates: usize,
    /// Heartbeat age at which recency reaches zero (default: 24 hours)
    pub recency_horizon_secs: i64,
    /// Heartbeat age under which a responder counts as online
    pub online_window_secs: i64,
    /// How far past the server clock a heartbeat timestamp may be
    pub max_clock_skew_secs: i64,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            default_radius_meters: 5_000.0,
            max_candidates: 25,
            recency_horizon_secs: 24 * 60 * 60,
            online_window_secs: 10 * 60,
            max_clock_skew_secs: 30,
        }
    }
}

/// Everything the directory knows about one responder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponderProfile {
    pub responder_id: String,
    pub name: String,
    pub kind: ResponderKind,
    pub trust_score: f64,
    #[serde(default)]
    pub channels: ContactChannels,
    /// Latest reported position; earlier ones are not retained
    #[serde(default)]
    pub location: Option<GeoPoint>,
    #[serde(default)]
    pub last_active_at: Option<DateTime<Utc>>,
}

impl From<ResponderSeed> for ResponderProfile {
    fn from(seed: ResponderSeed) -> Self {
        Self {
            responder_id: seed.responder_id,
            name: seed.name,
            kind: seed.kind,
            trust_score: seed.trust_score,
            channels: seed.channels,
            location: None,
            last_active_at: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct DirectorySnapshot {
    responders: HashMap<String, ResponderProfile>,
    /// user_id -> guardian responder ids
    guardians: HashMap<String, BTreeSet<String>>,
}

/// Geospatial, trust-ranked responder index
pub struct ResponderDirectory {
    config: DirectoryConfig,
    snapshot: RwLock<Arc<DirectorySnapshot>>,
    /// Serializes writers so copy-on-write updates never lose each other
    writer: Mutex<()>,
}

impl ResponderDirectory {
    pub fn new(config: DirectoryConfig) -> Self {
        Self {
            config,
            snapshot: RwLock::new(Arc::new(DirectorySnapshot::default())),
            writer: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &DirectoryConfig {
        &self.config
    }

    fn current(&self) -> Arc<DirectorySnapshot> {
        let guard = self.snapshot.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    fn update<R>(&self, f: impl FnOnce(&mut DirectorySnapshot) -> Result<R>) -> Result<R> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = (*self.current()).clone();
        let result = f(&mut next)?;
        let mut guard = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(next);
        Ok(result)
    }

    /// Insert or update a responder, keeping any known position
    pub fn register_responder(&self, profile: ResponderProfile) -> Result<()> {
        validate_profile(&profile)?;
        let responder_id = profile.responder_id.clone();
        self.update(|snap| {
            upsert(snap, profile);
            Ok(())
        })?;
        debug!(responder_id = %responder_id, "Registered responder");
        Ok(())
    }

    /// Link an already registered responder as a guardian of a user
    pub fn link_guardian(&self, user_id: &str, responder_id: &str) -> Result<()> {
        self.update(|snap| {
            if !snap.responders.contains_key(responder_id) {
                return Err(LifelineError::NotFound(format!("responder {responder_id}")));
            }
            snap.guardians
                .entry(user_id.to_string())
                .or_default()
                .insert(responder_id.to_string());
            Ok(())
        })
    }

    /// Replace a user's guardian links with the identity collaborator's view
    ///
    /// Guardianship is a link, not a property of the responder: a registered
    /// responder keeps its kind, trust and addresses, and only gains addresses
    /// it was missing. Unknown responders are registered from the seed.
    pub fn sync_guardians(&self, user_id: &str, seeds: Vec<ResponderSeed>) -> Result<()> {
        let profiles: Vec<ResponderProfile> = seeds
            .into_iter()
            .map(|seed| {
                let mut profile = ResponderProfile::from(seed);
                profile.kind = ResponderKind::Guardian;
                profile
            })
            .collect();
        for profile in &profiles {
            validate_profile(profile)?;
        }

        let count = profiles.len();
        self.update(|snap| {
            let mut ids = BTreeSet::new();
            for profile in profiles {
                ids.insert(profile.responder_id.clone());
                match snap.responders.get_mut(&profile.responder_id) {
                    Some(existing) => existing.channels.fill_missing(profile.channels),
                    None => {
                        snap.responders
                            .insert(profile.responder_id.clone(), profile);
                    }
                }
            }
            snap.guardians.insert(user_id.to_string(), ids);
            Ok(())
        })?;
        debug!(user_id = %user_id, guardians = count, "Synced guardian links");
        Ok(())
    }

    /// Record the latest position of a responder
    ///
    /// Only the newest point is kept; an out-of-order older heartbeat is ignored.
    /// Timestamps further ahead of the server clock than the allowed skew are
    /// rejected, since they would shadow every later heartbeat.
    pub fn record_heartbeat(
        &self,
        responder_id: &str,
        location: GeoPoint,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        if !location.is_valid() {
            return Err(LifelineError::Validation(format!(
                "invalid heartbeat location ({}, {})",
                location.lat, location.lon
            )));
        }
        let latest_allowed = Utc::now() + chrono::Duration::seconds(self.config.max_clock_skew_secs);
        if timestamp > latest_allowed {
            return Err(LifelineError::Validation(format!(
                "heartbeat timestamp {timestamp} is ahead of the server clock"
            )));
        }

        self.update(|snap| {
            let profile = snap
                .responders
                .get_mut(responder_id)
                .ok_or_else(|| LifelineError::NotFound(format!("responder {responder_id}")))?;

            if matches!(profile.last_active_at, Some(last) if last > timestamp) {
                debug!(responder_id = %responder_id, "Ignoring stale heartbeat");
                return Ok(());
            }
            profile.location = Some(location);
            profile.last_active_at = Some(timestamp);
            Ok(())
        })
    }

    /// Rank candidates for a user at the current time
    pub fn rank_candidates(
        &self,
        user_id: &str,
        origin: GeoPoint,
        radius_meters: f64,
        max_count: usize,
    ) -> Result<Vec<ResponderCandidate>> {
        self.rank_candidates_at(user_id, origin, radius_meters, max_count, Utc::now())
    }

    /// Rank candidates as of `now`
    ///
    /// Pool is the user's guardians plus every volunteer. Responders without a
    /// position, outside the radius, or silent for the whole horizon are dropped.
    /// Returning fewer than `max_count` is normal.
    pub fn rank_candidates_at(
        &self,
        user_id: &str,
        origin: GeoPoint,
        radius_meters: f64,
        max_count: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ResponderCandidate>> {
        if !origin.is_valid() {
            return Err(LifelineError::Validation(format!(
                "invalid origin ({}, {})",
                origin.lat, origin.lon
            )));
        }
        if !(radius_meters.is_finite() && radius_meters > 0.0) {
            return Err(LifelineError::Validation(format!(
                "radius must be positive, got {radius_meters}"
            )));
        }

        let snap = self.current();
        let guardians = snap.guardians.get(user_id);
        let horizon = self.config.recency_horizon_secs.max(1) as f64;

        let mut candidates: Vec<ResponderCandidate> = snap
            .responders
            .values()
            .filter(|p| p.responder_id != user_id)
            .filter_map(|p| {
                // Kind is relative to this user: linked means guardian
                let kind = if guardians.is_some_and(|g| g.contains(&p.responder_id)) {
                    ResponderKind::Guardian
                } else if p.kind == ResponderKind::Volunteer {
                    ResponderKind::Volunteer
                } else {
                    return None;
                };
                let location = p.location?;
                let last_active_at = p.last_active_at?;
                let age_secs = (now - last_active_at).num_seconds().max(0) as f64;
                if age_secs >= horizon {
                    return None;
                }
                let distance_meters = origin.distance_meters(&location);
                if distance_meters > radius_meters {
                    return None;
                }
                let recency = 1.0 - age_secs / horizon;
                Some(ResponderCandidate {
                    responder_id: p.responder_id.clone(),
                    name: p.name.clone(),
                    kind,
                    distance_meters,
                    trust_score: p.trust_score,
                    last_active_at,
                    score: p.trust_score * recency,
                    channels: p.channels.clone(),
                    reachable_online: age_secs <= self.config.online_window_secs as f64,
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.distance_meters.total_cmp(&b.distance_meters))
                .then_with(|| a.responder_id.cmp(&b.responder_id))
        });
        candidates.truncate(max_count);

        info!(
            user_id = %user_id,
            candidates = candidates.len(),
            radius_m = radius_meters,
            "Ranked responder candidates"
        );
        Ok(candidates)
    }

    pub fn get(&self, responder_id: &str) -> Option<ResponderProfile> {
        self.current().responders.get(responder_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.current().responders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn validate_profile(profile: &ResponderProfile) -> Result<()> {
    if profile.responder_id.trim().is_empty() {
        return Err(LifelineError::Validation("responder id must not be empty".into()));
    }
    if !(0.0..=1.0).contains(&profile.trust_score) {
        return Err(LifelineError::Validation(format!(
            "trust score for {} must be within [0, 1], got {}",
            profile.responder_id, profile.trust_score
        )));
    }
    Ok(())
}

fn upsert(snap: &mut DirectorySnapshot, mut profile: ResponderProfile) {
    if let Some(existing) = snap.responders.get(&profile.responder_id) {
        if profile.location.is_none() {
            profile.location = existing.location;
            profile.last_active_at = existing.last_active_at;
        }
    }
    snap.responders.insert(profile.responder_id.clone(), profile);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn origin() -> GeoPoint {
        GeoPoint::new(12.9716, 77.5946)
    }

    /// Point roughly `meters` north of the origin
    fn north_of_origin(meters: f64) -> GeoPoint {
        GeoPoint::new(origin().lat + meters / 111_195.0, origin().lon)
    }

    fn profile(id: &str, kind: ResponderKind, trust: f64) -> ResponderProfile {
        ResponderProfile {
            responder_id: id.to_string(),
            name: id.to_uppercase(),
            kind,
            trust_score: trust,
            channels: ContactChannels {
                sms_phone: Some(format!("+1555{id}")),
                ..Default::default()
            },
            location: None,
            last_active_at: None,
        }
    }

    fn directory_with(
        now: DateTime<Utc>,
        entries: &[(&str, ResponderKind, f64, f64, i64)],
    ) -> ResponderDirectory {
        let dir = ResponderDirectory::new(DirectoryConfig::default());
        for (id, kind, trust, meters, age_secs) in entries {
            dir.register_responder(profile(id, *kind, *trust)).unwrap();
            if *kind == ResponderKind::Guardian {
                dir.link_guardian("user-1", id).unwrap();
            }
            dir.record_heartbeat(id, north_of_origin(*meters), now - Duration::seconds(*age_secs))
                .unwrap();
        }
        dir
    }

    #[test]
    fn test_orders_by_trust_times_recency() {
        let now = Utc::now();
        let dir = directory_with(
            now,
            &[
                ("a", ResponderKind::Guardian, 0.9, 800.0, 0),
                // Higher trust but half a day stale: 1.0 * 0.5
                ("b", ResponderKind::Volunteer, 1.0, 100.0, 12 * 3600),
                ("c", ResponderKind::Volunteer, 0.6, 50.0, 0),
            ],
        );

        let ranked = dir
            .rank_candidates_at("user-1", origin(), 5_000.0, 10, now)
            .unwrap();
        let ids: Vec<&str> = ranked.iter().map(|c| c.responder_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
        assert!((ranked[2].score - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_ties_break_by_distance() {
        let now = Utc::now();
        let dir = directory_with(
            now,
            &[
                ("far", ResponderKind::Volunteer, 0.8, 900.0, 0),
                ("near", ResponderKind::Volunteer, 0.8, 100.0, 0),
            ],
        );

        let ranked = dir
            .rank_candidates_at("user-1", origin(), 5_000.0, 10, now)
            .unwrap();
        assert_eq!(ranked[0].responder_id, "near");
        assert_eq!(ranked[1].responder_id, "far");
    }

    #[test]
    fn test_stale_and_distant_responders_excluded() {
        let now = Utc::now();
        let dir = directory_with(
            now,
            &[
                ("fresh", ResponderKind::Volunteer, 0.5, 100.0, 60),
                ("stale", ResponderKind::Volunteer, 1.0, 100.0, 24 * 3600),
                ("distant", ResponderKind::Volunteer, 1.0, 9_000.0, 0),
            ],
        );

        let ranked = dir
            .rank_candidates_at("user-1", origin(), 5_000.0, 10, now)
            .unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].responder_id, "fresh");
    }

    #[test]
    fn test_unlinked_guardians_and_self_are_not_candidates() {
        let now = Utc::now();
        let dir = ResponderDirectory::new(DirectoryConfig::default());
        dir.register_responder(profile("g-other", ResponderKind::Guardian, 0.9))
            .unwrap();
        dir.register_responder(profile("user-1", ResponderKind::Volunteer, 0.9))
            .unwrap();
        dir.record_heartbeat("g-other", origin(), now).unwrap();
        dir.record_heartbeat("user-1", origin(), now).unwrap();

        let ranked = dir
            .rank_candidates_at("user-1", origin(), 5_000.0, 10, now)
            .unwrap();
        assert!(ranked.is_empty());
    }

    #[test]
    fn test_fewer_than_max_is_not_an_error() {
        let now = Utc::now();
        let dir = directory_with(now, &[("a", ResponderKind::Volunteer, 0.5, 10.0, 0)]);
        let ranked = dir
            .rank_candidates_at("user-1", origin(), 1_000.0, 5, now)
            .unwrap();
        assert_eq!(ranked.len(), 1);
    }

    #[test]
    fn test_heartbeat_keeps_latest_point_only() {
        let now = Utc::now();
        let dir = ResponderDirectory::new(DirectoryConfig::default());
        dir.register_responder(profile("a", ResponderKind::Volunteer, 0.5))
            .unwrap();

        dir.record_heartbeat("a", north_of_origin(100.0), now).unwrap();
        // Older heartbeat arriving late is ignored
        dir.record_heartbeat("a", north_of_origin(4_000.0), now - Duration::seconds(30))
            .unwrap();

        let stored = dir.get("a").unwrap();
        assert_eq!(stored.location, Some(north_of_origin(100.0)));
        assert_eq!(stored.last_active_at, Some(now));

        assert!(matches!(
            dir.record_heartbeat("ghost", origin(), now),
            Err(LifelineError::NotFound(_))
        ));
    }

    #[test]
    fn test_future_heartbeat_is_rejected() {
        let now = Utc::now();
        let dir = ResponderDirectory::new(DirectoryConfig::default());
        dir.register_responder(profile("a", ResponderKind::Volunteer, 0.5))
            .unwrap();

        assert!(matches!(
            dir.record_heartbeat("a", GeoPoint::new(0.0, 0.0), now + Duration::days(365)),
            Err(LifelineError::Validation(_))
        ));
        assert_eq!(dir.get("a").unwrap().last_active_at, None);

        // A later real heartbeat is not shadowed
        dir.record_heartbeat("a", GeoPoint::new(45.0, 45.0), now).unwrap();
        assert_eq!(dir.get("a").unwrap().location, Some(GeoPoint::new(45.0, 45.0)));

        // Small drift inside the allowed skew is fine
        dir.record_heartbeat("a", GeoPoint::new(45.1, 45.0), now + Duration::seconds(5))
            .unwrap();
        assert_eq!(dir.get("a").unwrap().location, Some(GeoPoint::new(45.1, 45.0)));
    }

    #[test]
    fn test_snapshot_is_stable_across_writes() {
        let now = Utc::now();
        let dir = directory_with(now, &[("a", ResponderKind::Volunteer, 0.5, 10.0, 0)]);

        let snapshot = dir.current();
        dir.record_heartbeat("a", north_of_origin(3_000.0), now + Duration::seconds(5))
            .unwrap();

        // The earlier snapshot still sees the old position
        assert_eq!(
            snapshot.responders["a"].location,
            Some(north_of_origin(10.0))
        );
        assert_eq!(dir.get("a").unwrap().location, Some(north_of_origin(3_000.0)));
    }

    fn seed(id: &str, trust: f64, channels: ContactChannels) -> ResponderSeed {
        ResponderSeed {
            responder_id: id.into(),
            name: format!("Seeded {id}"),
            kind: ResponderKind::Guardian,
            trust_score: trust,
            channels,
        }
    }

    #[test]
    fn test_sync_guardians_replaces_links_and_keeps_positions() {
        let now = Utc::now();
        let dir = ResponderDirectory::new(DirectoryConfig::default());

        dir.sync_guardians("user-1", vec![seed("g-1", 0.95, ContactChannels::default())])
            .unwrap();
        dir.record_heartbeat("g-1", north_of_origin(10.0), now).unwrap();
        dir.sync_guardians("user-1", vec![seed("g-1", 0.95, ContactChannels::default())])
            .unwrap();

        let ranked = dir
            .rank_candidates_at("user-1", origin(), 5_000.0, 5, now)
            .unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].name, "Seeded g-1");
        assert_eq!(ranked[0].kind, ResponderKind::Guardian);
        assert_eq!(dir.get("g-1").unwrap().location, Some(north_of_origin(10.0)));

        // Unlinked by the identity view: no longer in the user's pool
        dir.sync_guardians("user-1", Vec::new()).unwrap();
        assert!(dir
            .rank_candidates_at("user-1", origin(), 5_000.0, 5, now)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_guardian_link_does_not_rewrite_a_volunteer() {
        let now = Utc::now();
        let dir = ResponderDirectory::new(DirectoryConfig::default());
        dir.register_responder(ResponderProfile {
            channels: ContactChannels {
                push_token: Some("tok-v".into()),
                ..Default::default()
            },
            ..profile("v", ResponderKind::Volunteer, 0.8)
        })
        .unwrap();
        dir.record_heartbeat("v", origin(), now).unwrap();

        dir.sync_guardians(
            "user-a",
            vec![seed(
                "v",
                0.3,
                ContactChannels {
                    push_token: None,
                    sms_phone: Some("+15550199".into()),
                    mesh_id: Some("mesh-v".into()),
                },
            )],
        )
        .unwrap();

        // Still a volunteer for everyone else
        let other = dir
            .rank_candidates_at("user-b", origin(), 5_000.0, 5, now)
            .unwrap();
        assert_eq!(other.len(), 1);
        assert_eq!(other[0].kind, ResponderKind::Volunteer);

        let linked = dir
            .rank_candidates_at("user-a", origin(), 5_000.0, 5, now)
            .unwrap();
        assert_eq!(linked[0].kind, ResponderKind::Guardian);
        assert_eq!(linked[0].channels.push_token.as_deref(), Some("tok-v"));
        assert_eq!(linked[0].channels.mesh_id.as_deref(), Some("mesh-v"));

        let stored = dir.get("v").unwrap();
        assert_eq!(stored.kind, ResponderKind::Volunteer);
        assert!((stored.trust_score - 0.8).abs() < 1e-9);
        // Registered sms was empty, so the seed fills it in
        assert_eq!(stored.channels.sms_phone.as_deref(), Some("+15550199"));
    }

    #[test]
    fn test_rejects_bad_inputs() {
        let dir = ResponderDirectory::new(DirectoryConfig::default());
        assert!(dir
            .register_responder(profile("a", ResponderKind::Volunteer, 1.5))
            .is_err());
        assert!(dir
            .rank_candidates_at("u", GeoPoint::new(200.0, 0.0), 100.0, 5, Utc::now())
            .is_err());
        assert!(dir
            .rank_candidates_at("u", origin(), 0.0, 5, Utc::now())
            .is_err());
    }
}
