//! The endpoint/zone/route registry.
//!
//! Three JSON documents loaded at startup into an in-memory mirror behind
//! a read/write lock. Mutations clone the current data, apply the change,
//! persist, then commit the clone — a failed write leaves both memory and
//! disk at the pre-mutation state. The resolver and proxy take only short
//! read-side critical sections to snapshot what they need.
//!
//! Referential invariants enforced here:
//! - every CN in any access list references an existing endpoint;
//! - every route key references an existing service endpoint;
//! - every zone with a `service_cn` has a route under that CN listing the
//!   zone in its domains;
//! - deleting an endpoint prunes all of the above in one step.

mod persistence;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use ztp_pki::EndpointRole;

use persistence::Persistence;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The referenced endpoint does not exist.
    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),

    /// The referenced zone does not exist.
    #[error("unknown zone: {0}")]
    UnknownZone(String),

    /// A zone is already owned by a different service.
    #[error("zone {zone} is already owned by {owner}")]
    ZoneOwned { zone: String, owner: String },

    /// A zone name failed normalization.
    #[error("invalid zone name: {0:?}")]
    InvalidZoneName(String),

    /// A document failed to load or write.
    #[error("failed to persist {file}: {reason}")]
    Persist { file: String, reason: String },
}

/// A peer authorized to use the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Role encoded in the CN as well; kept explicit for listings.
    #[serde(rename = "type")]
    pub role: EndpointRole,
    /// Friendly name.
    pub name: String,
    /// Platform tag (selects the bundle binary).
    pub platform: String,
    /// Creation time.
    pub created: DateTime<Utc>,
    /// Domains this endpoint serves (empty for clients).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<String>,
}

/// Record type inside a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordKind {
    A,
    #[serde(rename = "CNAME")]
    Cname,
}

/// A single record under a zone label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneRecord {
    #[serde(rename = "type")]
    pub kind: RecordKind,
    pub value: String,
}

/// An authoritative private zone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    /// Records by label (`@` for the apex, `*` for the wildcard).
    pub records: BTreeMap<String, Vec<ZoneRecord>>,
    /// CN of the owning service endpoint, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_cn: Option<String>,
    /// CNs permitted to query and tunnel to this zone.
    #[serde(default)]
    pub allowed_endpoints: BTreeSet<String>,
}

impl Zone {
    /// Whether a CN may query and tunnel to this zone.
    pub fn allows(&self, cn: &str) -> bool {
        self.allowed_endpoints.contains(cn)
    }
}

/// Mapping from a service endpoint to its real backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Backend host (IP literal or hostname).
    pub host: String,
    /// Backend port.
    pub port: u16,
    /// Domains this service answers.
    pub domains: Vec<String>,
    /// Display name.
    pub name: String,
}

/// The full registry state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreData {
    pub endpoints: BTreeMap<String, Endpoint>,
    pub zones: BTreeMap<String, Zone>,
    pub routes: BTreeMap<String, Route>,
}

/// Normalize a zone or query name: lower-case, no trailing dot.
pub fn normalize_name(name: &str) -> String {
    name.trim().trim_end_matches('.').to_lowercase()
}

/// Whether `qname` equals `zone` or is a subdomain of it.
/// Both must already be normalized.
pub fn zone_matches(qname: &str, zone: &str) -> bool {
    qname == zone || qname.ends_with(&format!(".{zone}"))
}

/// The shared registry.
pub struct Store {
    data: RwLock<StoreData>,
    persistence: Persistence,
}

impl Store {
    /// Load the registry from `<dir>/{endpoints,zones,routes}.json`.
    pub fn open(dir: PathBuf) -> Result<Self, StoreError> {
        let persistence = Persistence::new(dir);
        let data = persistence.load()?;
        info!(
            endpoints = data.endpoints.len(),
            zones = data.zones.len(),
            routes = data.routes.len(),
            "Registry loaded"
        );
        Ok(Self {
            data: RwLock::new(data),
            persistence,
        })
    }

    // ---------------------------------------------------------------------
    // Mutations
    // ---------------------------------------------------------------------

    /// Register a client endpoint.
    pub async fn insert_client(&self, cn: &str, endpoint: Endpoint) -> Result<(), StoreError> {
        let mut guard = self.data.write().await;
        let mut next = guard.clone();
        next.endpoints.insert(cn.to_string(), endpoint);
        self.persistence.persist(&guard, &next)?;
        *guard = next;
        Ok(())
    }

    /// Register a service endpoint together with its route and zones, in
    /// one transaction.
    ///
    /// Every zone gets `service_cn = cn` and an access list seeded with
    /// the service's own CN; a zone already owned by a different service
    /// is a conflict. An unowned zone (one that resolved only to the
    /// gateway) is adopted, keeping its access list.
    pub async fn insert_service(
        &self,
        cn: &str,
        endpoint: Endpoint,
        route: Route,
        zone_records: BTreeMap<String, BTreeMap<String, Vec<ZoneRecord>>>,
    ) -> Result<(), StoreError> {
        let mut guard = self.data.write().await;
        let mut next = guard.clone();

        for (zone_name, records) in zone_records {
            let zone_name = normalize_name(&zone_name);
            if zone_name.is_empty() {
                return Err(StoreError::InvalidZoneName(zone_name));
            }
            if let Some(existing) = next.zones.get(&zone_name) {
                if let Some(owner) = existing.service_cn.as_deref() {
                    if owner != cn {
                        return Err(StoreError::ZoneOwned {
                            zone: zone_name,
                            owner: owner.to_string(),
                        });
                    }
                }
            }

            let zone = next.zones.entry(zone_name).or_default();
            zone.records = records;
            zone.service_cn = Some(cn.to_string());
            zone.allowed_endpoints.insert(cn.to_string());
        }

        next.endpoints.insert(cn.to_string(), endpoint);
        next.routes.insert(cn.to_string(), route);

        self.persistence.persist(&guard, &next)?;
        *guard = next;
        Ok(())
    }

    /// Delete an endpoint, cascading over every reference to its CN:
    /// access lists everywhere, and for services the route and all owned
    /// zones.
    pub async fn delete_endpoint(&self, cn: &str) -> Result<Endpoint, StoreError> {
        let mut guard = self.data.write().await;
        let mut next = guard.clone();

        let endpoint = next
            .endpoints
            .remove(cn)
            .ok_or_else(|| StoreError::UnknownEndpoint(cn.to_string()))?;

        for zone in next.zones.values_mut() {
            zone.allowed_endpoints.remove(cn);
        }

        if endpoint.role == EndpointRole::Service {
            next.routes.remove(cn);
            next.zones
                .retain(|_, zone| zone.service_cn.as_deref() != Some(cn));
        }

        self.persistence.persist(&guard, &next)?;
        *guard = next;
        Ok(endpoint)
    }

    /// Add a CN to a zone's access list.
    pub async fn authorize(&self, zone_name: &str, cn: &str) -> Result<(), StoreError> {
        let zone_name = normalize_name(zone_name);
        let mut guard = self.data.write().await;
        let mut next = guard.clone();

        if !next.endpoints.contains_key(cn) {
            return Err(StoreError::UnknownEndpoint(cn.to_string()));
        }
        let zone = next
            .zones
            .get_mut(&zone_name)
            .ok_or(StoreError::UnknownZone(zone_name))?;
        zone.allowed_endpoints.insert(cn.to_string());

        self.persistence.persist(&guard, &next)?;
        *guard = next;
        Ok(())
    }

    /// Remove a CN from a zone's access list (idempotent).
    pub async fn deauthorize(&self, zone_name: &str, cn: &str) -> Result<(), StoreError> {
        let zone_name = normalize_name(zone_name);
        let mut guard = self.data.write().await;
        let mut next = guard.clone();

        let zone = next
            .zones
            .get_mut(&zone_name)
            .ok_or(StoreError::UnknownZone(zone_name))?;
        zone.allowed_endpoints.remove(cn);

        self.persistence.persist(&guard, &next)?;
        *guard = next;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Read side
    // ---------------------------------------------------------------------

    /// Whether an endpoint with this CN exists.
    pub async fn endpoint_exists(&self, cn: &str) -> bool {
        self.data.read().await.endpoints.contains_key(cn)
    }

    /// Snapshot of the endpoint registered under a CN.
    pub async fn endpoint(&self, cn: &str) -> Option<Endpoint> {
        self.data.read().await.endpoints.get(cn).cloned()
    }

    /// Longest-suffix zone match for a normalized query name.
    pub async fn find_zone(&self, qname: &str) -> Option<(String, Zone)> {
        let guard = self.data.read().await;
        guard
            .zones
            .iter()
            .filter(|(zone_name, _)| zone_matches(qname, zone_name))
            .max_by_key(|(zone_name, _)| zone_name.len())
            .map(|(zone_name, zone)| (zone_name.clone(), zone.clone()))
    }

    /// Route snapshot for a service CN.
    pub async fn route(&self, cn: &str) -> Option<Route> {
        self.data.read().await.routes.get(cn).cloned()
    }

    /// All zone names (for the proxy's literal hostname scan).
    pub async fn zone_names(&self) -> Vec<String> {
        self.data.read().await.zones.keys().cloned().collect()
    }

    /// Full endpoint listing.
    pub async fn endpoints(&self) -> BTreeMap<String, Endpoint> {
        self.data.read().await.endpoints.clone()
    }

    /// Full zone listing.
    pub async fn zones(&self) -> BTreeMap<String, Zone> {
        self.data.read().await.zones.clone()
    }

    /// Full route listing.
    pub async fn routes(&self) -> BTreeMap<String, Route> {
        self.data.read().await.routes.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(role: EndpointRole, name: &str) -> Endpoint {
        Endpoint {
            role,
            name: name.to_string(),
            platform: "linux-x64".to_string(),
            created: Utc::now(),
            domains: match role {
                EndpointRole::Service => vec!["db.internal.corp".to_string()],
                EndpointRole::Client => vec![],
            },
        }
    }

    fn route() -> Route {
        Route {
            host: "10.10.10.50".to_string(),
            port: 5432,
            domains: vec!["db.internal.corp".to_string()],
            name: "pg-prod".to_string(),
        }
    }

    fn records() -> BTreeMap<String, Vec<ZoneRecord>> {
        BTreeMap::from([(
            "@".to_string(),
            vec![ZoneRecord {
                kind: RecordKind::A,
                value: "203.0.113.7".to_string(),
            }],
        )])
    }

    async fn store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().to_path_buf()).unwrap();
        (dir, store)
    }

    async fn seed_service(store: &Store, cn: &str) {
        store
            .insert_service(
                cn,
                endpoint(EndpointRole::Service, "pg-prod"),
                route(),
                BTreeMap::from([("db.internal.corp".to_string(), records())]),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn service_creation_seeds_zone_and_route() {
        let (_dir, store) = store().await;
        seed_service(&store, "s000000000001").await;

        let (zone_name, zone) = store.find_zone("db.internal.corp").await.unwrap();
        assert_eq!(zone_name, "db.internal.corp");
        assert_eq!(zone.service_cn.as_deref(), Some("s000000000001"));
        assert!(zone.allows("s000000000001"));

        let route = store.route("s000000000001").await.unwrap();
        assert_eq!(route.port, 5432);
        assert!(route.domains.contains(&"db.internal.corp".to_string()));
    }

    #[tokio::test]
    async fn longest_suffix_zone_wins() {
        let (_dir, store) = store().await;
        seed_service(&store, "s000000000001").await;
        store
            .insert_service(
                "s000000000002",
                endpoint(EndpointRole::Service, "inner"),
                Route {
                    domains: vec!["replica.db.internal.corp".to_string()],
                    ..route()
                },
                BTreeMap::from([("replica.db.internal.corp".to_string(), records())]),
            )
            .await
            .unwrap();

        let (zone_name, _) = store.find_zone("x.replica.db.internal.corp").await.unwrap();
        assert_eq!(zone_name, "replica.db.internal.corp");

        let (zone_name, _) = store.find_zone("other.db.internal.corp").await.unwrap();
        assert_eq!(zone_name, "db.internal.corp");

        assert!(store.find_zone("internal.corp").await.is_none());
        // Suffix match must respect label boundaries.
        assert!(store.find_zone("xdb.internal.corp").await.is_none());
    }

    #[tokio::test]
    async fn zone_owned_by_another_service_is_a_conflict() {
        let (_dir, store) = store().await;
        seed_service(&store, "s000000000001").await;

        let err = store
            .insert_service(
                "s000000000002",
                endpoint(EndpointRole::Service, "intruder"),
                route(),
                BTreeMap::from([("db.internal.corp".to_string(), records())]),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::ZoneOwned { .. }));
        // Nothing from the failed transaction may survive.
        assert!(!store.endpoint_exists("s000000000002").await);
        assert!(store.route("s000000000002").await.is_none());
    }

    #[tokio::test]
    async fn authorize_requires_existing_endpoint_and_zone() {
        let (_dir, store) = store().await;
        seed_service(&store, "s000000000001").await;
        store
            .insert_client("c000000000001", endpoint(EndpointRole::Client, "alice"))
            .await
            .unwrap();

        store.authorize("db.internal.corp", "c000000000001").await.unwrap();
        let (_, zone) = store.find_zone("db.internal.corp").await.unwrap();
        assert!(zone.allows("c000000000001"));

        assert!(matches!(
            store.authorize("db.internal.corp", "c00000000dead").await,
            Err(StoreError::UnknownEndpoint(_))
        ));
        assert!(matches!(
            store.authorize("nosuch.zone", "c000000000001").await,
            Err(StoreError::UnknownZone(_))
        ));
    }

    #[tokio::test]
    async fn delete_cascades_over_zones_and_routes() {
        let (_dir, store) = store().await;
        seed_service(&store, "s000000000001").await;
        store
            .insert_client("c000000000001", endpoint(EndpointRole::Client, "alice"))
            .await
            .unwrap();
        store.authorize("db.internal.corp", "c000000000001").await.unwrap();

        // Deleting the client prunes it from the access list.
        store.delete_endpoint("c000000000001").await.unwrap();
        let (_, zone) = store.find_zone("db.internal.corp").await.unwrap();
        assert!(!zone.allows("c000000000001"));

        // Deleting the service removes its zone and route; the client's
        // record (already gone here) would be untouched.
        store.delete_endpoint("s000000000001").await.unwrap();
        assert!(store.find_zone("db.internal.corp").await.is_none());
        assert!(store.route("s000000000001").await.is_none());
        assert!(store.endpoints().await.is_empty());
    }

    #[tokio::test]
    async fn create_then_delete_restores_prior_state() {
        let (dir, store) = store().await;
        seed_service(&store, "s000000000001").await;

        let endpoints_before = std::fs::read_to_string(dir.path().join("endpoints.json")).unwrap();
        let zones_before = std::fs::read_to_string(dir.path().join("zones.json")).unwrap();
        let routes_before = std::fs::read_to_string(dir.path().join("routes.json")).unwrap();

        store
            .insert_client("c0000000beef", endpoint(EndpointRole::Client, "eve"))
            .await
            .unwrap();
        store.authorize("db.internal.corp", "c0000000beef").await.unwrap();
        store.delete_endpoint("c0000000beef").await.unwrap();

        assert_eq!(
            endpoints_before,
            std::fs::read_to_string(dir.path().join("endpoints.json")).unwrap()
        );
        assert_eq!(
            zones_before,
            std::fs::read_to_string(dir.path().join("zones.json")).unwrap()
        );
        assert_eq!(
            routes_before,
            std::fs::read_to_string(dir.path().join("routes.json")).unwrap()
        );
    }

    #[tokio::test]
    async fn registry_survives_reload() {
        let (dir, store) = store().await;
        seed_service(&store, "s000000000001").await;
        drop(store);

        let reloaded = Store::open(dir.path().to_path_buf()).unwrap();
        assert!(reloaded.endpoint_exists("s000000000001").await);
        let (_, zone) = reloaded.find_zone("db.internal.corp").await.unwrap();
        assert_eq!(zone.service_cn.as_deref(), Some("s000000000001"));
    }

    #[test]
    fn name_normalization() {
        assert_eq!(normalize_name("DB.Internal.Corp."), "db.internal.corp");
        assert_eq!(normalize_name("  db.internal.corp "), "db.internal.corp");
        assert!(zone_matches("db.internal.corp", "db.internal.corp"));
        assert!(zone_matches("a.db.internal.corp", "db.internal.corp"));
        assert!(!zone_matches("xdb.internal.corp", "db.internal.corp"));
    }
}
