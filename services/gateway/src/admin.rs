//! Administrative operations: issuance, registration, cascade deletion,
//! access-list edits, and bundle assembly.
//!
//! Issuance and registration are atomic as a pair: the endpoint record
//! is committed first, then the credential files; if the files cannot be
//! written the record is rolled back, so a certificate on disk without a
//! registered endpoint (or vice versa) cannot happen.

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use chrono::{Duration, Utc};
use thiserror::Error;
use tracing::{error, info};
use zeroize::Zeroizing;

use ztp_pki::{CertificateAuthority, EndpointRole, IssuedCredentials, PkiError};
use ztp_signed_config::{ConfigError, ConfigPayload};

use crate::bundle::{self, BundleContents};
use crate::config::Config;
use crate::store::{normalize_name, Endpoint, RecordKind, Route, Store, StoreError, ZoneRecord};

/// Lifetime of a signed configuration, matching certificate lifetime.
const CONFIG_VALIDITY_DAYS: i64 = 3650;

/// Administrative errors.
#[derive(Debug, Error)]
pub enum AdminError {
    /// The platform tag is not in the platform map.
    #[error("unknown platform {0:?}")]
    UnknownPlatform(String),

    /// The endpoint binary for the platform has not been built.
    #[error("endpoint binary {0} not found")]
    MissingBinary(String),

    /// Registry failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Credential issuance failure.
    #[error(transparent)]
    Pki(#[from] PkiError),

    /// Token signing failure.
    #[error("config token error: {0}")]
    Token(#[from] ConfigError),

    /// Credential file IO.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The state shared by the admin API handlers.
pub struct Admin {
    pub config: Config,
    pub store: Arc<Store>,
    pub ca: CertificateAuthority,
}

/// Outcome of creating an endpoint.
#[derive(Debug)]
pub struct Created {
    pub cn: String,
}

impl Admin {
    /// Issue credentials and register a client endpoint.
    pub async fn create_client(&self, name: &str, platform: &str) -> Result<Created, AdminError> {
        self.require_binary(EndpointRole::Client, platform)?;

        let issued = self.ca.issue_endpoint(EndpointRole::Client, name)?;
        let endpoint = Endpoint {
            role: EndpointRole::Client,
            name: name.to_string(),
            platform: platform.to_string(),
            created: Utc::now(),
            domains: vec![],
        };

        self.store.insert_client(&issued.cn, endpoint).await?;
        self.persist_credentials(&issued).await?;

        info!(cn = %issued.cn, name, "Client endpoint created");
        Ok(Created { cn: issued.cn })
    }

    /// Issue credentials, register a service endpoint, and create its
    /// route and zones in one transaction.
    ///
    /// A-record values are pinned to the gateway's external address:
    /// private DNS always advertises the gateway, never a backend.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_service(
        &self,
        name: &str,
        platform: &str,
        backend_host: &str,
        backend_port: u16,
        domains: &[String],
        records: &BTreeMap<String, Vec<ZoneRecord>>,
    ) -> Result<Created, AdminError> {
        self.require_binary(EndpointRole::Service, platform)?;

        let domains: Vec<String> = domains
            .iter()
            .map(|d| normalize_name(d))
            .filter(|d| !d.is_empty())
            .collect();

        let gateway_a = ZoneRecord {
            kind: RecordKind::A,
            value: self.config.external_addr.to_string(),
        };

        let mut zone_records: BTreeMap<String, Vec<ZoneRecord>> = BTreeMap::new();
        for (label, entries) in records {
            let pinned = entries
                .iter()
                .map(|record| match record.kind {
                    RecordKind::A => gateway_a.clone(),
                    RecordKind::Cname => record.clone(),
                })
                .collect();
            zone_records.insert(label.clone(), pinned);
        }
        if zone_records.is_empty() {
            zone_records.insert("@".to_string(), vec![gateway_a]);
        }

        let issued = self.ca.issue_endpoint(EndpointRole::Service, name)?;
        let endpoint = Endpoint {
            role: EndpointRole::Service,
            name: name.to_string(),
            platform: platform.to_string(),
            created: Utc::now(),
            domains: domains.clone(),
        };
        let route = Route {
            host: backend_host.to_string(),
            port: backend_port,
            domains: domains.clone(),
            name: name.to_string(),
        };
        let zones = domains
            .iter()
            .map(|domain| (domain.clone(), zone_records.clone()))
            .collect();

        self.store
            .insert_service(&issued.cn, endpoint, route, zones)
            .await?;
        self.persist_credentials(&issued).await?;

        info!(cn = %issued.cn, name, domains = ?domains, "Service endpoint created");
        Ok(Created { cn: issued.cn })
    }

    /// Delete an endpoint, cascading over zones and routes, and remove
    /// its credential files.
    pub async fn delete_endpoint(&self, cn: &str) -> Result<(), AdminError> {
        let endpoint = self.store.delete_endpoint(cn).await?;

        let certs_dir = self.config.certs_dir();
        for file in [format!("{cn}.crt"), format!("{cn}.key")] {
            if let Err(e) = fs::remove_file(certs_dir.join(&file)) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    error!(cn, file, error = %e, "Failed to remove credential file");
                }
            }
        }

        info!(cn, role = %endpoint.role, "Endpoint deleted");
        Ok(())
    }

    /// Add a CN to a zone's access list.
    pub async fn authorize(&self, zone: &str, cn: &str) -> Result<(), AdminError> {
        self.store.authorize(zone, cn).await?;
        info!(zone, cn, "Endpoint authorized");
        Ok(())
    }

    /// Remove a CN from a zone's access list.
    pub async fn deauthorize(&self, zone: &str, cn: &str) -> Result<(), AdminError> {
        self.store.deauthorize(zone, cn).await?;
        info!(zone, cn, "Endpoint deauthorized");
        Ok(())
    }

    /// Assemble the deployment bundle for an endpoint.
    pub async fn bundle(&self, cn: &str) -> Result<(String, Vec<u8>), AdminError> {
        let endpoint = self
            .store
            .endpoint(cn)
            .await
            .ok_or_else(|| StoreError::UnknownEndpoint(cn.to_string()))?;

        let binary_name = self.require_binary(endpoint.role, &endpoint.platform)?;
        let binary = fs::read(self.config.binaries_dir.join(binary_name))?;

        let certs_dir = self.config.certs_dir();
        let cert_pem = fs::read_to_string(certs_dir.join(format!("{cn}.crt")))?;
        let key_pem = Zeroizing::new(fs::read_to_string(certs_dir.join(format!("{cn}.key")))?);

        let payload = ConfigPayload {
            server: self.config.advertised_server(),
            proxy: self.config.advertised_proxy(),
            server_name: self.config.server_name.clone(),
            role: endpoint.role,
            domains: endpoint.domains.clone(),
            expires: Utc::now() + Duration::days(CONFIG_VALIDITY_DAYS),
        };
        let token = ztp_signed_config::sign(&payload, self.ca.ca_key_pem())?;

        let readme = match endpoint.role {
            EndpointRole::Client => format!(
                "ZeroTrust Client: {}\nRun binary -> DNS = 127.0.0.1\nAll service traffic routed through {}\n",
                endpoint.name,
                self.config.advertised_proxy(),
            ),
            EndpointRole::Service => format!(
                "ZeroTrust Service: {}\nConnects to gateway at: {}\nClients are routed through the gateway\n",
                endpoint.name,
                self.config.advertised_proxy(),
            ),
        };

        let bytes = bundle::build(&BundleContents {
            binary_name,
            binary: &binary,
            endpoint_cert_pem: &cert_pem,
            endpoint_key_pem: &key_pem,
            ca_cert_pem: self.ca.ca_cert_pem(),
            config_token: &token,
            readme: &readme,
        })?;

        Ok((format!("{cn}-{}.tar.gz", endpoint.role), bytes))
    }

    fn require_binary(
        &self,
        role: EndpointRole,
        platform: &str,
    ) -> Result<&'static str, AdminError> {
        let binary = bundle::binary_for(role, platform)
            .ok_or_else(|| AdminError::UnknownPlatform(platform.to_string()))?;
        if !self.config.binaries_dir.join(binary).exists() {
            return Err(AdminError::MissingBinary(binary.to_string()));
        }
        Ok(binary)
    }

    /// Write `<cn>.crt` and `<cn>.key`, rolling the registration back if
    /// that fails.
    async fn persist_credentials(&self, issued: &IssuedCredentials) -> Result<(), AdminError> {
        let certs_dir = self.config.certs_dir();
        let result = (|| -> std::io::Result<()> {
            fs::create_dir_all(&certs_dir)?;
            fs::write(certs_dir.join(format!("{}.crt", issued.cn)), &issued.cert_pem)?;
            write_restricted(
                &certs_dir.join(format!("{}.key", issued.cn)),
                issued.key_pem.as_bytes(),
            )
        })();

        if let Err(e) = result {
            error!(cn = %issued.cn, error = %e, "Failed to persist credentials, rolling back");
            if let Err(rollback) = self.store.delete_endpoint(&issued.cn).await {
                error!(cn = %issued.cn, error = %rollback, "Rollback failed");
            }
            return Err(e.into());
        }
        Ok(())
    }
}

fn write_restricted(path: &std::path::Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)
}
