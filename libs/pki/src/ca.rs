//! CA bootstrap, server certificate, and endpoint issuance.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::net::IpAddr;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, DnValue, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use ::time::{Duration, OffsetDateTime};
use tracing::info;
use x509_parser::prelude::*;
use zeroize::Zeroizing;

use crate::error::{PkiError, Result};
use crate::identity::{derive_cn, EndpointRole};
use crate::parse_pem;

/// RSA modulus size for the CA and every issued endpoint key.
pub const DEFAULT_KEY_BITS: usize = 4096;

/// Subject CN of the self-signed root.
const CA_COMMON_NAME: &str = "ZeroTrust CA";

/// Validity of the CA and of every certificate it signs.
const VALIDITY_DAYS: i64 = 3650;

const CA_CERT_FILE: &str = "ca.crt";
const CA_KEY_FILE: &str = "ca.key";
const SERVER_CERT_FILE: &str = "server.crt";
const SERVER_KEY_FILE: &str = "server.key";

/// Credentials issued to a single endpoint.
///
/// The private key exists only here and in the deployment bundle built
/// from it; the gateway keeps the certificate on disk for bookkeeping.
pub struct IssuedCredentials {
    /// The derived CN (`c<hex12>` or `s<hex12>`).
    pub cn: String,
    /// PEM-encoded leaf certificate.
    pub cert_pem: String,
    /// PEM-encoded PKCS#8 private key.
    pub key_pem: Zeroizing<String>,
}

/// The gateway's own TLS identity, shared by both listeners.
pub struct ServerCredentials {
    /// PEM-encoded server certificate.
    pub cert_pem: String,
    /// PEM-encoded PKCS#8 private key.
    pub key_pem: Zeroizing<String>,
}

/// The certificate authority: a self-signed RSA root plus the signing
/// operations the gateway needs.
///
/// The key pair is kept as PEM and re-parsed per signing operation;
/// issuance is rare enough that this does not matter.
pub struct CertificateAuthority {
    ca_cert_pem: String,
    ca_key_pem: Zeroizing<String>,
    key_bits: usize,
}

impl CertificateAuthority {
    /// Generate a fresh self-signed CA.
    pub fn generate(key_bits: usize) -> Result<Self> {
        let (ca_key_pem, key_pair) = generate_rsa_key(key_bits)?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(CA_COMMON_NAME.to_string()),
        );
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        set_validity(&mut params);

        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGeneration(format!("failed to self-sign CA: {e}"))
        })?;

        Ok(Self {
            ca_cert_pem: cert.pem(),
            ca_key_pem,
            key_bits,
        })
    }

    /// Load a CA from PEM material, validating both parts parse.
    pub fn from_pem(cert_pem: &str, key_pem: Zeroizing<String>, key_bits: usize) -> Result<Self> {
        KeyPair::from_pem(&key_pem)
            .map_err(|e| PkiError::Parse(format!("failed to parse CA key: {e}")))?;
        parse_pem(cert_pem)?;

        Ok(Self {
            ca_cert_pem: cert_pem.to_string(),
            ca_key_pem: key_pem,
            key_bits,
        })
    }

    /// Load the CA from `<certs_dir>/ca.{crt,key}`, generating and
    /// persisting a new one if either file is absent.
    pub fn load_or_generate(certs_dir: &Path, key_bits: usize) -> Result<Self> {
        let cert_path = certs_dir.join(CA_CERT_FILE);
        let key_path = certs_dir.join(CA_KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            let cert_pem = fs::read_to_string(&cert_path)?;
            let key_pem = Zeroizing::new(fs::read_to_string(&key_path)?);
            return Self::from_pem(&cert_pem, key_pem, key_bits);
        }

        info!(dir = %certs_dir.display(), "No CA material found, generating");
        let ca = Self::generate(key_bits)?;
        fs::create_dir_all(certs_dir)?;
        write_atomic(&cert_path, ca.ca_cert_pem.as_bytes(), 0o644)?;
        write_atomic(&key_path, ca.ca_key_pem.as_bytes(), 0o600)?;
        Ok(ca)
    }

    /// The CA certificate in PEM form (the trust anchor distributed in
    /// every bundle).
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// The CA private key in PEM form (used to sign configuration tokens).
    pub fn ca_key_pem(&self) -> &str {
        &self.ca_key_pem
    }

    /// Issue credentials for a new endpoint.
    ///
    /// Derives the CN, generates a fresh RSA key, and signs a leaf with
    /// subject `CN=<cn>, O=<Role>-<name>` carrying client and server EKUs.
    /// Nothing is persisted here; registration atomicity is the caller's
    /// responsibility.
    pub fn issue_endpoint(&self, role: EndpointRole, name: &str) -> Result<IssuedCredentials> {
        let cn = derive_cn(role);
        let (key_pem, key_pair) = generate_rsa_key(self.key_bits)?;

        let org = match role {
            EndpointRole::Client => format!("Client-{name}"),
            EndpointRole::Service => format!("Service-{name}"),
        };

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(cn.clone()));
        dn.push(DnType::OrganizationName, DnValue::Utf8String(org));
        params.distinguished_name = dn;

        let csr = params.serialize_request(&key_pair).map_err(|e| {
            PkiError::CertificateGeneration(format!("failed to create CSR: {e}"))
        })?;
        let csr_pem = csr.pem().map_err(|e| {
            PkiError::CertificateGeneration(format!("failed to serialize CSR: {e}"))
        })?;

        let cert_pem = self.sign_request(&csr_pem)?;

        Ok(IssuedCredentials {
            cn,
            cert_pem,
            key_pem,
        })
    }

    /// Sign a CSR into an endpoint leaf certificate.
    ///
    /// The subject is taken from the CSR; validity, usages, and the no-CA
    /// constraint are always imposed here so a crafted CSR cannot widen
    /// them.
    fn sign_request(&self, csr_pem: &str) -> Result<String> {
        let mut csr_params = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| PkiError::Parse(format!("failed to parse CSR: {e}")))?;

        csr_params.params.is_ca = IsCa::NoCa;
        csr_params.params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        csr_params.params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];
        set_validity(&mut csr_params.params);

        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, ca_key)
            .map_err(|e| PkiError::Parse(format!("failed to load issuer: {e}")))?;

        let cert = csr_params.signed_by(&issuer).map_err(|e| {
            PkiError::CertificateGeneration(format!("failed to sign certificate: {e}"))
        })?;

        Ok(cert.pem())
    }

    /// Ensure `<certs_dir>/server.{crt,key}` exist and cover the current
    /// external address, regenerating them when they do not.
    pub fn ensure_server_cert(
        &self,
        certs_dir: &Path,
        server_name: &str,
        external_addr: IpAddr,
    ) -> Result<ServerCredentials> {
        let cert_path = certs_dir.join(SERVER_CERT_FILE);
        let key_path = certs_dir.join(SERVER_KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            let cert_pem = fs::read_to_string(&cert_path)?;
            let key_pem = Zeroizing::new(fs::read_to_string(&key_path)?);
            if server_cert_covers(&cert_pem, server_name, external_addr)? {
                return Ok(ServerCredentials { cert_pem, key_pem });
            }
            info!(addr = %external_addr, "Server certificate stale, regenerating");
        }

        let (key_pem, key_pair) = generate_rsa_key(self.key_bits)?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(server_name.to_string()),
        );
        params.distinguished_name = dn;
        params.subject_alt_names = vec![
            SanType::DnsName(
                Ia5String::try_from(server_name.to_string())
                    .map_err(|e| PkiError::Parse(format!("invalid server name: {e}")))?,
            ),
            SanType::IpAddress(external_addr),
        ];

        let csr = params.serialize_request(&key_pair).map_err(|e| {
            PkiError::CertificateGeneration(format!("failed to create server CSR: {e}"))
        })?;
        let csr_pem = csr.pem().map_err(|e| {
            PkiError::CertificateGeneration(format!("failed to serialize server CSR: {e}"))
        })?;

        let mut csr_params = CertificateSigningRequestParams::from_pem(&csr_pem)
            .map_err(|e| PkiError::Parse(format!("failed to parse server CSR: {e}")))?;
        csr_params.params.is_ca = IsCa::NoCa;
        csr_params.params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        csr_params.params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        csr_params.params.subject_alt_names = vec![
            SanType::DnsName(
                Ia5String::try_from(server_name.to_string())
                    .map_err(|e| PkiError::Parse(format!("invalid server name: {e}")))?,
            ),
            SanType::IpAddress(external_addr),
        ];
        set_validity(&mut csr_params.params);

        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, ca_key)
            .map_err(|e| PkiError::Parse(format!("failed to load issuer: {e}")))?;
        let cert = csr_params.signed_by(&issuer).map_err(|e| {
            PkiError::CertificateGeneration(format!("failed to sign server certificate: {e}"))
        })?;

        let cert_pem = cert.pem();
        fs::create_dir_all(certs_dir)?;
        write_atomic(&cert_path, cert_pem.as_bytes(), 0o644)?;
        write_atomic(&key_path, key_pem.as_bytes(), 0o600)?;

        Ok(ServerCredentials { cert_pem, key_pem })
    }

    fn load_key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::Parse(format!("failed to load CA key: {e}")))
    }
}

/// Generate an RSA key, returning it as PKCS#8 PEM plus the rcgen signing
/// handle for the same key.
fn generate_rsa_key(bits: usize) -> Result<(Zeroizing<String>, KeyPair)> {
    let key = RsaPrivateKey::new(&mut rand::rngs::OsRng, bits)
        .map_err(|e| PkiError::KeyGeneration(e.to_string()))?;
    let key_pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| PkiError::KeyGeneration(format!("failed to encode key: {e}")))?;
    let key_pair = KeyPair::from_pem(&key_pem)
        .map_err(|e| PkiError::KeyGeneration(format!("failed to load generated key: {e}")))?;
    Ok((key_pem, key_pair))
}

/// Whether an existing server certificate is still valid and lists both
/// the server name and the external address in its SANs.
fn server_cert_covers(cert_pem: &str, server_name: &str, external_addr: IpAddr) -> Result<bool> {
    let der = parse_pem(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| PkiError::Parse(format!("failed to parse server certificate: {e}")))?;

    if !cert.validity().is_valid() {
        return Ok(false);
    }

    let san = match cert.subject_alternative_name() {
        Ok(Some(ext)) => ext.value,
        _ => return Ok(false),
    };

    let mut has_name = false;
    let mut has_addr = false;
    for name in &san.general_names {
        match name {
            GeneralName::DNSName(dns) => has_name |= dns.eq_ignore_ascii_case(server_name),
            GeneralName::IPAddress(bytes) => {
                has_addr |= match external_addr {
                    IpAddr::V4(v4) => bytes == &v4.octets(),
                    IpAddr::V6(v6) => bytes == &v6.octets(),
                }
            }
            _ => {}
        }
    }

    Ok(has_name && has_addr)
}

fn set_validity(params: &mut CertificateParams) {
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(1);
    params.not_after = now + Duration::days(VALIDITY_DAYS);
}

/// Write a file atomically (temp + rename) with the given mode.
fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(&tmp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::verify_issued_cert;
    use crate::test_support::test_ca;

    #[test]
    fn generated_ca_is_pem() {
        let ca = test_ca();
        assert!(ca.ca_cert_pem().contains("BEGIN CERTIFICATE"));
        assert!(ca.ca_key_pem().contains("BEGIN PRIVATE KEY"));
    }

    #[test]
    fn issued_endpoint_verifies_against_ca() {
        let ca = test_ca();
        let issued = ca.issue_endpoint(EndpointRole::Client, "alice").unwrap();

        assert!(issued.cn.starts_with('c'));
        assert!(issued.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(issued.key_pem.contains("BEGIN PRIVATE KEY"));

        let der = parse_pem(&issued.cert_pem).unwrap();
        let identity = verify_issued_cert(&der, ca.ca_cert_pem()).unwrap();
        assert_eq!(identity.cn, issued.cn);
        assert_eq!(identity.role, EndpointRole::Client);
    }

    #[test]
    fn foreign_ca_is_rejected() {
        let ca = test_ca();
        let other = CertificateAuthority::generate(crate::test_support::TEST_KEY_BITS).unwrap();
        let issued = ca.issue_endpoint(EndpointRole::Service, "pg").unwrap();

        let der = parse_pem(&issued.cert_pem).unwrap();
        let err = verify_issued_cert(&der, other.ca_cert_pem()).unwrap_err();
        assert!(matches!(err, PkiError::Verification(_)));
    }

    #[test]
    fn ca_roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::load_or_generate(
            dir.path(),
            crate::test_support::TEST_KEY_BITS,
        )
        .unwrap();
        let reloaded = CertificateAuthority::load_or_generate(
            dir.path(),
            crate::test_support::TEST_KEY_BITS,
        )
        .unwrap();
        assert_eq!(ca.ca_cert_pem(), reloaded.ca_cert_pem());

        // The reloaded CA can still issue.
        let issued = reloaded.issue_endpoint(EndpointRole::Client, "bob").unwrap();
        let der = parse_pem(&issued.cert_pem).unwrap();
        verify_issued_cert(&der, ca.ca_cert_pem()).unwrap();
    }

    #[test]
    fn server_cert_regenerates_on_address_change() {
        let dir = tempfile::tempdir().unwrap();
        let ca = test_ca();

        let first = ca
            .ensure_server_cert(dir.path(), "dns-server", "10.0.0.1".parse().unwrap())
            .unwrap();
        let same = ca
            .ensure_server_cert(dir.path(), "dns-server", "10.0.0.1".parse().unwrap())
            .unwrap();
        assert_eq!(first.cert_pem, same.cert_pem);

        let changed = ca
            .ensure_server_cert(dir.path(), "dns-server", "10.0.0.2".parse().unwrap())
            .unwrap();
        assert_ne!(first.cert_pem, changed.cert_pem);
        assert!(server_cert_covers(&changed.cert_pem, "dns-server", "10.0.0.2".parse().unwrap())
            .unwrap());
    }
}
