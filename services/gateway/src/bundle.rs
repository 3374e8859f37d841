//! Deployment bundle assembly.
//!
//! A bundle is a gzip'd tar delivered to exactly one endpoint: the
//! endpoint binary for its platform, its certificate and private key,
//! the CA certificate, the signed configuration token, and a short
//! README. Bundles are assembled in memory per request; nothing is
//! cached on disk.

use std::io::{self, Write};

use flate2::write::GzEncoder;
use flate2::Compression;

use ztp_pki::EndpointRole;

/// Platform tags accepted by the API, with the binary shipped for each.
const CLIENT_BINARIES: &[(&str, &str)] = &[
    ("win-x64", "ZeroTrust-Client-x64.exe"),
    ("win-arm64", "ZeroTrust-Client-ARM64.exe"),
    ("linux-x64", "ZeroTrust-Client-x86_64"),
    ("linux-arm64", "ZeroTrust-Client-arm64"),
];

const SERVICE_BINARIES: &[(&str, &str)] = &[
    ("win-x64", "ZeroTrust-Service-x64.exe"),
    ("win-arm64", "ZeroTrust-Service-ARM64.exe"),
    ("linux-x64", "ZeroTrust-Service-x86_64"),
    ("linux-arm64", "ZeroTrust-Service-arm64"),
];

/// The binary name for a role/platform pair, if the platform is known.
pub fn binary_for(role: EndpointRole, platform: &str) -> Option<&'static str> {
    let table = match role {
        EndpointRole::Client => CLIENT_BINARIES,
        EndpointRole::Service => SERVICE_BINARIES,
    };
    table
        .iter()
        .find(|(tag, _)| *tag == platform)
        .map(|(_, binary)| *binary)
}

/// Everything that goes into one bundle.
pub struct BundleContents<'a> {
    pub binary_name: &'a str,
    pub binary: &'a [u8],
    pub endpoint_cert_pem: &'a str,
    pub endpoint_key_pem: &'a str,
    pub ca_cert_pem: &'a str,
    pub config_token: &'a str,
    pub readme: &'a str,
}

/// Assemble the gzip'd tar in memory.
pub fn build(contents: &BundleContents<'_>) -> io::Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut tar = tar::Builder::new(encoder);

    append(&mut tar, contents.binary_name, contents.binary, 0o755)?;
    append(&mut tar, "endpoint.crt", contents.endpoint_cert_pem.as_bytes(), 0o644)?;
    append(&mut tar, "endpoint.key", contents.endpoint_key_pem.as_bytes(), 0o600)?;
    append(&mut tar, "ca.crt", contents.ca_cert_pem.as_bytes(), 0o644)?;
    append(&mut tar, "config.zt", contents.config_token.as_bytes(), 0o644)?;
    append(&mut tar, "README.txt", contents.readme.as_bytes(), 0o644)?;

    let encoder = tar.into_inner()?;
    encoder.finish()
}

fn append<W: Write>(
    tar: &mut tar::Builder<W>,
    name: &str,
    data: &[u8],
    mode: u32,
) -> io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(mode);
    header.set_mtime(0);
    tar.append_data(&mut header, name, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[test]
    fn platform_map_is_per_role() {
        assert_eq!(
            binary_for(EndpointRole::Client, "linux-x64"),
            Some("ZeroTrust-Client-x86_64")
        );
        assert_eq!(
            binary_for(EndpointRole::Service, "win-arm64"),
            Some("ZeroTrust-Service-ARM64.exe")
        );
        assert_eq!(binary_for(EndpointRole::Client, "freebsd"), None);
    }

    #[test]
    fn bundle_contains_all_files() {
        let bytes = build(&BundleContents {
            binary_name: "ZeroTrust-Client-x86_64",
            binary: b"\x7fELF...",
            endpoint_cert_pem: "CERT",
            endpoint_key_pem: "KEY",
            ca_cert_pem: "CA",
            config_token: "a.b",
            readme: "hello",
        })
        .unwrap();

        let mut archive = tar::Archive::new(GzDecoder::new(bytes.as_slice()));
        let mut names = Vec::new();
        let mut key_mode = 0;
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            if name == "config.zt" {
                let mut token = String::new();
                entry.read_to_string(&mut token).unwrap();
                assert_eq!(token, "a.b");
            }
            if name == "endpoint.key" {
                key_mode = entry.header().mode().unwrap();
            }
            names.push(name);
        }

        assert_eq!(
            names,
            vec![
                "ZeroTrust-Client-x86_64",
                "endpoint.crt",
                "endpoint.key",
                "ca.crt",
                "config.zt",
                "README.txt"
            ]
        );
        assert_eq!(key_mode, 0o600);
    }
}
