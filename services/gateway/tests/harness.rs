//! Test harness for gateway integration tests.
//!
//! Provides a shared test PKI (one CA, pre-issued endpoint credentials),
//! helpers to spawn the DoT and proxy listeners on ephemeral ports with
//! a fresh registry, a stub public upstream, and a byte-capturing
//! backend.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once, OnceLock};

use chrono::Utc;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{rdata, Name, RData, RecordType};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_rustls::TlsConnector;

use ztp_gateway::dns::DotServer;
use ztp_gateway::proxy::ProxyServer;
use ztp_gateway::store::{Endpoint, RecordKind, Route, Store, ZoneRecord};
use ztp_gateway::tls;
use ztp_pki::{CertificateAuthority, EndpointRole, IssuedCredentials};

/// External address the test gateway advertises in A records.
pub const EXTERNAL_ADDR: &str = "203.0.113.7";

/// Server name on the gateway certificate.
pub const SERVER_NAME: &str = "dns-server";

static INIT_CRYPTO: Once = Once::new();

pub fn init_crypto_provider() {
    INIT_CRYPTO.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();
    });
}

/// One CA and a set of pre-issued credentials shared by every test in
/// the binary; 2048-bit keys keep generation cheap.
#[allow(dead_code)]
pub struct TestPki {
    pub ca: CertificateAuthority,
    pub server_cert_pem: String,
    pub server_key_pem: String,
    pub alice: IssuedCredentials,
    pub mallory: IssuedCredentials,
    pub service: IssuedCredentials,
    pub stranger: IssuedCredentials,
    _certs_dir: tempfile::TempDir,
}

static PKI: OnceLock<TestPki> = OnceLock::new();

pub fn test_pki() -> &'static TestPki {
    PKI.get_or_init(|| {
        init_crypto_provider();
        let ca = CertificateAuthority::generate(2048).expect("generate test CA");
        let certs_dir = tempfile::tempdir().expect("certs dir");
        let server = ca
            .ensure_server_cert(
                certs_dir.path(),
                SERVER_NAME,
                EXTERNAL_ADDR.parse().unwrap(),
            )
            .expect("server cert");

        TestPki {
            alice: ca.issue_endpoint(EndpointRole::Client, "alice").unwrap(),
            mallory: ca.issue_endpoint(EndpointRole::Client, "mallory").unwrap(),
            service: ca.issue_endpoint(EndpointRole::Service, "pg-prod").unwrap(),
            stranger: ca.issue_endpoint(EndpointRole::Client, "stranger").unwrap(),
            server_cert_pem: server.cert_pem.clone(),
            server_key_pem: server.key_pem.to_string(),
            ca,
            _certs_dir: certs_dir,
        }
    })
}

impl TestPki {
    /// A TLS connector presenting the given endpoint credentials.
    pub fn connector(&self, creds: &IssuedCredentials) -> TlsConnector {
        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile_certs(creds.cert_pem.as_bytes());
        let key: PrivateKeyDer<'static> =
            rustls_pemfile::private_key(&mut creds.key_pem.as_bytes())
                .unwrap()
                .unwrap();

        let mut roots = rustls::RootCertStore::empty();
        for cert in rustls_pemfile_certs(self.ca.ca_cert_pem().as_bytes()) {
            roots.add(cert).unwrap();
        }

        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .unwrap();
        TlsConnector::from(Arc::new(config))
    }
}

fn rustls_pemfile_certs(mut pem: &[u8]) -> Vec<CertificateDer<'static>> {
    rustls_pemfile::certs(&mut pem).collect::<Result<_, _>>().unwrap()
}

/// A gateway instance: both listeners on ephemeral ports over a fresh
/// registry.
#[allow(dead_code)]
pub struct TestGateway {
    pub store: Arc<Store>,
    pub dot_addr: SocketAddr,
    pub proxy_addr: SocketAddr,
    _store_dir: tempfile::TempDir,
}

#[allow(dead_code)]
impl TestGateway {
    pub async fn spawn(upstream: SocketAddr) -> Self {
        let pki = test_pki();
        let store_dir = tempfile::tempdir().expect("store dir");
        let store = Arc::new(Store::open(store_dir.path().to_path_buf()).unwrap());

        let tls_config = tls::server_config(
            &pki.server_cert_pem,
            &pki.server_key_pem,
            pki.ca.ca_cert_pem(),
        )
        .unwrap();

        let dot = Arc::new(
            DotServer::bind(
                "127.0.0.1:0".parse().unwrap(),
                tls::acceptor(Arc::clone(&tls_config)),
                Arc::clone(&store),
                upstream,
            )
            .await
            .unwrap(),
        );
        let proxy = Arc::new(
            ProxyServer::bind(
                "127.0.0.1:0".parse().unwrap(),
                tls::acceptor(tls_config),
                Arc::clone(&store),
            )
            .await
            .unwrap(),
        );

        let dot_addr = dot.local_addr().unwrap();
        let proxy_addr = proxy.local_addr().unwrap();
        tokio::spawn(dot.run());
        tokio::spawn(proxy.run());

        Self {
            store,
            dot_addr,
            proxy_addr,
            _store_dir: store_dir,
        }
    }

    pub async fn register_client(&self, creds: &IssuedCredentials, name: &str) {
        self.store
            .insert_client(
                &creds.cn,
                Endpoint {
                    role: EndpointRole::Client,
                    name: name.to_string(),
                    platform: "linux-x64".to_string(),
                    created: Utc::now(),
                    domains: vec![],
                },
            )
            .await
            .unwrap();
    }

    pub async fn register_service(
        &self,
        creds: &IssuedCredentials,
        name: &str,
        domain: &str,
        backend: SocketAddr,
        records: BTreeMap<String, Vec<ZoneRecord>>,
    ) {
        self.store
            .insert_service(
                &creds.cn,
                Endpoint {
                    role: EndpointRole::Service,
                    name: name.to_string(),
                    platform: "linux-x64".to_string(),
                    created: Utc::now(),
                    domains: vec![domain.to_string()],
                },
                Route {
                    host: backend.ip().to_string(),
                    port: backend.port(),
                    domains: vec![domain.to_string()],
                    name: name.to_string(),
                },
                BTreeMap::from([(domain.to_string(), records)]),
            )
            .await
            .unwrap();
    }

    pub async fn authorize(&self, zone: &str, cn: &str) {
        self.store.authorize(zone, cn).await.unwrap();
    }
}

/// Records helpers.
#[allow(dead_code)]
pub fn a_record(value: &str) -> ZoneRecord {
    ZoneRecord {
        kind: RecordKind::A,
        value: value.to_string(),
    }
}

#[allow(dead_code)]
pub fn records(entries: &[(&str, ZoneRecord)]) -> BTreeMap<String, Vec<ZoneRecord>> {
    let mut map: BTreeMap<String, Vec<ZoneRecord>> = BTreeMap::new();
    for (label, record) in entries {
        map.entry(label.to_string()).or_default().push(record.clone());
    }
    map
}

/// Open an mTLS connection to a gateway listener.
#[allow(dead_code)]
pub async fn connect_mtls(
    addr: SocketAddr,
    creds: &IssuedCredentials,
) -> std::io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let connector = test_pki().connector(creds);
    let tcp = TcpStream::connect(addr).await?;
    connector
        .connect(ServerName::try_from(SERVER_NAME).unwrap(), tcp)
        .await
}

/// One framed DoT exchange over an established connection.
#[allow(dead_code)]
pub async fn dot_exchange<S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin>(
    stream: &mut S,
    query: &[u8],
) -> std::io::Result<Vec<u8>> {
    let mut framed = Vec::with_capacity(2 + query.len());
    framed.extend_from_slice(&(query.len() as u16).to_be_bytes());
    framed.extend_from_slice(query);
    stream.write_all(&framed).await?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut response = vec![0u8; len];
    stream.read_exact(&mut response).await?;
    Ok(response)
}

/// Build a simple query message.
#[allow(dead_code)]
pub fn query_message(id: u16, qname: &str, qtype: RecordType) -> Vec<u8> {
    let mut message = Message::new();
    message.set_id(id);
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(Query::query(
        Name::from_ascii(&format!("{qname}.")).unwrap(),
        qtype,
    ));
    message.to_vec().unwrap()
}

/// Issue one query on a fresh connection and parse the response.
#[allow(dead_code)]
pub async fn dot_query(
    gateway: &TestGateway,
    creds: &IssuedCredentials,
    qname: &str,
    qtype: RecordType,
) -> std::io::Result<Message> {
    let mut stream = connect_mtls(gateway.dot_addr, creds).await?;
    let response = dot_exchange(&mut stream, &query_message(0x4242, qname, qtype)).await?;
    Message::from_vec(&response).map_err(std::io::Error::other)
}

/// A stub public resolver answering every A query with a fixed address.
#[allow(dead_code)]
pub struct StubUpstream {
    pub addr: SocketAddr,
    pub queries: Arc<AtomicU64>,
}

#[allow(dead_code)]
impl StubUpstream {
    pub async fn spawn(answer: Ipv4Addr) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let queries = Arc::new(AtomicU64::new(0));
        let count = Arc::clone(&queries);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                let Ok((n, peer)) = socket.recv_from(&mut buf).await else {
                    break;
                };
                count.fetch_add(1, Ordering::Relaxed);
                let Ok(request) = Message::from_vec(&buf[..n]) else {
                    continue;
                };
                let mut response = Message::new();
                response.set_id(request.id());
                response.set_message_type(MessageType::Response);
                response.set_op_code(OpCode::Query);
                response.set_recursion_available(true);
                response.set_response_code(ResponseCode::NoError);
                for query in request.queries() {
                    response.add_query(query.clone());
                    response.add_answer(hickory_proto::rr::Record::from_rdata(
                        query.name().clone(),
                        60,
                        RData::A(rdata::A(answer)),
                    ));
                }
                if let Ok(bytes) = response.to_vec() {
                    let _ = socket.send_to(&bytes, peer).await;
                }
            }
        });

        Self { addr, queries }
    }

    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }
}

/// A TCP backend that records every received byte and echoes it back.
#[allow(dead_code)]
pub struct CaptureBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    pub received: Arc<tokio::sync::Mutex<Vec<u8>>>,
}

#[allow(dead_code)]
impl CaptureBackend {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicU64::new(0));
        let received = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        let conn_count = Arc::clone(&connections);
        let sink = Arc::clone(&received);
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                conn_count.fetch_add(1, Ordering::Relaxed);
                let sink = Arc::clone(&sink);
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                sink.lock().await.extend_from_slice(&buf[..n]);
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            connections,
            received,
        }
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

/// A minimal TLS ClientHello carrying the given SNI hostname; used to
/// exercise SNI routing without terminating the inner TLS.
#[allow(dead_code)]
pub fn client_hello_with_sni(hostname: &str) -> Vec<u8> {
    let name = hostname.as_bytes();
    let sni_ext_len = 2 + 3 + name.len();
    let extensions_len = 4 + sni_ext_len;
    let hello_len = 2 + 32 + 1 + 2 + 2 + 1 + 1 + 2 + extensions_len;
    let record_len = 4 + hello_len;

    let mut out = vec![0x16, 0x03, 0x01];
    out.extend_from_slice(&(record_len as u16).to_be_bytes());
    out.push(0x01);
    out.extend_from_slice(&[0x00, (hello_len >> 8) as u8, hello_len as u8]);
    out.extend_from_slice(&[0x03, 0x03]);
    out.extend_from_slice(&[0u8; 32]);
    out.push(0x00);
    out.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]);
    out.extend_from_slice(&[0x01, 0x00]);
    out.extend_from_slice(&(extensions_len as u16).to_be_bytes());
    out.extend_from_slice(&[0x00, 0x00]);
    out.extend_from_slice(&(sni_ext_len as u16).to_be_bytes());
    out.extend_from_slice(&((3 + name.len()) as u16).to_be_bytes());
    out.push(0x00);
    out.extend_from_slice(&(name.len() as u16).to_be_bytes());
    out.extend_from_slice(name);
    out
}
