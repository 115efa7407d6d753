//! End-to-end tests of the gateway over real mutual TLS

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use deskgate_cert::tls::{mtls_server_config, root_store_from_pem};
use deskgate_cert::{
    Certificate, Identity, IssuedCredential, LocalAuthority, USAGE_WINDOWS_DESKTOP,
};
use deskgate_directory::{HeartbeatError, ResourceRegistry};
use deskgate_ldap::{InMemoryLdap, LdapClient, LdapConfig, LdapConnector, LdapError};
use deskgate_proto::WindowsDesktop;
use deskgate_server::{
    BridgeError, ConnectionLimiter, DesktopConn, HeartbeatConfig, RdpClient, ServiceError,
    SessionConfig, WindowsService, WindowsServiceConfig,
};
use futures::{SinkExt, StreamExt};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

const DESKTOP_SNI: &str = "desktop-123.desktop.deskgate.cluster.local";
const CRL_DN: &str = "CN=test-cluster,CN=Teleport,CN=CDP,CN=Public Key Services,CN=Services,CN=Configuration,DC=corp,DC=local";

struct TestPki {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
}

impl TestPki {
    fn new() -> Self {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "proxy-ca");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_key = KeyPair::generate().unwrap();
        let ca_cert = params.self_signed(&ca_key).unwrap();
        Self { ca_cert, ca_key }
    }

    fn roots(&self) -> RootCertStore {
        root_store_from_pem(self.ca_cert.pem().as_bytes(), "test").unwrap()
    }

    fn issue(
        &self,
        names: Vec<String>,
        common_name: &str,
        restricted_to: Option<&str>,
        usage: ExtendedKeyUsagePurpose,
    ) -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
        let mut params = CertificateParams::new(names).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        if let Some(restricted_to) = restricted_to {
            dn.push(DnType::OrganizationalUnitName, restricted_to);
        }
        params.distinguished_name = dn;
        params.extended_key_usages = vec![usage];
        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key).unwrap();
        (
            cert.der().clone(),
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
        )
    }
}

/// Directory that cannot be reached
struct UnreachableLdap;

#[async_trait]
impl LdapConnector for UnreachableLdap {
    async fn connect(&self) -> Result<Box<dyn LdapClient>, LdapError> {
        Err(LdapError::Connect {
            addr: "dc.corp.local:389".to_string(),
            message: "connection refused".to_string(),
        })
    }
}

/// Sends "ready", then runs until the proxy sends "bye" or disconnects
#[derive(Default)]
struct RecordingRdp {
    sessions: Mutex<Vec<(String, IssuedCredential)>>,
}

#[async_trait]
impl RdpClient for RecordingRdp {
    async fn run_session(&self, mut session: SessionConfig) -> Result<(), BridgeError> {
        let credential = session.credentials.issue("alice").await?;
        self.sessions
            .lock()
            .unwrap()
            .push((session.addr.clone(), credential));

        session
            .output
            .send(Bytes::from_static(b"ready"))
            .await
            .map_err(|e| BridgeError::Session(e.to_string()))?;
        while let Some(message) = session.input.recv().await {
            if message.as_ref() == b"bye" {
                break;
            }
        }
        Ok(())
    }
}

struct Gateway {
    service: Arc<WindowsService>,
    addr: SocketAddr,
    pki: TestPki,
    rdp: Arc<RecordingRdp>,
    limiter: Arc<ConnectionLimiter>,
    registry: Arc<ResourceRegistry>,
    ldap: InMemoryLdap,
    serve: tokio::task::JoinHandle<()>,
}

fn service_config(
    pki: &TestPki,
    registry: Arc<ResourceRegistry>,
    limiter: Arc<ConnectionLimiter>,
    rdp: Arc<RecordingRdp>,
    ldap: Arc<dyn LdapConnector>,
    heartbeats: Arc<AtomicUsize>,
) -> WindowsServiceConfig {
    let (server_der, server_key) = pki.issue(
        vec!["*.desktop.deskgate.cluster.local".to_string()],
        "deskgate",
        None,
        ExtendedKeyUsagePurpose::ServerAuth,
    );
    let tls = mtls_server_config(Certificate::new(vec![server_der], server_key), pki.roots()).unwrap();

    let mut config = WindowsServiceConfig::new(
        LdapConfig {
            addr: "dc.corp.local:389".to_string(),
            domain: "corp.local".to_string(),
            username: "svc-deskgate".to_string(),
            password: "secret".to_string(),
            insecure_skip_verify: false,
        },
        HeartbeatConfig {
            host_uuid: "host-1".to_string(),
            public_addr: "gateway.example.com:3028".to_string(),
            static_hosts: vec![],
            announce_ttl: None,
            check_period: None,
            on_heartbeat: Some(Arc::new(move |_: Option<&HeartbeatError>| {
                heartbeats.fetch_add(1, Ordering::SeqCst);
            })),
        },
    );
    config.tls = Some(tls);
    config.access_point = Some(registry.clone());
    config.announcer = Some(registry);
    config.authority = Some(Arc::new(LocalAuthority::generate("test-cluster").unwrap()));
    config.conn_limiter = Some(limiter);
    config.rdp = Some(rdp);
    config.ldap_connector = Some(ldap);
    config.cluster_name = "test-cluster".to_string();
    config
}

fn registry_with_desktop() -> Arc<ResourceRegistry> {
    let registry = Arc::new(ResourceRegistry::default());
    let mut desktop = WindowsDesktop::new("desktop-123", "10.0.0.5:3389", "corp.local").unwrap();
    desktop.expiry = Some(Utc::now() + chrono::Duration::minutes(10));
    registry.upsert(desktop.into());
    registry
}

async fn start_gateway(max_per_ip: u32) -> Gateway {
    start_gateway_with(max_per_ip, |_| {}).await
}

async fn start_gateway_with(
    max_per_ip: u32,
    configure: impl FnOnce(&mut WindowsServiceConfig),
) -> Gateway {
    let pki = TestPki::new();
    let registry = registry_with_desktop();
    let rdp = Arc::new(RecordingRdp::default());
    let limiter = Arc::new(ConnectionLimiter::new(max_per_ip));
    let ldap = InMemoryLdap::new();

    let mut config = service_config(
        &pki,
        registry.clone(),
        limiter.clone(),
        rdp.clone(),
        Arc::new(ldap.clone()),
        Arc::new(AtomicUsize::new(0)),
    );
    configure(&mut config);

    let service = Arc::new(WindowsService::new(config).await.unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = service.clone();
    let serve = tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });

    Gateway {
        service,
        addr,
        pki,
        rdp,
        limiter,
        registry,
        ldap,
        serve,
    }
}

enum ClientCert {
    None,
    /// Restricted to Windows desktop access
    Desktop,
    /// Signed by the client CA without a usage restriction
    Unrestricted,
}

async fn connect(
    gateway: &Gateway,
    sni: &'static str,
    client_cert: ClientCert,
) -> std::io::Result<TlsStream<TcpStream>> {
    let builder =
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(gateway.pki.roots());
    let restricted_to = match client_cert {
        ClientCert::None => None,
        ClientCert::Desktop => Some(Some(USAGE_WINDOWS_DESKTOP)),
        ClientCert::Unrestricted => Some(None),
    };
    let config = match restricted_to {
        Some(restricted_to) => {
            let (der, key) = gateway.pki.issue(
                vec![],
                "proxy",
                restricted_to,
                ExtendedKeyUsagePurpose::ClientAuth,
            );
            builder.with_client_auth_cert(vec![der], key).unwrap()
        }
        None => builder.with_no_client_auth(),
    };

    let tcp = TcpStream::connect(gateway.addr).await?;
    TlsConnector::from(Arc::new(config))
        .connect(ServerName::try_from(sni).unwrap(), tcp)
        .await
}

async fn wait_for_count(limiter: &ConnectionLimiter, ip: IpAddr, expected: u32) {
    for _ in 0..100 {
        if limiter.count(ip) == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("limiter count for {} never reached {}", ip, expected);
}

#[tokio::test]
async fn test_desktop_session_end_to_end() {
    let gateway = start_gateway(5).await;
    let localhost: IpAddr = "127.0.0.1".parse().unwrap();

    // The CRL was published to the service's domain before serving
    assert!(gateway.ldap.contains(CRL_DN));

    let tls = connect(&gateway, DESKTOP_SNI, ClientCert::Desktop).await.unwrap();
    let (mut sink, mut stream) = DesktopConn::new(tls).split();

    let ready = stream.next().await.unwrap().unwrap();
    assert_eq!(ready.as_ref(), b"ready");
    assert_eq!(gateway.limiter.count(localhost), 1);

    sink.send(Bytes::from_static(b"bye")).await.unwrap();
    assert!(stream.next().await.is_none());
    wait_for_count(&gateway.limiter, localhost, 0).await;

    let sessions = gateway.rdp.sessions.lock().unwrap();
    assert_eq!(sessions.len(), 1);
    let (addr, credential) = &sessions[0];
    assert_eq!(addr, "10.0.0.5:3389");

    let lifetime = credential.expires_at - Utc::now();
    assert!(lifetime > chrono::Duration::minutes(4));
    assert!(lifetime <= chrono::Duration::minutes(5));

    let cert = CertificateDer::from(credential.cert_der.clone());
    let identity = Identity::from_peer_certificates(Some(std::slice::from_ref(&cert)), &[]).unwrap();
    assert_eq!(identity.username, "alice");
}

#[tokio::test]
async fn test_service_announces_itself() {
    let gateway = start_gateway(5).await;

    for _ in 0..100 {
        if !gateway.registry.windows_desktop_services().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let services = gateway.registry.windows_desktop_services();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].name, "host-1");
    assert!(services[0].expiry.is_some());
}

#[tokio::test]
async fn test_connection_limit_per_ip() {
    let gateway = start_gateway(1).await;
    let localhost: IpAddr = "127.0.0.1".parse().unwrap();

    let first = connect(&gateway, DESKTOP_SNI, ClientCert::Desktop).await.unwrap();
    let (mut sink, mut stream) = DesktopConn::new(first).split();
    assert_eq!(stream.next().await.unwrap().unwrap().as_ref(), b"ready");

    // The second connection is dropped before the handshake
    assert!(connect(&gateway, DESKTOP_SNI, ClientCert::Desktop).await.is_err());
    assert_eq!(gateway.limiter.count(localhost), 1);

    sink.send(Bytes::from_static(b"bye")).await.unwrap();
    assert!(stream.next().await.is_none());
    wait_for_count(&gateway.limiter, localhost, 0).await;

    assert_eq!(gateway.rdp.sessions.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_unknown_desktop_is_rejected() {
    let gateway = start_gateway(5).await;
    let localhost: IpAddr = "127.0.0.1".parse().unwrap();

    let tls = connect(&gateway, "missing.desktop.deskgate.cluster.local", ClientCert::Desktop)
        .await
        .unwrap();
    let (_sink, mut stream) = DesktopConn::new(tls).split();

    match stream.next().await {
        None | Some(Err(_)) => {}
        Some(Ok(frame)) => panic!("unexpected frame {:?}", frame),
    }
    wait_for_count(&gateway.limiter, localhost, 0).await;
    assert!(gateway.rdp.sessions.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_client_without_certificate_is_rejected() {
    let gateway = start_gateway(5).await;
    let localhost: IpAddr = "127.0.0.1".parse().unwrap();

    if let Ok(tls) = connect(&gateway, DESKTOP_SNI, ClientCert::None).await {
        let (_sink, mut stream) = DesktopConn::new(tls).split();
        match stream.next().await {
            None | Some(Err(_)) => {}
            Some(Ok(frame)) => panic!("unexpected frame {:?}", frame),
        }
    }
    wait_for_count(&gateway.limiter, localhost, 0).await;
    assert!(gateway.rdp.sessions.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_close_stops_accepting() {
    let gateway = start_gateway(5).await;

    gateway.service.close();
    assert!(gateway.service.is_closed());
    tokio::time::timeout(Duration::from_secs(5), gateway.serve)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_update_crl_replaces_entry() {
    let gateway = start_gateway(5).await;

    let outcome = gateway.service.update_crl().await.unwrap();
    assert_eq!(outcome, deskgate_ldap::PublishOutcome::Updated);
    assert!(gateway.ldap.contains(CRL_DN));
}

#[tokio::test]
async fn test_unrestricted_client_certificate_is_rejected() {
    let gateway = start_gateway(5).await;
    let localhost: IpAddr = "127.0.0.1".parse().unwrap();

    if let Ok(tls) = connect(&gateway, DESKTOP_SNI, ClientCert::Unrestricted).await {
        let (_sink, mut stream) = DesktopConn::new(tls).split();
        match stream.next().await {
            None | Some(Err(_)) => {}
            Some(Ok(frame)) => panic!("unexpected frame {:?}", frame),
        }
    }
    wait_for_count(&gateway.limiter, localhost, 0).await;
    assert!(gateway.rdp.sessions.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_stalled_handshake_releases_slot() {
    let gateway = start_gateway_with(1, |config| {
        config.handshake_timeout = Duration::from_millis(200);
    })
    .await;
    let localhost: IpAddr = "127.0.0.1".parse().unwrap();

    // Connects but never sends a ClientHello
    let stalled = TcpStream::connect(gateway.addr).await.unwrap();
    wait_for_count(&gateway.limiter, localhost, 1).await;
    wait_for_count(&gateway.limiter, localhost, 0).await;

    let tls = connect(&gateway, DESKTOP_SNI, ClientCert::Desktop).await.unwrap();
    let (mut sink, mut stream) = DesktopConn::new(tls).split();
    assert_eq!(stream.next().await.unwrap().unwrap().as_ref(), b"ready");
    sink.send(Bytes::from_static(b"bye")).await.unwrap();
    assert!(stream.next().await.is_none());

    assert_eq!(gateway.rdp.sessions.lock().unwrap().len(), 1);
    drop(stalled);
}

#[tokio::test]
async fn test_startup_fails_when_crl_cannot_be_published() {
    let pki = TestPki::new();
    let registry = registry_with_desktop();
    let heartbeats = Arc::new(AtomicUsize::new(0));
    let config = service_config(
        &pki,
        registry.clone(),
        Arc::new(ConnectionLimiter::new(5)),
        Arc::new(RecordingRdp::default()),
        Arc::new(UnreachableLdap),
        heartbeats.clone(),
    );

    let err = match WindowsService::new(config).await {
        Ok(_) => panic!("service started without publishing the CRL"),
        Err(e) => e,
    };
    assert!(matches!(err, ServiceError::Publish(_)));

    // No heartbeat was started
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(registry.windows_desktop_services().is_empty());
    assert_eq!(heartbeats.load(Ordering::SeqCst), 0);
}
