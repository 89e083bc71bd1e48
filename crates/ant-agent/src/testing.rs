//! Test fixtures: an in-memory marabunta CA and a fake controller.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use ant_proto::marabunta_server::{Marabunta, MarabuntaServer};
use ant_proto::{StreamRequest, StreamResponse, UpdateRequest, UpdateResponse};
use futures::{Stream, StreamExt};
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, DnValue, IsCa, Issuer, KeyPair, KeyUsagePurpose,
};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tonic::{Request, Response, Status, Streaming};

use crate::pki;

/// Self-signed CA standing in for marabunta's signing authority
pub(crate) struct TestCa {
    cert_pem: String,
    key_pem: String,
}

impl TestCa {
    pub(crate) fn new(common_name: &str) -> Self {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let key_pair = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();

        Self {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        }
    }

    pub(crate) fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Sign a CSR, keeping the subject the ant asked for
    pub(crate) fn sign_csr(&self, csr_pem: &str) -> String {
        let csr = CertificateSigningRequestParams::from_pem(csr_pem).unwrap();
        let ca_key = KeyPair::from_pem(&self.key_pem).unwrap();
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &ca_key).unwrap();
        csr.signed_by(&issuer).unwrap().pem()
    }

    /// Sign a CSR with a validity window that ended years ago
    pub(crate) fn sign_csr_expired(&self, csr_pem: &str) -> String {
        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem).unwrap();
        csr.params.not_before = rcgen::date_time_ymd(2000, 1, 1);
        csr.params.not_after = rcgen::date_time_ymd(2001, 1, 1);
        let ca_key = KeyPair::from_pem(&self.key_pem).unwrap();
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &ca_key).unwrap();
        csr.signed_by(&issuer).unwrap().pem()
    }

    /// Issue a client certificate for `identity`, returning (cert, key) PEM
    pub(crate) fn issue_client(&self, identity: &str) -> (String, String) {
        let key_pair = pki::generate_key_pair().unwrap();
        let request = pki::build_csr(identity, &key_pair).unwrap();
        (
            self.sign_csr(request.csr_pem()),
            request.private_key_pem().to_string(),
        )
    }

    /// Issue a server certificate for the given DNS names, returning (cert, key) PEM
    pub(crate) fn issue_server(&self, sans: &[&str]) -> (String, String) {
        let params =
            CertificateParams::new(sans.iter().map(|s| s.to_string()).collect::<Vec<_>>())
                .unwrap();
        let server_key = KeyPair::generate().unwrap();
        let ca_key = KeyPair::from_pem(&self.key_pem).unwrap();
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &ca_key).unwrap();
        let cert = params.signed_by(&server_key, &issuer).unwrap();
        (cert.pem(), server_key.serialize_pem())
    }
}

/// Everything the fake controller observed
#[derive(Default)]
pub(crate) struct Observed {
    pub(crate) stream_messages: Vec<String>,
    pub(crate) updates: Vec<String>,
    pub(crate) ant_metadata: Vec<String>,
    pub(crate) user_agents: Vec<String>,
}

/// Minimal marabunta: replays `events` on every stream, then either ends
/// the stream or holds it open.
#[derive(Clone)]
pub(crate) struct FakeMarabunta {
    events: Vec<StreamResponse>,
    hold_open: bool,
    observed: Arc<Mutex<Observed>>,
}

impl FakeMarabunta {
    pub(crate) fn new(events: Vec<StreamResponse>, hold_open: bool) -> Self {
        Self {
            events,
            hold_open,
            observed: Arc::new(Mutex::new(Observed::default())),
        }
    }

    pub(crate) fn observed(&self) -> Arc<Mutex<Observed>> {
        self.observed.clone()
    }

    fn record_headers<T>(&self, request: &Request<T>) {
        let mut observed = self.observed.lock().unwrap();
        if let Some(tag) = request.metadata().get("ant").and_then(|v| v.to_str().ok()) {
            observed.ant_metadata.push(tag.to_string());
        }
        if let Some(ua) = request
            .metadata()
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
        {
            observed.user_agents.push(ua.to_string());
        }
    }
}

type EventStream = Pin<Box<dyn Stream<Item = Result<StreamResponse, Status>> + Send>>;

#[tonic::async_trait]
impl Marabunta for FakeMarabunta {
    type StreamStream = EventStream;

    async fn stream(
        &self,
        request: Request<Streaming<StreamRequest>>,
    ) -> Result<Response<Self::StreamStream>, Status> {
        self.record_headers(&request);

        let mut inbound = request.into_inner();
        let observed = self.observed.clone();
        tokio::spawn(async move {
            while let Some(Ok(msg)) = inbound.next().await {
                observed.lock().unwrap().stream_messages.push(msg.msg);
            }
        });

        let events = futures::stream::iter(self.events.clone().into_iter().map(Ok));
        let stream: EventStream = if self.hold_open {
            Box::pin(events.chain(futures::stream::pending()))
        } else {
            Box::pin(events)
        };
        Ok(Response::new(stream))
    }

    async fn update(
        &self,
        request: Request<UpdateRequest>,
    ) -> Result<Response<UpdateResponse>, Status> {
        self.record_headers(&request);
        let name = request.into_inner().name;
        self.observed.lock().unwrap().updates.push(name);
        Ok(Response::new(UpdateResponse { ok: true }))
    }
}

/// Serve `fake` over mutual TLS on an ephemeral localhost port.
///
/// The server presents a certificate for `server_name` issued by `ca` and
/// requires client certificates issued by the same CA.
pub(crate) async fn serve_mtls(
    fake: FakeMarabunta,
    ca: &TestCa,
    server_name: &str,
) -> (SocketAddr, JoinHandle<()>) {
    let (cert, key) = ca.issue_server(&[server_name]);
    let tls = ServerTlsConfig::new()
        .identity(Identity::from_pem(cert, key))
        .client_ca_root(Certificate::from_pem(ca.cert_pem()));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let _ = Server::builder()
            .tls_config(tls)
            .unwrap()
            .add_service(MarabuntaServer::new(fake))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await;
    });

    // Give server time to start
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    (addr, handle)
}
