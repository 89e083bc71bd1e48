//! Mutually authenticated gRPC transport to marabunta
//!
//! [`SecureChannel`] turns verified [`AgentCredentials`] into a connected
//! [`Transport`]. A transport carries exactly one bidirectional stream:
//! [`Transport::open_stream`] consumes it.

use std::fmt;
use std::time::Duration;

use ant_proto::marabunta_client::MarabuntaClient;
use ant_proto::{StreamRequest, StreamResponse};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::service::interceptor::InterceptedService;
use tonic::service::Interceptor;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tonic::{Request, Status, Streaming};
use tracing::{debug, info};

use crate::enroll::client_tag;
use crate::mtls::{self, AgentCredentials, MtlsError};

/// Default handshake deadline
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Metadata key carrying the agent identity on every RPC
pub const IDENTITY_METADATA_KEY: &str = "ant";

/// Outbound stream buffer
const OUTBOUND_BUFFER: usize = 32;

/// Address marabunta's gRPC endpoint is dialed at
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
}

impl ConnectTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    fn uri(&self) -> String {
        format!("https://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Why a connection attempt failed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectReason {
    /// The handshake did not complete before the deadline
    Timeout,
    /// The server certificate does not chain to the trust anchor
    UntrustedRoot,
    /// A certificate was expired, malformed, or refused by the peer
    InvalidCertificate,
    /// The server certificate is not valid for the expected server name
    HostnameMismatch,
    /// Nothing answered at the target address
    Unreachable,
    /// Anything else
    Other,
}

impl ConnectReason {
    /// Trust failures need operator action; transport failures may clear up
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ConnectReason::Timeout | ConnectReason::Unreachable | ConnectReason::Other
        )
    }
}

impl fmt::Display for ConnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            ConnectReason::Timeout => "timeout",
            ConnectReason::UntrustedRoot => "untrusted root",
            ConnectReason::InvalidCertificate => "invalid certificate",
            ConnectReason::HostnameMismatch => "hostname mismatch",
            ConnectReason::Unreachable => "unreachable",
            ConnectReason::Other => "transport error",
        };
        f.write_str(reason)
    }
}

/// Channel errors
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Credentials failed local verification; no connection was attempted
    #[error(transparent)]
    InvalidCredentials(#[from] MtlsError),

    /// The identity can't be carried in request metadata
    #[error("agent identity {identity:?} is not valid request metadata")]
    InvalidIdentity { identity: String },

    /// Dialing or the TLS handshake failed
    #[error("failed to connect to marabunta at {target} ({reason}): {detail}")]
    Connect {
        target: ConnectTarget,
        reason: ConnectReason,
        detail: String,
    },

    /// The stream call was refused
    #[error("failed to open stream to {target}: {status}")]
    Stream { target: ConnectTarget, status: Status },
}

impl ChannelError {
    /// Whether reconnecting later may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            ChannelError::Connect { reason, .. } => reason.is_retryable(),
            ChannelError::Stream { .. } => true,
            ChannelError::InvalidCredentials(_) | ChannelError::InvalidIdentity { .. } => false,
        }
    }

    /// Connect failure reason, if this is a connect failure
    pub fn reason(&self) -> Option<ConnectReason> {
        match self {
            ChannelError::Connect { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

/// Tags every request with the agent identity
#[derive(Clone, Debug)]
pub struct ClientTag {
    identity: MetadataValue<Ascii>,
}

impl Interceptor for ClientTag {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        request
            .metadata_mut()
            .insert(IDENTITY_METADATA_KEY, self.identity.clone());
        Ok(request)
    }
}

/// Marabunta client with the identity interceptor applied
pub type MarabuntaChannel = MarabuntaClient<InterceptedService<Channel, ClientTag>>;

/// Builds authenticated transports for one agent
#[derive(Clone, Debug)]
pub struct SecureChannel {
    identity: String,
    server_name: String,
    tls: ClientTlsConfig,
}

impl SecureChannel {
    /// Verify `credentials` for `identity` and prepare a TLS config that
    /// expects the server to present `server_name`.
    pub fn new(
        identity: impl Into<String>,
        credentials: &AgentCredentials,
        server_name: impl Into<String>,
    ) -> Result<Self, ChannelError> {
        let identity = identity.into();
        let server_name = server_name.into();
        credentials.verify(&identity)?;
        let tls = mtls::build_tls_config(credentials, &server_name);
        Ok(Self {
            identity,
            server_name,
            tls,
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Dial `target` and complete the mTLS handshake within `timeout`.
    pub async fn connect(
        &self,
        target: &ConnectTarget,
        timeout: Duration,
    ) -> Result<Transport, ChannelError> {
        let tag = MetadataValue::try_from(self.identity.as_str()).map_err(|_| {
            ChannelError::InvalidIdentity {
                identity: self.identity.clone(),
            }
        })?;

        let connect_error = |reason: ConnectReason, detail: String| ChannelError::Connect {
            target: target.clone(),
            reason,
            detail,
        };

        let endpoint = Endpoint::from_shared(target.uri())
            .map_err(|e| connect_error(ConnectReason::Other, e.to_string()))?
            .connect_timeout(timeout)
            .user_agent(client_tag(&self.identity))
            .map_err(|e| connect_error(ConnectReason::Other, e.to_string()))?
            .tls_config(self.tls.clone())
            .map_err(|e| connect_error(ConnectReason::Other, e.to_string()))?;

        debug!(endpoint = %target, server_name = %self.server_name, "Connecting to marabunta");
        let channel = match tokio::time::timeout(timeout, endpoint.connect()).await {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => {
                let (reason, detail) = classify(&e);
                return Err(connect_error(reason, detail));
            }
            Err(_) => {
                return Err(connect_error(
                    ConnectReason::Timeout,
                    format!("no handshake after {:?}", timeout),
                ))
            }
        };

        info!(endpoint = %target, "Connected to marabunta");
        Ok(Transport {
            target: target.clone(),
            client: MarabuntaClient::with_interceptor(channel, ClientTag { identity: tag }),
        })
    }
}

/// A connected, authenticated transport
#[derive(Debug)]
pub struct Transport {
    target: ConnectTarget,
    client: MarabuntaChannel,
}

impl Transport {
    /// Client for unary calls over this transport
    pub fn client(&self) -> MarabuntaChannel {
        self.client.clone()
    }

    /// Open the single bidirectional stream of this transport.
    pub async fn open_stream(self) -> Result<StreamSession, ChannelError> {
        let (outbound, rx) = mpsc::channel::<StreamRequest>(OUTBOUND_BUFFER);
        let mut client = self.client.clone();

        let inbound = client
            .stream(ReceiverStream::new(rx))
            .await
            .map_err(|status| ChannelError::Stream {
                target: self.target.clone(),
                status,
            })?
            .into_inner();

        debug!(endpoint = %self.target, "Stream opened");
        Ok(StreamSession {
            outbound,
            inbound,
            client: self.client,
        })
    }
}

/// The open stream plus a client for unary calls on the same connection.
///
/// Dropping the session closes the stream.
pub struct StreamSession {
    pub outbound: mpsc::Sender<StreamRequest>,
    pub inbound: Streaming<StreamResponse>,
    pub client: MarabuntaChannel,
}

/// Map a transport error to a reason code and a readable cause chain
fn classify(error: &(dyn std::error::Error + 'static)) -> (ConnectReason, String) {
    let chain: Vec<&(dyn std::error::Error + 'static)> =
        std::iter::successors(Some(error), |e| e.source()).collect();

    let detail = chain
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(": ");

    for err in &chain {
        if let Some(tls) = err.downcast_ref::<rustls::Error>() {
            return (classify_tls(tls), detail);
        }
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if let Some(tls) = io.get_ref().and_then(|e| e.downcast_ref::<rustls::Error>()) {
                return (classify_tls(tls), detail);
            }
            if let Some(reason) = classify_io(io.kind()) {
                return (reason, detail);
            }
        }
    }

    let debug = chain
        .iter()
        .map(|e| format!("{:?}", e))
        .collect::<String>()
        .to_lowercase();
    (classify_text(&debug), detail)
}

fn classify_tls(error: &rustls::Error) -> ConnectReason {
    match error {
        rustls::Error::InvalidCertificate(cert) => {
            classify_text(&format!("{:?}", cert).to_lowercase())
        }
        rustls::Error::AlertReceived(_) => ConnectReason::InvalidCertificate,
        _ => ConnectReason::Other,
    }
}

fn classify_io(kind: std::io::ErrorKind) -> Option<ConnectReason> {
    use std::io::ErrorKind;
    match kind {
        ErrorKind::TimedOut => Some(ConnectReason::Timeout),
        ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset | ErrorKind::AddrNotAvailable => {
            Some(ConnectReason::Unreachable)
        }
        _ => None,
    }
}

fn classify_text(text: &str) -> ConnectReason {
    if text.contains("notvalidforname") {
        ConnectReason::HostnameMismatch
    } else if text.contains("unknownissuer") || text.contains("badsignature") {
        ConnectReason::UntrustedRoot
    } else if text.contains("expired")
        || text.contains("notvalidyet")
        || text.contains("invalidcertificate")
        || text.contains("alertreceived")
        || text.contains("badencoding")
    {
        ConnectReason::InvalidCertificate
    } else if text.contains("timed out") || text.contains("timedout") || text.contains("elapsed") {
        ConnectReason::Timeout
    } else if text.contains("connectionrefused")
        || text.contains("connection refused")
        || text.contains("unreachable")
        || text.contains("dns error")
        || text.contains("failed to lookup")
    {
        ConnectReason::Unreachable
    } else {
        ConnectReason::Other
    }
}
