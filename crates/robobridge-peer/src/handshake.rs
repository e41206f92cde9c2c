use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use robobridge_frame::{BridgeCodec, FrameError, FrameKind, CONTROL_STREAM};
use robobridge_message::Category;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::debug;

use crate::control::{ControlMessage, CONTROL_REJECT};
use crate::error::{PeerError, Result};

const MAX_HANDSHAKE_CATEGORIES: usize = 16;
const MAX_PROTOCOL_LEN: usize = 32;
const MAX_VERSION_LEN: usize = 16;
const MAX_CONNECTION_ID_LEN: usize = 128;
const MAX_AUTH_TOKEN_LEN: usize = 4096;

/// Largest window either side may offer.
pub const MAX_WINDOW: u32 = 4096;
/// Window offered when none is configured.
pub const DEFAULT_WINDOW: u32 = 32;

/// Client handshake request sent on the CONTROL stream.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Protocol name. Must be `robobridge` by default.
    pub protocol: String,
    /// Protocol version string.
    pub version: String,
    /// Categories the client wants to stream.
    pub categories: Vec<Category>,
    /// Unacknowledged payloads the client wants in flight per stream.
    pub window: u32,
    /// Optional authentication token provided by the client.
    /// Treated as opaque credential material and redacted in debug output.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

/// Server handshake response sent on the CONTROL stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// Protocol name. Must match request protocol.
    pub protocol: String,
    /// Negotiated protocol version.
    pub version: String,
    /// Negotiated categories, in the client's order.
    pub categories: Vec<Category>,
    /// Opaque server-assigned connection identifier.
    pub connection_id: String,
    /// Negotiated per-stream window.
    pub window: u32,
}

/// Result of a successful handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct HandshakeResult {
    /// Server-assigned connection identifier.
    pub connection_id: String,
    /// Negotiated protocol version.
    pub protocol_version: String,
    /// Categories both sides agreed to stream.
    pub negotiated_categories: Vec<Category>,
    /// Negotiated per-stream window.
    pub window: u32,
    /// Client auth token observed by the server side.
    pub client_auth_token: Option<String>,
}

/// Configuration for handshake negotiation.
#[derive(Clone)]
pub struct HandshakeConfig {
    /// Timeout for receiving the peer's handshake message.
    pub timeout: Duration,
    /// Expected protocol name.
    pub protocol_name: String,
    /// Local protocol version.
    pub protocol_version: String,
    /// Require at least one negotiated category.
    pub require_category_overlap: bool,
    /// Maximum handshake frame payload size in bytes.
    pub max_handshake_payload: usize,
    /// Window offered by this side.
    pub window: u32,
    /// Optional auth token sent by the client.
    /// Sent in the clear unless the transport is TLS; never logged.
    pub auth_token: Option<String>,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            protocol_name: "robobridge".to_string(),
            protocol_version: "1.0".to_string(),
            require_category_overlap: true,
            max_handshake_payload: 16 * 1024,
            window: DEFAULT_WINDOW,
            auth_token: None,
        }
    }
}

struct Redacted<'a>(&'a Option<String>);

impl fmt::Debug for Redacted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(token) => write!(f, "<redacted:{} bytes>", token.len()),
            None => f.write_str("None"),
        }
    }
}

impl fmt::Debug for HandshakeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeRequest")
            .field("protocol", &self.protocol)
            .field("version", &self.version)
            .field("categories", &self.categories)
            .field("window", &self.window)
            .field("auth_token", &Redacted(&self.auth_token))
            .finish()
    }
}

impl fmt::Debug for HandshakeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeResult")
            .field("connection_id", &self.connection_id)
            .field("protocol_version", &self.protocol_version)
            .field("negotiated_categories", &self.negotiated_categories)
            .field("window", &self.window)
            .field("client_auth_token", &Redacted(&self.client_auth_token))
            .finish()
    }
}

impl fmt::Debug for HandshakeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeConfig")
            .field("timeout", &self.timeout)
            .field("protocol_name", &self.protocol_name)
            .field("protocol_version", &self.protocol_version)
            .field("require_category_overlap", &self.require_category_overlap)
            .field("max_handshake_payload", &self.max_handshake_payload)
            .field("window", &self.window)
            .field("auth_token", &Redacted(&self.auth_token))
            .finish()
    }
}

/// Perform the client side of the handshake.
///
/// A server that refuses the connection answers with a `reject` control
/// message instead of a response; that surfaces as [`PeerError::Rejected`].
pub async fn handshake_client<T>(
    framed: &mut Framed<T, BridgeCodec>,
    requested_categories: &[Category],
    config: &HandshakeConfig,
) -> Result<HandshakeResult>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    validate_protocol_name(&config.protocol_name)?;
    validate_version(&config.protocol_version)?;
    validate_window(config.window)?;
    validate_auth_token(config.auth_token.as_deref())?;

    let requested = normalize_categories(requested_categories)?;

    let req = HandshakeRequest {
        protocol: config.protocol_name.clone(),
        version: config.protocol_version.clone(),
        categories: requested.clone(),
        window: config.window,
        auth_token: config.auth_token.clone(),
    };

    send_control_json(framed, &req).await?;

    let payload = recv_control_payload(framed, config).await?;
    let value: serde_json::Value = serde_json::from_slice(&payload)?;
    if value.get("type").is_some() {
        let control: ControlMessage = serde_json::from_value(value)?;
        if control.msg_type == CONTROL_REJECT {
            return Err(PeerError::Rejected(
                control.reason().unwrap_or("no reason given").to_string(),
            ));
        }
        return Err(PeerError::HandshakeFailed(format!(
            "unexpected control message '{}' during handshake",
            control.msg_type
        )));
    }
    let resp: HandshakeResponse = serde_json::from_value(value)?;

    validate_protocol_name(&resp.protocol)?;
    validate_version(&resp.version)?;
    validate_connection_id(&resp.connection_id)?;

    if resp.protocol != config.protocol_name {
        return Err(PeerError::HandshakeFailed(format!(
            "unknown protocol '{}' (expected '{}')",
            resp.protocol, config.protocol_name
        )));
    }

    if !is_version_compatible(&config.protocol_version, &resp.version)? {
        return Err(PeerError::HandshakeFailed(format!(
            "incompatible version '{}' (local '{}')",
            resp.version, config.protocol_version
        )));
    }

    if resp.window == 0 || resp.window > config.window {
        return Err(PeerError::HandshakeFailed(format!(
            "server returned window {} (offered {})",
            resp.window, config.window
        )));
    }

    let negotiated = normalize_categories(&resp.categories)?;
    let requested_set: HashSet<Category> = requested.iter().copied().collect();
    if negotiated
        .iter()
        .any(|category| !requested_set.contains(category))
    {
        return Err(PeerError::HandshakeFailed(
            "server returned categories not requested by client".to_string(),
        ));
    }

    if config.require_category_overlap && negotiated.is_empty() {
        return Err(PeerError::HandshakeFailed(
            "no overlapping categories".to_string(),
        ));
    }

    debug!(
        connection_id = %resp.connection_id,
        categories = ?negotiated,
        window = resp.window,
        "client handshake complete"
    );

    Ok(HandshakeResult {
        connection_id: resp.connection_id,
        protocol_version: resp.version,
        negotiated_categories: negotiated,
        window: resp.window,
        client_auth_token: None,
    })
}

/// Perform the server side of the handshake.
///
/// When the request is unacceptable the client is told why with a `reject`
/// control message before the error is returned.
pub async fn handshake_server<T>(
    framed: &mut Framed<T, BridgeCodec>,
    supported_categories: &[Category],
    connection_id: &str,
    config: &HandshakeConfig,
) -> Result<HandshakeResult>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    validate_protocol_name(&config.protocol_name)?;
    validate_version(&config.protocol_version)?;
    validate_window(config.window)?;
    validate_connection_id(connection_id)?;

    let supported = normalize_categories(supported_categories)?;

    let negotiated = match recv_control_payload(framed, config).await {
        Ok(payload) => negotiate(&payload, &supported, connection_id, config),
        // Oversized or misrouted requests are still answered with a rejection.
        Err(err @ PeerError::HandshakeFailed(_)) => Err(err),
        Err(err) => return Err(err),
    };

    match negotiated {
        Ok((resp, result)) => {
            send_control_json(framed, &resp).await?;
            debug!(
                connection_id,
                categories = ?result.negotiated_categories,
                window = result.window,
                "server handshake complete"
            );
            Ok(result)
        }
        Err(err) => {
            let reject = ControlMessage::reject(&err.to_string());
            if let Err(send_err) = send_control_json(framed, &reject).await {
                debug!(connection_id, error = %send_err, "could not deliver handshake rejection");
            }
            Err(err)
        }
    }
}

fn negotiate(
    payload: &[u8],
    supported: &[Category],
    connection_id: &str,
    config: &HandshakeConfig,
) -> Result<(HandshakeResponse, HandshakeResult)> {
    let req: HandshakeRequest = serde_json::from_slice(payload)?;

    validate_protocol_name(&req.protocol)?;
    validate_version(&req.version)?;
    validate_window(req.window)?;
    validate_auth_token(req.auth_token.as_deref())?;

    if req.protocol != config.protocol_name {
        return Err(PeerError::HandshakeFailed(format!(
            "unknown protocol '{}' (expected '{}')",
            req.protocol, config.protocol_name
        )));
    }

    if !is_version_compatible(&req.version, &config.protocol_version)? {
        return Err(PeerError::HandshakeFailed(format!(
            "incompatible version '{}' (server '{}')",
            req.version, config.protocol_version
        )));
    }

    let requested = normalize_categories(&req.categories)?;
    let negotiated = intersect_categories(&requested, supported);

    if config.require_category_overlap && negotiated.is_empty() {
        return Err(PeerError::HandshakeFailed(
            "no overlapping categories".to_string(),
        ));
    }

    let window = req.window.min(config.window);
    let resp = HandshakeResponse {
        protocol: config.protocol_name.clone(),
        version: config.protocol_version.clone(),
        categories: negotiated.clone(),
        connection_id: connection_id.to_string(),
        window,
    };
    let result = HandshakeResult {
        connection_id: connection_id.to_string(),
        protocol_version: config.protocol_version.clone(),
        negotiated_categories: negotiated,
        window,
        client_auth_token: req.auth_token,
    };
    Ok((resp, result))
}

/// Write a control message outside of an established connection.
pub(crate) async fn send_control_json<T, V>(framed: &mut Framed<T, BridgeCodec>, value: &V) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
    V: Serialize,
{
    let payload = serde_json::to_vec(value)?;
    framed
        .send(robobridge_frame::Frame::new(
            CONTROL_STREAM,
            FrameKind::Control,
            payload,
        ))
        .await?;
    Ok(())
}

async fn recv_control_payload<T>(
    framed: &mut Framed<T, BridgeCodec>,
    config: &HandshakeConfig,
) -> Result<bytes::Bytes>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let next = tokio::time::timeout(config.timeout, framed.next())
        .await
        .map_err(|_| PeerError::Timeout(config.timeout))?;

    match next {
        Some(Ok(frame)) => {
            if frame.stream != CONTROL_STREAM || frame.kind != FrameKind::Control {
                return Err(PeerError::HandshakeFailed(format!(
                    "expected CONTROL frame on stream {}, got {} on stream {}",
                    CONTROL_STREAM,
                    frame.kind.as_str(),
                    frame.stream
                )));
            }
            if frame.payload.len() > config.max_handshake_payload {
                return Err(PeerError::HandshakeFailed(format!(
                    "handshake payload too large: {} (max {})",
                    frame.payload.len(),
                    config.max_handshake_payload
                )));
            }
            Ok(frame.payload)
        }
        Some(Err(FrameError::PayloadTooLarge { size, max })) => Err(PeerError::HandshakeFailed(
            format!("handshake payload too large: {size} (max {max})"),
        )),
        Some(Err(FrameError::ConnectionClosed)) | None => Err(PeerError::Disconnected(
            "connection closed during handshake".to_string(),
        )),
        Some(Err(err)) => Err(PeerError::Frame(err)),
    }
}

fn normalize_categories(categories: &[Category]) -> Result<Vec<Category>> {
    if categories.len() > MAX_HANDSHAKE_CATEGORIES {
        return Err(PeerError::HandshakeFailed(format!(
            "too many categories in handshake: {} (max {})",
            categories.len(),
            MAX_HANDSHAKE_CATEGORIES
        )));
    }

    let mut seen = HashSet::with_capacity(categories.len());
    Ok(categories
        .iter()
        .copied()
        .filter(|category| seen.insert(*category))
        .collect())
}

fn intersect_categories(left: &[Category], right: &[Category]) -> Vec<Category> {
    let right_set: HashSet<Category> = right.iter().copied().collect();
    left.iter()
        .copied()
        .filter(|category| right_set.contains(category))
        .collect()
}

fn validate_protocol_name(protocol: &str) -> Result<()> {
    if protocol.is_empty() || protocol.len() > MAX_PROTOCOL_LEN {
        return Err(PeerError::HandshakeFailed(format!(
            "invalid protocol name length: {}",
            protocol.len()
        )));
    }
    Ok(())
}

fn validate_version(version: &str) -> Result<()> {
    if version.is_empty() || version.len() > MAX_VERSION_LEN {
        return Err(PeerError::HandshakeFailed(format!(
            "invalid protocol version length: {}",
            version.len()
        )));
    }
    let _ = parse_version(version)?;
    Ok(())
}

fn validate_window(window: u32) -> Result<()> {
    if window == 0 || window > MAX_WINDOW {
        return Err(PeerError::HandshakeFailed(format!(
            "invalid window {window} (expected 1..={MAX_WINDOW})"
        )));
    }
    Ok(())
}

fn validate_connection_id(connection_id: &str) -> Result<()> {
    if connection_id.is_empty() || connection_id.len() > MAX_CONNECTION_ID_LEN {
        return Err(PeerError::HandshakeFailed(format!(
            "invalid connection_id length: {}",
            connection_id.len()
        )));
    }
    Ok(())
}

fn validate_auth_token(auth_token: Option<&str>) -> Result<()> {
    if let Some(token) = auth_token {
        if token.is_empty() || token.len() > MAX_AUTH_TOKEN_LEN {
            return Err(PeerError::HandshakeFailed(format!(
                "invalid auth_token length: {}",
                token.len()
            )));
        }
    }
    Ok(())
}

fn is_version_compatible(client_version: &str, server_version: &str) -> Result<bool> {
    let (client_major, client_minor) = parse_version(client_version)?;
    let (server_major, server_minor) = parse_version(server_version)?;

    Ok(client_major == server_major && client_minor >= server_minor)
}

fn parse_version(version: &str) -> Result<(u16, u16)> {
    let mut parts = version.split('.');

    let major = parts.next().ok_or_else(|| {
        PeerError::HandshakeFailed(format!("invalid version '{}': missing major", version))
    })?;
    let minor = parts.next().ok_or_else(|| {
        PeerError::HandshakeFailed(format!("invalid version '{}': missing minor", version))
    })?;

    if parts.next().is_some() {
        return Err(PeerError::HandshakeFailed(format!(
            "invalid version '{}': expected '<major>.<minor>'",
            version
        )));
    }

    let major = major.parse::<u16>().map_err(|_| {
        PeerError::HandshakeFailed(format!("invalid version '{}': non-numeric major", version))
    })?;
    let minor = minor.parse::<u16>().map_err(|_| {
        PeerError::HandshakeFailed(format!("invalid version '{}': non-numeric minor", version))
    })?;

    Ok((major, minor))
}
