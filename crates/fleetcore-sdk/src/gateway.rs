//! Upstream gateway client (`spec.md` §6): a challenge/nonce handshake
//! authenticated with a locally persisted ed25519 signing key. A failed
//! handshake is boot-fatal — the caller is expected to exit non-zero.
//!
//! The source describes this as a long-lived duplex connection; there is
//! no websocket crate anywhere in this workspace's dependency set or
//! across the example repos it was grounded on, so the wire reuses the
//! same `tokio_util::codec::LinesCodec`-over-TCP framing as the control
//! surface (logged as a substitution in `DESIGN.md`).

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};

use crate::error::SdkError;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Loads the 32-byte seed at `path`, or generates and persists a fresh one
/// with `0600` permissions (`spec.md` §6 "local key persistence").
pub fn load_or_create_signing_key(path: &Path) -> Result<SigningKey, SdkError> {
    if let Ok(raw) = fs::read(path) {
        if raw.len() == 32 {
            let mut seed = [0u8; 32];
            seed.copy_from_slice(&raw);
            return Ok(SigningKey::from_bytes(&seed));
        }
    }
    let key = SigningKey::generate(&mut rand::rngs::OsRng);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, key.to_bytes())?;
    set_owner_only(path)?;
    Ok(key)
}

#[cfg(unix)]
fn set_owner_only(path: &Path) -> Result<(), SdkError> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_owner_only(_path: &Path) -> Result<(), SdkError> {
    Ok(())
}

/// What `spec.md` §6 calls the device's identity claim: device, client,
/// mode, role, and the scopes it is asking for, timestamped and bound to
/// the server's nonce so a captured signature can't be replayed against a
/// later challenge.
#[derive(Debug, Clone, Serialize)]
struct GatewayClaim<'a> {
    device_id: &'a str,
    client_id: &'a str,
    mode: &'a str,
    role: &'a str,
    scopes: &'a [String],
    signed_at: String,
    nonce: &'a str,
}

#[derive(Debug, Clone)]
pub struct GatewayIdentity {
    pub device_id: String,
    pub client_id: String,
    pub mode: String,
    pub role: String,
    pub scopes: Vec<String>,
}

/// A live, authenticated connection to the upstream gateway. `outbound`
/// forwards locally originated events upstream; inbound frames are routed
/// into the broker by a background task.
pub struct GatewayHandle {
    pub outbound: mpsc::UnboundedSender<Value>,
    _reader: tokio::task::JoinHandle<()>,
    _writer: tokio::task::JoinHandle<()>,
}

/// Connects to `addr`, completes the challenge/nonce handshake, and
/// returns a handle for forwarding events once authenticated. Any failure
/// up to and including an `auth.error` response is reported as
/// `SdkError::GatewayHandshakeFailed` (`spec.md` §6 exit convention: fatal
/// at boot).
pub async fn connect(
    addr: &str,
    identity: &GatewayIdentity,
    key_path: &Path,
    broker: Arc<fleetcore_broker::Broker>,
) -> Result<GatewayHandle, SdkError> {
    let stream = TcpStream::connect(addr).await?;
    let framed = Framed::new(stream, LinesCodec::new());
    let (mut sink, mut lines) = framed.split();

    let challenge = tokio::time::timeout(HANDSHAKE_TIMEOUT, lines.next())
        .await
        .map_err(|_| SdkError::GatewayHandshakeFailed("no challenge received".to_string()))?
        .ok_or_else(|| SdkError::GatewayHandshakeFailed("connection closed before challenge".to_string()))?
        .map_err(|e| SdkError::GatewayHandshakeFailed(e.to_string()))?;
    let challenge: Value = serde_json::from_str(&challenge)
        .map_err(|e| SdkError::GatewayHandshakeFailed(format!("malformed challenge: {e}")))?;
    let nonce = challenge
        .get("nonce")
        .and_then(Value::as_str)
        .ok_or_else(|| SdkError::GatewayHandshakeFailed("challenge had no nonce".to_string()))?;

    let signing_key = load_or_create_signing_key(key_path)?;
    let verifying_key: VerifyingKey = signing_key.verifying_key();
    let claim = GatewayClaim {
        device_id: &identity.device_id,
        client_id: &identity.client_id,
        mode: &identity.mode,
        role: &identity.role,
        scopes: &identity.scopes,
        signed_at: Utc::now().to_rfc3339(),
        nonce,
    };
    let canonical = serde_json::to_vec(&claim)?;
    let signature = signing_key.sign(&canonical);

    sink.send(
        json!({
            "type": "auth",
            "claim": claim,
            "signature": signature.to_bytes().to_vec(),
            "publicKey": verifying_key.to_bytes().to_vec(),
        })
        .to_string(),
    )
    .await
    .map_err(|e| SdkError::GatewayHandshakeFailed(e.to_string()))?;

    let response = tokio::time::timeout(HANDSHAKE_TIMEOUT, lines.next())
        .await
        .map_err(|_| SdkError::GatewayHandshakeFailed("no auth response received".to_string()))?
        .ok_or_else(|| SdkError::GatewayHandshakeFailed("connection closed before auth response".to_string()))?
        .map_err(|e| SdkError::GatewayHandshakeFailed(e.to_string()))?;
    let response: Value =
        serde_json::from_str(&response).map_err(|e| SdkError::GatewayHandshakeFailed(format!("malformed auth response: {e}")))?;
    if response.get("type").and_then(Value::as_str) != Some("auth.ok") {
        let reason = response.get("reason").and_then(Value::as_str).unwrap_or("rejected").to_string();
        return Err(SdkError::GatewayHandshakeFailed(reason));
    }

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Value>();
    let writer = tokio::spawn(async move {
        while let Some(value) = outbound_rx.recv().await {
            if sink.send(value.to_string()).await.is_err() {
                break;
            }
        }
    });

    let device_id = identity.device_id.clone();
    let from_id = fleetcore_types::ids::AgentId::new(&format!("system/gateway/{device_id}"))
        .unwrap_or_else(|_| fleetcore_types::ids::AgentId::new("system/gateway").expect("static id is valid"));
    let reader = tokio::spawn(async move {
        while let Some(Ok(raw)) = lines.next().await {
            let Ok(frame) = serde_json::from_str::<Value>(&raw) else { continue };
            if frame.get("type").and_then(Value::as_str) == Some("ping") {
                continue;
            }
            let command = frame.get("type").and_then(Value::as_str).unwrap_or("gateway.event").to_string();
            let input = fleetcore_broker::RouteInput {
                command,
                payload: frame,
                source: Some(fleetcore_types::message::MessageSource::internal()),
                external_id: None,
            };
            let _ = broker.route(&from_id, "gateway/inbound", input).await;
        }
    });

    Ok(GatewayHandle {
        outbound: outbound_tx,
        _reader: reader,
        _writer: writer,
    })
}
