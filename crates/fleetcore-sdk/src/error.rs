use std::fmt;

#[derive(Debug)]
pub enum SdkError {
    Runtime(fleetcore_runtime::RuntimeError),
    Broker(fleetcore_broker::BrokerError),
    Store(fleetcore_store::StoreError),
    Io(std::io::Error),
    Json(serde_json::Error),
    Codec(tokio_util::codec::LinesCodecError),
    /// The upstream gateway handshake did not complete (`spec.md` §6 exit
    /// convention: this is fatal at boot).
    GatewayHandshakeFailed(String),
}

impl fmt::Display for SdkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdkError::Runtime(e) => write!(f, "{e}"),
            SdkError::Broker(e) => write!(f, "{e}"),
            SdkError::Store(e) => write!(f, "{e}"),
            SdkError::Io(e) => write!(f, "io error: {e}"),
            SdkError::Json(e) => write!(f, "json error: {e}"),
            SdkError::Codec(e) => write!(f, "framing error: {e}"),
            SdkError::GatewayHandshakeFailed(reason) => write!(f, "gateway handshake failed: {reason}"),
        }
    }
}

impl std::error::Error for SdkError {}

impl From<fleetcore_runtime::RuntimeError> for SdkError {
    fn from(err: fleetcore_runtime::RuntimeError) -> Self {
        SdkError::Runtime(err)
    }
}

impl From<fleetcore_broker::BrokerError> for SdkError {
    fn from(err: fleetcore_broker::BrokerError) -> Self {
        SdkError::Broker(err)
    }
}

impl From<fleetcore_store::StoreError> for SdkError {
    fn from(err: fleetcore_store::StoreError) -> Self {
        SdkError::Store(err)
    }
}

impl From<std::io::Error> for SdkError {
    fn from(err: std::io::Error) -> Self {
        SdkError::Io(err)
    }
}

impl From<serde_json::Error> for SdkError {
    fn from(err: serde_json::Error) -> Self {
        SdkError::Json(err)
    }
}

impl From<tokio_util::codec::LinesCodecError> for SdkError {
    fn from(err: tokio_util::codec::LinesCodecError) -> Self {
        SdkError::Codec(err)
    }
}
