use thiserror::Error;

/// Errors raised by a packet codec device or the transport underneath it.
#[derive(Debug, Clone, Error)]
pub enum DeviceError {
    /// The transport could not be opened or has gone away.
    #[error("transport error: {0}")]
    Transport(String),

    /// A write to the device failed (includes heartbeat writes).
    #[error("write failed: {0}")]
    Write(String),

    /// The device is not connected or has already been closed.
    #[error("device not connected")]
    NotConnected,

    /// The device or transport kind does not implement this operation.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    /// Protobuf encode/decode failure on an outbound request.
    #[error("codec error: {0}")]
    Codec(String),
}

impl From<prost::EncodeError> for DeviceError {
    fn from(e: prost::EncodeError) -> Self {
        DeviceError::Codec(e.to_string())
    }
}

/// Outcome of an explicit radio `connect` call.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// A newer connect/disconnect call replaced this one while it was in flight.
    #[error("connection attempt superseded by a newer connect or disconnect")]
    Superseded,

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Errors surfaced by the broker bridge.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// No broker session is connected.
    #[error("broker not connected")]
    NotConnected,

    /// Settings rejected before or by the broker (bad credentials, malformed values).
    #[error("broker configuration error: {0}")]
    Config(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("encode failed: {0}")]
    Encode(#[from] prost::EncodeError),
}

/// Errors returned by the [`crate::client::MeshClient`] facade.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Neither a radio device nor a broker session is available.
    #[error("no radio device or broker connection available")]
    NotConnected,

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Connect(#[from] ConnectError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_error_wraps_device_error() {
        let err: ClientError = DeviceError::Unsupported("reboot").into();
        assert_eq!(err.to_string(), "operation not supported: reboot");
    }
}
