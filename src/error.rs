use thiserror::Error;

use crate::meshid::NodeId;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Mesh error: {0}")]
    Mesh(#[from] MeshError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Identifier error: {0}")]
    Id(#[from] IdError),
}

/// Failures parsing node IDs, keys and locations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("Invalid node ID '{0}': expected up to 8 hex digits with optional '!' prefix")]
    InvalidNodeId(String),

    #[error("Invalid base64 key: {0}")]
    InvalidKey(String),

    #[error("Invalid geo URI: {0}")]
    InvalidGeoUri(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid key length: {0} bytes")]
    InvalidKeyLength(usize),

    #[error("Ciphertext too short: {0} bytes")]
    CiphertextTooShort(usize),

    #[error("PKI authentication failed")]
    AuthenticationFailed,

    #[error("Decrypted payload is not a valid Data record")]
    InvalidPayload,

    #[error("Packet carries no payload")]
    EmptyPacket,
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("{0} transport is not connected")]
    NotConnected(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("MQTT client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
}

/// Errors surfaced by the mesh client
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("from node is not managed by this bridge: {0}")]
    UnmanagedNode(NodeId),

    #[error("message is too large for meshtastic network: max({max}) sent({actual})")]
    PayloadTooLarge { max: usize, actual: usize },

    #[error("unsupported encryption mode for this operation")]
    UnsupportedEncryption,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("node info for {0} was sent too recently")]
    SentTooRecently(NodeId),

    #[error("no key available for {0}")]
    KeyUnavailable(NodeId),

    #[error("host metrics unavailable: {0}")]
    HostMetrics(String),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("identifier error: {0}")]
    Id(#[from] IdError),

    #[error("encode error: {0}")]
    Encode(#[from] prost::EncodeError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("no transports registered")]
    NoTransports,

    #[error("all transports failed: {}", join_errors(.0))]
    AllTransportsFailed(Vec<TransportError>),
}

fn join_errors(errors: &[TransportError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type MeshResult<T> = Result<T, MeshError>;
