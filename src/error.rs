use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error kind carried by a request rejection on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireErrorKind {
    /// Malformed or semantically invalid input.
    Type,
    /// The handler id does not resolve to a live object.
    NotFound,
    /// Policy failure, missing referent or state conflict.
    Error,
}

impl WireErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WireErrorKind::Type => "TypeError",
            WireErrorKind::NotFound => "NotFoundError",
            WireErrorKind::Error => "Error",
        }
    }

    pub fn from_name(name: &str) -> WireErrorKind {
        match name {
            "TypeError" => WireErrorKind::Type,
            "NotFoundError" => WireErrorKind::NotFound,
            _ => WireErrorKind::Error,
        }
    }
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The channel towards the control plane is closed.
    #[error("channel closed")]
    ErrChannelClosed,

    /// An operation was executed on a closed object.
    #[error("{0} closed")]
    ErrClosed(&'static str),

    /// An inbound frame violates the channel framing rules. Fatal.
    #[error("invalid channel frame: {0}")]
    ErrInvalidFrame(String),

    /// An outbound message exceeds the maximum frame length.
    #[error("channel message too big")]
    ErrMessageTooBig,

    /// A request carried a malformed or missing body field.
    #[error("{0}")]
    ErrTypeError(String),

    /// The request's handler id does not resolve to a live object.
    #[error("handler with ID {0} not found")]
    ErrHandlerNotFound(String),

    /// A handler id is already registered.
    #[error("handler with ID {0} already registered")]
    ErrHandlerAlreadyRegistered(String),

    /// Generic policy / state error with a wire-visible reason.
    #[error("{0}")]
    ErrOther(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("util error: {0}")]
    Util(#[from] util::Error),

    #[error("dtls error: {0}")]
    Dtls(#[from] dtls::Error),

    #[error("srtp error: {0}")]
    Srtp(#[from] srtp::Error),

    #[error("sctp error: {0}")]
    Sctp(#[from] sctp::Error),

    #[error("stun error: {0}")]
    Stun(#[from] stun::Error),
}

impl Error {
    /// Create a `type-error` rejection with the given reason.
    pub fn type_error(reason: impl Into<String>) -> Error {
        Error::ErrTypeError(reason.into())
    }

    /// Create a generic `error` rejection with the given reason.
    pub fn other(reason: impl Into<String>) -> Error {
        Error::ErrOther(reason.into())
    }

    /// The wire kind a request rejection carries for this error.
    pub fn wire_kind(&self) -> WireErrorKind {
        match self {
            Error::ErrTypeError(_) | Error::ErrInvalidFrame(_) => WireErrorKind::Type,
            Error::ErrHandlerNotFound(_) => WireErrorKind::NotFound,
            _ => WireErrorKind::Error,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::ErrTypeError(err.to_string())
    }
}
