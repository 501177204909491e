use std::fmt;

/// Errors surfaced by the controller's reconcile path and the clients it
/// drives. Request-scoped gateway failures are mapped straight to HTTP
/// statuses in the proxy and never reach this type.
#[derive(Debug)]
pub enum Error {
    Kube(kube::Error),
    Manager(String),
    Serialization(serde_json::Error),
    MissingObjectKey(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Kube(e) => write!(f, "cluster api error: {}", e),
            Error::Manager(msg) => write!(f, "gateway programming error: {}", msg),
            Error::Serialization(e) => write!(f, "serialization error: {}", e),
            Error::MissingObjectKey(key) => write!(f, "object missing key: {}", key),
        }
    }
}

impl std::error::Error for Error {}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Error::Kube(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e)
    }
}
