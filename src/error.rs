use derive_more::From;
use k8s_openapi::serde_json;
use std::sync::Arc;

use crate::k8s::tenant::TenantKey;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, From)]
pub enum Error {
    #[from]
    Json(serde_json::Error),

    #[from]
    Kube(kube::Error),

    #[from]
    Kubeconfig(kube::config::KubeconfigError),

    #[from]
    Io(std::io::Error),

    /// No tenant configuration exists for the requested config id / cluster
    ConfigNotFound(String),

    /// Building the API client for a tenant failed; never cached
    ClientConstruction { tenant: TenantKey, reason: String },

    PermissionDenied(String),

    FetchFailed(String),

    /// A background task panicked; only ever logged
    RefreshPanic(String),

    NotFound(String),

    BadRequest(String),

    LockPoisoned(String),

    /// One failure observed by every waiter of a single-flight fetch
    Shared(Arc<Error>),

    /// Custom error message
    Custom(String),
}

/// Coarse classification used to pick a response path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConfigNotFound,
    ClientConstructionFailed,
    PermissionDenied,
    NotFound,
    BadRequest,
    FetchFailed,
    RefreshPanic,
    Internal,
}

impl ErrorKind {
    /// HTTP status used by non-streaming responses
    #[must_use]
    pub const fn status_code(self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::PermissionDenied => 403,
            Self::ConfigNotFound | Self::NotFound => 404,
            Self::ClientConstructionFailed => 503,
            Self::FetchFailed | Self::RefreshPanic | Self::Internal => 500,
        }
    }
}

impl Error {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConfigNotFound(_) => ErrorKind::ConfigNotFound,
            Self::ClientConstruction { .. } | Self::Kubeconfig(_) => {
                ErrorKind::ClientConstructionFailed
            }
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::Kube(kube::Error::Api(response)) => match response.code {
                403 => ErrorKind::PermissionDenied,
                404 => ErrorKind::NotFound,
                _ => ErrorKind::FetchFailed,
            },
            Self::Kube(_) | Self::FetchFailed(_) => ErrorKind::FetchFailed,
            Self::RefreshPanic(_) => ErrorKind::RefreshPanic,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::BadRequest(_) => ErrorKind::BadRequest,
            Self::Shared(inner) => inner.kind(),
            Self::Json(_) | Self::Io(_) | Self::LockPoisoned(_) | Self::Custom(_) => {
                ErrorKind::Internal
            }
        }
    }

    #[must_use]
    pub fn status_code(&self) -> u16 {
        self.kind().status_code()
    }

    #[must_use]
    pub fn is_forbidden(&self) -> bool {
        self.kind() == ErrorKind::PermissionDenied
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::result::Result<(), core::fmt::Error> {
        match self {
            Self::Json(e) => write!(fmt, "json error: {e}"),
            Self::Kube(kube::Error::Api(response)) => {
                write!(fmt, "{} ({})", response.message, response.reason)
            }
            Self::Kube(e) => write!(fmt, "kubernetes error: {e}"),
            Self::Kubeconfig(e) => write!(fmt, "kubeconfig error: {e}"),
            Self::Io(e) => write!(fmt, "io error: {e}"),
            Self::ConfigNotFound(id) => write!(fmt, "configuration not found: {id}"),
            Self::ClientConstruction { tenant, reason } => {
                write!(fmt, "failed to build client for {tenant}: {reason}")
            }
            Self::PermissionDenied(msg) => write!(fmt, "permission denied: {msg}"),
            Self::FetchFailed(msg) => write!(fmt, "fetch failed: {msg}"),
            Self::RefreshPanic(msg) => write!(fmt, "refresh panicked: {msg}"),
            Self::NotFound(what) => write!(fmt, "not found: {what}"),
            Self::BadRequest(msg) => write!(fmt, "bad request: {msg}"),
            Self::LockPoisoned(msg) => write!(fmt, "lock poisoned: {msg}"),
            Self::Shared(inner) => write!(fmt, "{inner}"),
            Self::Custom(msg) => write!(fmt, "{msg}"),
        }
    }
}

impl std::error::Error for Error {}
