use thiserror::Error;

pub type HalResult<T> = std::result::Result<T, HalError>;

#[derive(Error, Debug)]
pub enum HalError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("D-Bus error: {0}")]
    DBus(#[from] zbus::Error),

    #[error("D-Bus value error: {0}")]
    Variant(#[from] zbus::zvariant::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Reason the disk arbitration service refused a mount or unmount request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Dissent {
    #[error("device is busy")]
    Busy,

    #[error("permission denied")]
    PermissionDenied,

    #[error("operation not supported")]
    Unsupported,

    #[error("not mounted")]
    NotMounted,

    #[error("already mounted")]
    AlreadyMounted,

    #[error("{0}")]
    Other(String),
}

impl Dissent {
    /// Map a UDisks2 D-Bus error name onto a dissent reason.
    pub fn from_udisks_error(name: &str, detail: Option<&str>) -> Self {
        match name.rsplit('.').next().unwrap_or(name) {
            "DeviceBusy" => Dissent::Busy,
            "NotAuthorized" | "NotAuthorizedCanObtain" | "NotAuthorizedDismissed" => {
                Dissent::PermissionDenied
            }
            "NotSupported" => Dissent::Unsupported,
            "NotMounted" => Dissent::NotMounted,
            "AlreadyMounted" => Dissent::AlreadyMounted,
            _ => Dissent::Other(match detail {
                Some(detail) => format!("{}: {}", name, detail),
                None => name.to_string(),
            }),
        }
    }
}
