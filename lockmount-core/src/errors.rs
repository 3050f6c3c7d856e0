use thiserror::Error;

/// Result type alias for lockmount operations
pub type Result<T> = anyhow::Result<T>;

#[derive(Error, Debug)]
pub enum LockmountError {
    #[error("No mounted external volume matches '{0}'")]
    UnknownVolume(String),

    #[error("'{0}' matches more than one mounted volume; use the volume id instead")]
    AmbiguousVolume(String),

    #[error("Preferences file version {found} is newer than supported version {supported}")]
    UnsupportedPreferencesVersion { found: u32, supported: u32 },

    #[error("Could not determine a configuration directory; pass --config")]
    NoConfigDir,
}
