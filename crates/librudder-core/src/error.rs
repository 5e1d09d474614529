use thiserror::Error;

/// Main error type for rudder core operations
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("render error: {0}")]
    Render(String),

    #[error("duplicate resource in desired state: {0}")]
    DuplicateResource(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database busy: {0}")]
    DbBusy(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl CoreError {
    /// Stable machine-readable code, used in API responses and sync results
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::InvalidConfig(_) => "invalid_config",
            CoreError::InvalidManifest(_) => "render_error",
            CoreError::Render(_) => "render_error",
            CoreError::DuplicateResource(_) => "render_error",
            CoreError::NotFound(_) => "not_found",
            CoreError::DbBusy(_) => "db_busy",
            CoreError::Io(_) => "io_error",
            CoreError::Sled(_) => "db_error",
            CoreError::Json(_) => "internal_error",
            CoreError::Yaml(_) => "render_error",
            CoreError::TomlParse(_) => "invalid_config",
            CoreError::TomlSerialize(_) => "internal_error",
        }
    }

    /// Whether the error came from bad templates, values or manifests
    pub fn is_render_error(&self) -> bool {
        self.error_code() == "render_error"
    }
}
