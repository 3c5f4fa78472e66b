use thiserror::Error;

/// Failures from the durable event store. Retried unless [`StoreError::is_permanent`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("unknown {field} value in store: {value}")]
    Corrupt { field: &'static str, value: String },

    #[error("store rejected row: {0}")]
    Rejected(String),

    #[error("store unavailable")]
    Unavailable,
}

impl StoreError {
    /// Errors caused by the row itself. Retrying the same data fails the same way.
    pub fn is_permanent(&self) -> bool {
        match self {
            // SQLSTATE class 22 is data exception, 23 is integrity violation
            StoreError::Database(sqlx::Error::Database(db)) => db
                .code()
                .is_some_and(|code| code.starts_with("22") || code.starts_with("23")),
            StoreError::Encode(_) | StoreError::Rejected(_) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid value for {var}: {value}")]
    Env { var: &'static str, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[cfg(unix)]
    #[error("signal delivery failed: {0}")]
    Os(#[from] nix::errno::Errno),

    #[error("pid {0} does not fit the platform pid type")]
    BadPid(u32),

    #[error("process signalling is not supported on this platform")]
    Unsupported,
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("job program must not be empty")]
    EmptyProgram,

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}
