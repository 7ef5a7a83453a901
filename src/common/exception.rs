use thiserror::Error;

/// Errors raised while building a detector or its tree.
///
/// Everything here is a configuration mistake caught at startup. Recording and
/// querying observations never fail.
#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Key value for {0} must not be empty")]
    EmptyKeyValue(String),
    #[error("Dimension names must not be empty")]
    EmptyDimensionName,
    #[error("Dimension {0} is listed more than once")]
    DuplicateDimension(String),
    #[error("Invalid detector config: {0}")]
    InvalidConfig(String),
    #[error("Failed to read detector config: {0}")]
    ConfigIo(#[from] std::io::Error),
    #[error("Failed to parse detector config: {0}")]
    ConfigParse(#[from] toml::de::Error),
}
