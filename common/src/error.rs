use thiserror::Error;

/// General-purpose error type shared by every crate in the workspace. Carries the
/// transport/serialization failures that can occur while talking to a remote WPS node or reading
/// a workflow description from disk. Domain-specific failures (an invalid workflow, an
/// incompatible datatype pairing, a failed remote execution) live in
/// [`workflow_engine::Error`][crate] instead, which wraps this type.
#[derive(Error, Debug)]
pub enum EmError {
    #[error("Reqwest error\n{0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("Json serde error\n{0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("Yaml serde error\n{0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    #[error("Xml error\n{0}")]
    Xml(#[from] quick_xml::Error),
    #[error("IO error\n{0}")]
    IO(#[from] std::io::Error),
    #[error("Environment variable error\n{0}")]
    EnvVar(#[from] std::env::VarError),
    #[error("{0}")]
    ParseInt(#[from] std::num::ParseIntError),
    #[error("Generic error\n{0}")]
    Generic(String),
}

impl From<&str> for EmError {
    fn from(value: &str) -> Self {
        Self::Generic(value.to_owned())
    }
}

impl From<String> for EmError {
    fn from(value: String) -> Self {
        Self::Generic(value)
    }
}

/// Generic [Result] type where the error is always [`EmError`]
pub type EmResult<T> = Result<T, EmError>;
