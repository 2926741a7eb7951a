use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum KubeError {
    #[error("kubernetes configuration: {0}")]
    Config(String),
    #[error("reading {path}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("request to the api server failed")]
    Http(#[from] reqwest::Error),
    #[error("pod {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },
    #[error("api server answered {status}: {message}")]
    Api { status: u16, message: String },
    #[error("resource version {0} is too old")]
    Gone(String),
    #[error("decoding api server response")]
    Decode(#[from] serde_json::Error),
    #[error("invalid {kind} {value:?}")]
    InvalidName { kind: &'static str, value: String },
    #[error("invalid container id {0}")]
    InvalidContainerId(String),
}
