#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("OCI error: {0}")]
    OCIParseError(#[from] oci_distribution::ParseError),

    #[error("OCI error: {0}")]
    OCIError(#[from] oci_distribution::errors::OciDistributionError),

    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("Error parsing YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Error parsing reference {reference:?}: {source}")]
    BadReference {
        reference: String,
        source: url::ParseError,
    },

    #[error("Parallelism must be greater than zero, got {0}")]
    NonPositiveParallelism(usize),

    #[error("--image is required when the input contains build references")]
    ImageRequired,

    #[error("--bundle is required when the input contains build references")]
    BundleRequired,

    #[error("Unexpected host {host:?} in {reference:?}, did you mean {suggestion:?}?")]
    UnexpectedHost {
        host: String,
        reference: String,
        suggestion: String,
    },

    #[error("{reference:?} must name a {kind} as its host, e.g. {scheme}://build-thing")]
    MissingJobName {
        reference: String,
        kind: &'static str,
        scheme: &'static str,
    },

    #[error("{kind} {name:?} is missing: {missing}")]
    IncompleteContract {
        kind: &'static str,
        name: String,
        missing: String,
    },

    #[error("{reason}: {message}")]
    BuildFailed { reason: String, message: String },

    #[error("Run {name:?} succeeded without declaring result {result:?}")]
    MissingResult { name: String, result: String },

    #[error("Resolved reference to {0:?} not found")]
    MissingResolvedReference(String),

    #[error("Location of {reference:?} in document {doc} no longer names a node")]
    StaleLocation { reference: String, doc: usize },

    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("Error decoding docker config JSON: {0}")]
    DecodeDockerConfig(#[from] docker_config::Error),

    #[error("Error retrieving docker credentials: {0}")]
    CredentialError(#[from] docker_credential::CredentialRetrievalError),

    #[error("Unsupported docker credential type for registry {0:?}")]
    UnsupportedCredentialType(String),

    #[error("Error encoding image config JSON: {0}")]
    EncodeImageConfig(serde_json::Error),

    #[error("Interrupted")]
    Interrupted,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Result name a build must declare to report the digest it pushed.
pub const IMAGE_DIGEST_RESULT: &str = "mink-image-digest";

/// Parameter carrying the source bundle digest into a Task or Pipeline.
pub const SOURCE_BUNDLE_PARAM: &str = "mink-source-bundle";

/// Parameter carrying the target image tag into a Task or Pipeline.
pub const IMAGE_TARGET_PARAM: &str = "mink-image-target";

/// Builder functions, one per directive scheme.
pub mod builds;

/// OCI image and index composition plus source bundling.
pub mod bundles;

/// Reference resolution: scan, dispatch, rewrite.
pub mod resolve;

/// Tekton resource type definitions.
pub mod resources;

/// Job executor adapter over the Tekton cluster API.
pub mod runner;

pub mod docker_config;
pub mod scan;
