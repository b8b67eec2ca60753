//! Error types for the pluck library.
//!
//! Every fallible operation returns [`Result<T>`], an alias for
//! `Result<T, Error>`. The variants separate the failures a caller can do
//! something about (fix the reference, supply different credentials, retry)
//! from the ones it cannot. Only [`Transport`] failures are worth retrying:
//! re-running an extraction is idempotent and overwrites any partial output.
//!
//! [`Transport`]: Error::Transport

use std::path::PathBuf;

use oci_distribution::errors::OciDistributionError;

/// Result type alias for operations that may return an [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for image resolution and extraction.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed image reference string.
    #[error("invalid image reference {reference:?}: {reason}")]
    Reference {
        /// The reference string as supplied by the caller.
        reference: String,
        /// Why it does not parse.
        reason: String,
    },

    /// The named component has no usable entry in the release manifest.
    #[error("cannot resolve component {component:?} in release {release}: {reason}")]
    Resolution {
        /// The release image the component manifest was read from.
        release: String,
        /// The logical component name that was looked up.
        component: String,
        /// Why resolution failed.
        reason: String,
    },

    /// The registry denied access to the image or repository.
    #[error("access to {image} denied: {source}")]
    Access {
        /// The image (or layer-of-image) the registry refused.
        image: String,
        #[source]
        source: OciDistributionError,
    },

    /// The image or layer does not exist at the registry.
    #[error("{image} not found: {source}")]
    NotFound {
        /// The image (or layer-of-image) that did not resolve.
        image: String,
        #[source]
        source: OciDistributionError,
    },

    /// Network or protocol failure while talking to a registry.
    #[error("registry transport failure for {image}: {source}")]
    Transport {
        /// The image (or layer-of-image) the failure occurred for.
        image: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Malformed archive content inside a layer.
    #[error("corrupt layer {digest} of {image}: {reason}")]
    StreamCorruption {
        /// The image the layer belongs to.
        image: String,
        /// The content digest of the offending layer.
        digest: String,
        /// What was wrong with the stream.
        reason: String,
    },

    /// Local filesystem failure, including rejected path traversal.
    #[error("cannot write {}: {source}", path.display())]
    Write {
        /// The destination path the write was for.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed glob pattern in a match rule.
    #[error("invalid match pattern {pattern:?}: {source}")]
    Pattern {
        /// The pattern string as supplied by the caller.
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    /// Unusable caller-supplied configuration file.
    #[error("cannot load {}: {reason}", path.display())]
    Config {
        /// The credentials or mirror-policy file that failed to load.
        path: PathBuf,
        /// Why it could not be used.
        reason: String,
    },
}

impl Error {
    /// Whether re-running the failed operation can be expected to help.
    ///
    /// Extraction is idempotent, so transport failures are safe to retry
    /// wholesale. Everything else needs a change of input first.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport { .. })
    }

    /// Stamp a stream-corruption error with the layer it came from.
    ///
    /// The layer applier only sees an anonymous byte stream; the extraction
    /// driver knows which image and digest that stream was opened for.
    pub(crate) fn with_layer_context(self, image: &crate::ImageReference, digest: &str) -> Self {
        match self {
            Error::StreamCorruption { reason, .. } => Error::StreamCorruption {
                image: image.to_string(),
                digest: digest.to_string(),
                reason,
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_retryable() {
        let transport = Error::Transport {
            image: "example.com/img:1".into(),
            source: std::io::Error::other("connection reset").into(),
        };
        assert!(transport.is_retryable());

        let resolution = Error::Resolution {
            release: "example.com/release:1".into(),
            component: "widget-images".into(),
            reason: "no such tag".into(),
        };
        assert!(!resolution.is_retryable());

        let write = Error::Write {
            path: "/tmp/out".into(),
            source: std::io::Error::other("disk full"),
        };
        assert!(!write.is_retryable());
    }

    #[test]
    fn test_display_carries_context() {
        let err = Error::StreamCorruption {
            image: "example.com/img:1".into(),
            digest: "sha256:abc".into(),
            reason: "unexpected EOF".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("sha256:abc"));
        assert!(msg.contains("example.com/img:1"));
    }
}
