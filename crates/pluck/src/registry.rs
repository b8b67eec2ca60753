//! Registry access: layer listings and scoped layer streams.
//!
//! [`BlobSource`] is the seam between the extraction driver and the
//! registry: it yields the ordered layer list for an image and opens one
//! layer stream at a time. [`RegistryBlobSource`] implements it over the
//! OCI distribution protocol, with per-registry credentials, a platform
//! filter for multi-arch indexes, and optional mirror fallback.
//!
//! A layer stream is a reader half plus a background driver task feeding
//! it. The driver task performs the actual blob download; the reader sees
//! the decompressed tar bytes. Dropping the stream abandons the download;
//! [`LayerStream::finish`] drains it and surfaces any transport error the
//! driver hit.

use std::io::Cursor;
use std::sync::Arc;

use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use async_trait::async_trait;
use log::{debug, warn};
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::errors::OciDistributionError;
use oci_distribution::manifest::OciDescriptor;
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, RegistryOperation};
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::task::JoinHandle;

use crate::auth::CredentialStore;
use crate::mirror::MirrorPolicy;
use crate::platform::Arch;
use crate::reference::ImageReference;
use crate::{Error, Result};

const LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";
const LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
const LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";
const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar";
const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// How much blob data may sit between the download task and the reader.
const STREAM_BUFFER: usize = 64 * 1024;

/// An ordered entry in an image's manifest.
///
/// The manifest order is the order layers were stacked when the image was
/// built, oldest first; the extraction driver depends on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerDescriptor {
    /// Content digest of the (compressed) layer blob.
    pub digest: String,
    /// Declared blob size in bytes.
    pub size: u64,
    /// Layer media type, which also names the compression.
    pub media_type: String,
}

impl LayerDescriptor {
    fn from_descriptor(descriptor: &OciDescriptor) -> Self {
        LayerDescriptor {
            digest: descriptor.digest.clone(),
            size: descriptor.size.max(0) as u64,
            media_type: descriptor.media_type.clone(),
        }
    }

    fn to_descriptor(&self) -> OciDescriptor {
        OciDescriptor {
            digest: self.digest.clone(),
            size: self.size as i64,
            media_type: self.media_type.clone(),
            ..OciDescriptor::default()
        }
    }
}

/// An open, scoped stream over one layer's decompressed tar bytes.
///
/// Exactly one of these should be alive per extraction at any moment. The
/// stream must either be read and then [`finish`]ed, or dropped/[`fail`]ed
/// to abandon it; both paths release the underlying connection.
///
/// [`finish`]: LayerStream::finish
/// [`fail`]: LayerStream::fail
pub struct LayerStream {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    driver: Option<JoinHandle<Result<()>>>,
}

impl LayerStream {
    fn new(
        reader: Box<dyn AsyncRead + Send + Unpin>,
        driver: Option<JoinHandle<Result<()>>>,
    ) -> Self {
        LayerStream { reader, driver }
    }

    /// Wrap a plain reader as a layer stream, with no download task behind
    /// it. The reader must yield uncompressed tar bytes.
    pub fn from_reader(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        LayerStream::new(Box::new(reader), None)
    }

    /// The tar byte stream.
    pub fn reader(&mut self) -> &mut (dyn AsyncRead + Send + Unpin) {
        &mut self.reader
    }

    /// Consume the rest of the stream and surface any failure from the
    /// download task.
    pub async fn finish(mut self) -> Result<()> {
        tokio::io::copy(&mut self.reader, &mut tokio::io::sink())
            .await
            .map_err(|e| corrupt_stream(format!("trailing layer data unreadable: {e}")))?;

        if let Some(driver) = self.driver.take() {
            match driver.await {
                Ok(result) => result?,
                Err(join) if join.is_cancelled() => {}
                Err(join) => {
                    return Err(Error::Transport {
                        image: "layer download task".to_string(),
                        source: Box::new(join),
                    })
                }
            }
        }
        Ok(())
    }

    /// Abandon the stream after a failure, preferring the download task's
    /// own error over `fallback` when it already finished with one. A
    /// transport failure surfacing as premature EOF in the tar reader is
    /// reported as the transport failure it is.
    pub async fn fail(mut self, fallback: Error) -> Error {
        if let Some(driver) = self.driver.take() {
            if driver.is_finished() {
                if let Ok(Err(err)) = driver.await {
                    return err;
                }
            } else {
                driver.abort();
            }
        }
        fallback
    }
}

impl std::fmt::Debug for LayerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerStream")
            .field("driver", &self.driver.as_ref().map(|d| d.is_finished()))
            .finish_non_exhaustive()
    }
}

/// Source of layer listings and layer byte streams for images.
#[async_trait]
pub trait BlobSource {
    /// The ordered layer list (oldest first) for the image's first
    /// platform-matching manifest.
    async fn list_layers(&self, image: &ImageReference) -> Result<Vec<LayerDescriptor>>;

    /// Open a stream over one layer's tar bytes.
    async fn open_layer(
        &self,
        image: &ImageReference,
        layer: &LayerDescriptor,
    ) -> Result<LayerStream>;
}

/// [`BlobSource`] backed by an OCI registry.
pub struct RegistryBlobSource {
    client: Arc<Client>,
    credentials: CredentialStore,
    mirrors: MirrorPolicy,
}

impl RegistryBlobSource {
    /// Create a source for the given target architecture, with anonymous
    /// credentials and no mirror fallback.
    pub fn new(arch: &Arch) -> Self {
        let config = ClientConfig {
            protocol: ClientProtocol::Https,
            platform_resolver: Some(arch.index_resolver()),
            ..Default::default()
        };
        RegistryBlobSource {
            client: Arc::new(Client::new(config)),
            credentials: CredentialStore::empty(),
            mirrors: MirrorPolicy::empty(),
        }
    }

    /// Use credentials from a dockerconfig-style store.
    pub fn with_credentials(mut self, credentials: CredentialStore) -> Self {
        self.credentials = credentials;
        self
    }

    /// Fall back to mirror locations from an image-content-source policy.
    pub fn with_mirror_policy(mut self, mirrors: MirrorPolicy) -> Self {
        self.mirrors = mirrors;
        self
    }

    fn auth_for(&self, registry: &str) -> RegistryAuth {
        match self.credentials.credentials_for(registry).as_basic() {
            Some((user, pass)) => RegistryAuth::Basic(user.to_string(), pass.to_string()),
            None => RegistryAuth::Anonymous,
        }
    }

    /// Start a blob download for one candidate location and hand back the
    /// raw (still compressed) byte stream once data is flowing.
    ///
    /// The first read doubles as the error handshake: request failures
    /// (auth, missing blob) happen before any byte is written, so an
    /// immediate EOF means the download task has failed and its error can
    /// be taken, leaving further mirror candidates still usable.
    async fn start_download(
        &self,
        candidate: &ImageReference,
        layer: &LayerDescriptor,
    ) -> Result<(impl AsyncRead + Send + Unpin + 'static, JoinHandle<Result<()>>)> {
        let subject = format!("layer {} of {}", layer.digest, candidate);
        let auth = self.auth_for(&candidate.registry);
        let reference = candidate.to_oci();
        let descriptor = layer.to_descriptor();

        // Blob requests reuse the token this establishes, so a permission
        // problem surfaces here, while this candidate can still be skipped
        // in favor of a mirror.
        self.client
            .auth(&reference, &auth, RegistryOperation::Pull)
            .await
            .map_err(|e| classify(&subject, e))?;

        let (mut rx, tx) = tokio::io::duplex(STREAM_BUFFER);
        let client = Arc::clone(&self.client);
        let task_subject = subject.clone();
        let driver = tokio::spawn(async move {
            client
                .pull_blob(&reference, &descriptor, tx)
                .await
                .map_err(|e| classify(&task_subject, e))
        });

        let mut head = vec![0u8; 8192];
        let n = rx.read(&mut head).await.map_err(|e| Error::Transport {
            image: subject.clone(),
            source: Box::new(e),
        })?;
        head.truncate(n);

        if n == 0 {
            // Writer gone before the first byte: either a failed request or
            // a genuinely empty blob.
            match driver.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(err),
                Err(join) => {
                    return Err(Error::Transport {
                        image: subject,
                        source: Box::new(join),
                    })
                }
            }
            let done = tokio::spawn(async { Ok::<(), Error>(()) });
            return Ok((Cursor::new(head).chain(rx), done));
        }

        Ok((Cursor::new(head).chain(rx), driver))
    }
}

#[async_trait]
impl BlobSource for RegistryBlobSource {
    async fn list_layers(&self, image: &ImageReference) -> Result<Vec<LayerDescriptor>> {
        let mut first_err = None;

        for candidate in self.mirrors.candidates(image) {
            let auth = self.auth_for(&candidate.registry);
            match self
                .client
                .pull_image_manifest(&candidate.to_oci(), &auth)
                .await
            {
                Ok((manifest, digest)) => {
                    debug!(
                        "{candidate}: manifest {digest} with {} layers",
                        manifest.layers.len()
                    );
                    return Ok(manifest
                        .layers
                        .iter()
                        .map(LayerDescriptor::from_descriptor)
                        .collect());
                }
                Err(err) => {
                    warn!("cannot read manifest from {candidate}: {err}");
                    first_err.get_or_insert(classify(&candidate.to_string(), err));
                }
            }
        }

        Err(first_err.unwrap_or_else(|| Error::Reference {
            reference: image.to_string(),
            reason: "no registry location to try".to_string(),
        }))
    }

    async fn open_layer(
        &self,
        image: &ImageReference,
        layer: &LayerDescriptor,
    ) -> Result<LayerStream> {
        let mut first_err = None;

        for candidate in self.mirrors.candidates(image) {
            match self.start_download(&candidate, layer).await {
                Ok((raw, driver)) => {
                    let reader = decode_layer(&layer.media_type, raw).map_err(|err| {
                        err.with_layer_context(image, &layer.digest)
                    })?;
                    return Ok(LayerStream::new(reader, Some(driver)));
                }
                Err(err) => {
                    warn!("cannot open layer {} from {candidate}: {err}", layer.digest);
                    first_err.get_or_insert(err);
                }
            }
        }

        Err(first_err.unwrap_or_else(|| Error::Reference {
            reference: image.to_string(),
            reason: "no registry location to try".to_string(),
        }))
    }
}

impl std::fmt::Debug for RegistryBlobSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryBlobSource").finish_non_exhaustive()
    }
}

/// Wrap a raw blob stream in the decoder its media type calls for.
fn decode_layer(
    media_type: &str,
    raw: impl AsyncRead + Send + Unpin + 'static,
) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
    Ok(match media_type {
        LAYER_TAR | DOCKER_LAYER => Box::new(raw),
        LAYER_GZIP | DOCKER_LAYER_GZIP => Box::new(GzipDecoder::new(BufReader::new(raw))),
        LAYER_ZSTD => Box::new(ZstdDecoder::new(BufReader::new(raw))),
        other => {
            return Err(corrupt_stream(format!(
                "unsupported layer media type {other:?}"
            )))
        }
    })
}

/// Sort a registry failure into the error taxonomy. Anything that is not a
/// definite permission or existence problem is treated as transport, which
/// keeps it retryable.
fn classify(subject: &str, err: OciDistributionError) -> Error {
    match err {
        err @ OciDistributionError::ImageManifestNotFoundError(_) => Error::NotFound {
            image: subject.to_string(),
            source: err,
        },
        err @ (OciDistributionError::AuthenticationFailure(_)
        | OciDistributionError::UnauthorizedError { .. }) => Error::Access {
            image: subject.to_string(),
            source: err,
        },
        err => Error::Transport {
            image: subject.to_string(),
            source: Box::new(err),
        },
    }
}

/// Stream-corruption error without layer identity; the extraction driver
/// fills that in.
pub(crate) fn corrupt_stream(reason: String) -> Error {
    Error::StreamCorruption {
        image: "(unknown)".to_string(),
        digest: "(unknown)".to_string(),
        reason,
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;

    async fn decode_all(media_type: &str, data: Vec<u8>) -> Result<Vec<u8>> {
        let mut reader = decode_layer(media_type, Cursor::new(data))?;
        let mut out = Vec::new();
        reader
            .read_to_end(&mut out)
            .await
            .map_err(|e| corrupt_stream(e.to_string()))?;
        Ok(out)
    }

    #[tokio::test]
    async fn test_decode_passthrough() {
        let out = decode_all(LAYER_TAR, b"raw tar bytes".to_vec()).await.unwrap();
        assert_eq!(out, b"raw tar bytes");
    }

    #[tokio::test]
    async fn test_decode_gzip() {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"compressed tar bytes").unwrap();
        let data = encoder.finish().unwrap();

        for media_type in [LAYER_GZIP, DOCKER_LAYER_GZIP] {
            let out = decode_all(media_type, data.clone()).await.unwrap();
            assert_eq!(out, b"compressed tar bytes");
        }
    }

    #[tokio::test]
    async fn test_decode_rejects_unknown_media_type() {
        let result = decode_layer("application/octet-stream", Cursor::new(Vec::new()));
        assert!(matches!(result, Err(Error::StreamCorruption { .. })));
    }

    #[tokio::test]
    async fn test_layer_stream_finish_drains() {
        let mut stream = LayerStream::from_reader(Cursor::new(vec![0u8; 4096]));
        let mut buf = [0u8; 16];
        stream.reader().read_exact(&mut buf).await.unwrap();
        // finish() must consume the rest without error
        stream.finish().await.unwrap();
    }

    #[test]
    fn test_layer_descriptor_round_trip() {
        let layer = LayerDescriptor {
            digest: "sha256:deadbeef".to_string(),
            size: 1234,
            media_type: LAYER_GZIP.to_string(),
        };
        assert_eq!(
            LayerDescriptor::from_descriptor(&layer.to_descriptor()),
            layer
        );
    }
}
