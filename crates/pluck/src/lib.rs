//! Selective extraction of files from container image layers.
//!
//! `pluck` locates named artifacts inside the filesystem layers of a
//! container image and materializes just those entries on local disk —
//! no image mount, no container runtime, no full rootfs reconstruction.
//! Layers are streamed straight from the registry and visited in manifest
//! order, so a file present in several layers ends up with the content of
//! the last layer that carries it, matching overlay semantics.
//!
//! The image to search is usually found indirectly: a release image
//! publishes a component manifest mapping logical names to pullspecs, and
//! [`resolve_component`] looks a name up there first.
//!
//! ```no_run
//! use std::path::Path;
//!
//! use pluck::{extract, platform::Arch, ImageReference, MatchRule};
//! use pluck::{RegistryBlobSource, TraversalPolicy};
//!
//! # async fn demo() -> pluck::Result<()> {
//! let source = RegistryBlobSource::new(&Arch::new("x86_64"));
//! let image = ImageReference::parse("registry.example/org/widget@sha256:deadbeef")?;
//! let rule = MatchRule::new("/data", "widget-*.bin")?;
//!
//! let result = extract(Path::new("."), &image, &[rule], &source, TraversalPolicy::VisitAll).await?;
//! if result.is_empty() {
//!     // not an error: the image simply does not carry the file
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Each extraction call is independent; calls targeting different
//! destination directories may run concurrently. Concurrent extractions
//! into the *same* destination are not guarded against.

pub mod auth;
mod error;
pub mod extract;
pub mod mirror;
pub mod platform;
pub mod reference;
pub mod registry;
pub mod release;
pub mod rules;

pub use error::{Error, Result};
pub use extract::{apply_layer, extract, ExtractionResult, TraversalPolicy};
pub use reference::ImageReference;
pub use registry::{BlobSource, LayerDescriptor, LayerStream, RegistryBlobSource};
pub use release::resolve_component;
pub use rules::MatchRule;
