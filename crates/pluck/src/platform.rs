//! Target CPU architecture handling.
//!
//! Callers name architectures in uname style (`x86_64`, `aarch64`); OCI
//! image indexes use the Go convention (`amd64`, `arm64`). [`Arch`] keeps
//! the uname form canonical and converts on demand.

use oci_distribution::manifest::ImageIndexEntry;

/// A normalized target CPU architecture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arch {
    name: String,
}

impl Arch {
    /// Normalize an architecture string. Accepts both uname and OCI
    /// spellings; unknown names pass through lowercased.
    pub fn new(arch: &str) -> Self {
        let arch = arch.trim().to_lowercase();
        let name = match arch.as_str() {
            "amd64" => "x86_64",
            "arm64" => "aarch64",
            other => other,
        };
        Arch {
            name: name.to_string(),
        }
    }

    /// The canonical uname-style name (`x86_64`, `aarch64`, `ppc64le`, ...).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The OCI platform spelling used in image index entries.
    pub fn oci_arch(&self) -> &str {
        match self.name.as_str() {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            other => other,
        }
    }

    /// Platform filter for multi-arch image indexes: picks the first
    /// manifest for linux on this architecture.
    pub(crate) fn index_resolver(
        &self,
    ) -> Box<dyn Fn(&[ImageIndexEntry]) -> Option<String> + Send + Sync> {
        let arch = self.oci_arch().to_string();
        Box::new(move |entries| {
            entries
                .iter()
                .find(|entry| {
                    entry
                        .platform
                        .as_ref()
                        .is_some_and(|p| p.os == "linux" && p.architecture == arch)
                })
                .map(|entry| entry.digest.clone())
        })
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}
