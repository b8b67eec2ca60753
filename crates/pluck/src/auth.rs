//! Registry credentials from dockerconfig-style files.
//!
//! The credentials file is the JSON format written by `docker login` /
//! `podman login`: an `auths` map keyed by registry, each entry carrying
//! either a base64 `auth` blob (`user:password`) or separate `username` /
//! `password` fields. Registries without an entry get anonymous access.

use std::collections::HashMap;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::debug;
use serde::Deserialize;

use crate::{Error, Result};

/// Credentials for one registry: basic auth or anonymous.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    username: Option<String>,
    password: Option<String>,
}

impl Credentials {
    /// No credentials; the registry is accessed anonymously.
    pub fn anonymous() -> Self {
        Credentials::default()
    }

    /// Basic authentication.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    pub(crate) fn as_basic(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user, pass)),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, DockerAuth>,
}

#[derive(Debug, Deserialize)]
struct DockerAuth {
    auth: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

/// Per-registry credentials loaded from a dockerconfig file.
#[derive(Debug, Default)]
pub struct CredentialStore {
    auths: HashMap<String, Credentials>,
}

impl CredentialStore {
    /// A store with no entries; every lookup is anonymous.
    pub fn empty() -> Self {
        CredentialStore::default()
    }

    /// Load a dockerconfig-style JSON file.
    ///
    /// Entries that cannot be decoded are an error rather than silently
    /// anonymous: a caller that supplies a credentials file expects it to
    /// be used.
    pub fn load(path: &Path) -> Result<Self> {
        let failed = |reason: String| Error::Config {
            path: path.to_path_buf(),
            reason,
        };

        let data = std::fs::read(path).map_err(|e| failed(e.to_string()))?;
        let config: DockerConfig =
            serde_json::from_slice(&data).map_err(|e| failed(e.to_string()))?;

        let mut auths = HashMap::new();
        for (registry, entry) in config.auths {
            let credentials = match entry {
                DockerAuth {
                    username: Some(user),
                    password: Some(pass),
                    ..
                } => Credentials::basic(user, pass),
                DockerAuth {
                    auth: Some(blob), ..
                } => {
                    let decoded = BASE64
                        .decode(blob.trim())
                        .map_err(|e| failed(format!("auth entry for {registry}: {e}")))?;
                    let decoded = String::from_utf8(decoded)
                        .map_err(|_| failed(format!("auth entry for {registry}: not UTF-8")))?;
                    let Some((user, pass)) = decoded.split_once(':') else {
                        return Err(failed(format!(
                            "auth entry for {registry}: missing ':' separator"
                        )));
                    };
                    Credentials::basic(user, pass)
                }
                _ => continue,
            };
            auths.insert(normalize_registry(&registry), credentials);
        }

        debug!("loaded credentials for {} registries", auths.len());
        Ok(CredentialStore { auths })
    }

    /// Credentials for a registry host, anonymous when there is no entry.
    pub fn credentials_for(&self, registry: &str) -> Credentials {
        self.auths
            .get(&normalize_registry(registry))
            .cloned()
            .unwrap_or_default()
    }
}

/// Dockerconfig keys sometimes carry a scheme or trailing path; reduce
/// them to the bare host[:port] used for lookup.
fn normalize_registry(registry: &str) -> String {
    let host = registry
        .strip_prefix("https://")
        .or_else(|| registry.strip_prefix("http://"))
        .unwrap_or(registry);
    host.split('/').next().unwrap_or(host).to_string()
}

#[cfg(test)]
mod test {
    use super::*;

    fn write_config(json: &str) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), json).unwrap();
        file
    }

    #[test]
    fn test_load_base64_auth() {
        let blob = BASE64.encode("user:sekrit");
        let file = write_config(&format!(
            r#"{{"auths": {{"registry.example": {{"auth": "{blob}"}}}}}}"#
        ));
        let store = CredentialStore::load(file.path()).unwrap();
        assert_eq!(
            store.credentials_for("registry.example"),
            Credentials::basic("user", "sekrit")
        );
    }

    #[test]
    fn test_load_username_password() {
        let file = write_config(
            r#"{"auths": {"quay.io": {"username": "bob", "password": "hunter2"}}}"#,
        );
        let store = CredentialStore::load(file.path()).unwrap();
        assert_eq!(
            store.credentials_for("quay.io"),
            Credentials::basic("bob", "hunter2")
        );
    }

    #[test]
    fn test_lookup_normalizes_scheme() {
        let blob = BASE64.encode("u:p");
        let file = write_config(&format!(
            r#"{{"auths": {{"https://registry.example/v1/": {{"auth": "{blob}"}}}}}}"#
        ));
        let store = CredentialStore::load(file.path()).unwrap();
        assert_eq!(
            store.credentials_for("registry.example"),
            Credentials::basic("u", "p")
        );
    }

    #[test]
    fn test_unknown_registry_is_anonymous() {
        let store = CredentialStore::empty();
        assert_eq!(
            store.credentials_for("registry.example"),
            Credentials::anonymous()
        );
        assert!(Credentials::anonymous().as_basic().is_none());
    }

    #[test]
    fn test_bad_auth_blob_is_an_error() {
        let file = write_config(r#"{"auths": {"registry.example": {"auth": "%%%"}}}"#);
        assert!(matches!(
            CredentialStore::load(file.path()),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = CredentialStore::load(Path::new("/nonexistent/dockerconfig.json"));
        assert!(matches!(result, Err(Error::Config { .. })));
    }
}
