use std::collections::HashMap;

use base64::{engine::general_purpose, Engine as _};
use docker_credential::DockerCredential;
use oci_distribution::secrets::RegistryAuth;
use serde::Deserialize;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Error deserializing JSON: {0}")]
    Deserializing(#[from] serde_json::Error),

    #[error("Error decoding base64 field inside docker config auth section: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("Error decoding content of base64 field inside docker config auth section: {0}")]
    FromUtf8(#[from] std::string::FromUtf8Error),

    #[error("Missing colon in auth field")]
    MissingColon,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Resolves registry credentials keyed by registry host.
///
/// `bundles::map` resolves the source registry once and the destination
/// registry only when it differs, so implementations must be cheap to call
/// but should not assume any particular call count.
pub trait CredentialResolver: Send + Sync {
    fn resolve(&self, registry: &str) -> crate::Result<RegistryAuth>;
}

/// The content of a `~/.docker/config.json` file, which is also the payload
/// of a `kubernetes.io/dockerconfigjson` secret.
#[derive(Clone, Deserialize)]
pub struct DockerConfig {
    auths: HashMap<String, DockerCredentials>,
}

#[derive(Clone, Deserialize)]
#[serde(untagged)]
pub enum DockerCredentials {
    Split { username: String, password: String },
    Composite { auth: String },
}

impl DockerConfig {
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Auth for a registry host; registries absent from the config fall back
    /// to anonymous access, matching the docker client.
    pub fn get_auth(&self, registry: &str) -> Result<RegistryAuth> {
        Ok(match self.auths.get(registry) {
            None => RegistryAuth::Anonymous,
            Some(credentials) => {
                let (username, password) = credentials.unpack()?;
                RegistryAuth::Basic(username, password)
            }
        })
    }
}

impl DockerCredentials {
    fn unpack(&self) -> Result<(String, String)> {
        Ok(match self.clone() {
            DockerCredentials::Split { username, password } => (username, password),

            DockerCredentials::Composite { auth } => {
                String::from_utf8(general_purpose::STANDARD.decode(auth)?)?
                    .split_once(':')
                    .map(|(a, b)| (a.to_string(), b.to_string()))
                    .ok_or(Error::MissingColon)?
            }
        })
    }
}

impl std::fmt::Debug for DockerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerConfig")
            .field("auths", &"<redacted>")
            .finish()
    }
}

/// Resolves credentials through the local docker credential helpers,
/// the way `docker push` itself would.
pub struct Keychain;

impl CredentialResolver for Keychain {
    fn resolve(&self, registry: &str) -> crate::Result<RegistryAuth> {
        match docker_credential::get_credential(registry) {
            Ok(DockerCredential::UsernamePassword(username, password)) => {
                Ok(RegistryAuth::Basic(username, password))
            }
            Ok(DockerCredential::IdentityToken(_)) => Err(crate::Error::UnsupportedCredentialType(
                registry.to_string(),
            )),
            // No configured helper or no stored credential: anonymous.
            Err(_) => Ok(RegistryAuth::Anonymous),
        }
    }
}

/// Renders a single-registry `dockerconfigjson` document, used when
/// provisioning the temporary registry-credential secret for `--as=me`.
pub fn dockerconfigjson_for(registry: &str, username: &str, password: &str) -> String {
    let auth = general_purpose::STANDARD.encode(format!("{username}:{password}"));
    serde_json::json!({
        "auths": {
            registry: { "auth": auth }
        }
    })
    .to_string()
}
