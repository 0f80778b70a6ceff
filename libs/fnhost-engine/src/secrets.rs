use std::collections::BTreeMap;

/// Resolves a secret from the path configured for it in the function's
/// secrets map.
pub trait SecretsProvider: Send + Sync {
    fn provide_secret(&self, name: &str, path: &str) -> Option<String>;
}

/// The configured path is the secret value itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClearTextSecretsProvider;

impl SecretsProvider for ClearTextSecretsProvider {
    fn provide_secret(&self, _name: &str, path: &str) -> Option<String> {
        Some(path.to_string())
    }
}

/// The configured path names an environment variable holding the secret.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvironmentSecretsProvider;

impl SecretsProvider for EnvironmentSecretsProvider {
    fn provide_secret(&self, _name: &str, path: &str) -> Option<String> {
        std::env::var(path).ok()
    }
}

/// Look up `name` in `secrets` and resolve it through `provider`.
pub(crate) fn resolve(
    provider: &dyn SecretsProvider,
    secrets: &BTreeMap<String, String>,
    name: &str,
) -> Option<String> {
    let path = secrets.get(name)?;
    provider.provide_secret(name, path)
}
