use zeroize::{Zeroize, ZeroizeOnDrop};

/**
 * Credentials for an authenticated socket connection.
 *
 * The secret half is zeroized on drop; the exchange-specific signing
 * scheme that consumes it lives behind [`super::Authenticator`], not here.
 */
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
    secret: SecretBytes,
}

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct SecretBytes(String);

impl Credentials {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            secret: SecretBytes(secret.into()),
        }
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn secret(&self) -> &str {
        &self.secret.0
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("secret", &"<redacted>")
            .finish()
    }
}
