//! The identity-provider seam.
//!
//! The web login flow itself is an external collaborator: the wallet only
//! needs a redirect URL to start it and a code exchange to collect the
//! attributes the identity provider vouches for. Result is `anyhow` at this
//! seam, matching the other external provider traits.

use std::future::Future;

use attesta_mdoc::issuer::UnsignedAttributes;
use url::Url;

pub type Result<T> = anyhow::Result<T>;

/// An identity provider that authenticates the user out-of-band and returns
/// the attributes to issue.
pub trait AuthorizationClient: Send + Sync {
    /// Start a login, returning the URL to redirect the user to.
    fn begin_login(&self) -> impl Future<Output = Result<Url>> + Send;

    /// Exchange the authorization code for the user's attributes.
    fn exchange_code(
        &self, code: &str,
    ) -> impl Future<Output = Result<UnsignedAttributes>> + Send;
}

/// An identity provider that accepts any code and returns a fixed attribute
/// set. For tests and local development.
pub struct PresetAuthorizationClient {
    redirect: Url,
    attributes: UnsignedAttributes,
}

impl PresetAuthorizationClient {
    #[must_use]
    pub fn new(redirect: Url, attributes: UnsignedAttributes) -> Self {
        Self { redirect, attributes }
    }
}

impl AuthorizationClient for PresetAuthorizationClient {
    async fn begin_login(&self) -> Result<Url> {
        Ok(self.redirect.clone())
    }

    async fn exchange_code(&self, _code: &str) -> Result<UnsignedAttributes> {
        Ok(self.attributes.clone())
    }
}
