//! Share link URLs of the form `<base_url>/share/<token>`

use crate::error::{KeywardError, Result};
use keyward_crypto::is_well_formed_token;

const SHARE_PATH: &str = "/share/";

/// Builds and parses public share URLs
#[derive(Clone, Debug)]
pub struct ShareLink {
    base_url: String,
}

impl ShareLink {
    /// Create a link builder; a trailing slash on `base_url` is ignored
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/');
        url::Url::parse(base_url)
            .map_err(|e| KeywardError::Config(format!("invalid share base URL: {}", e)))?;
        Ok(Self {
            base_url: base_url.to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Public URL for a token
    pub fn url_for(&self, token: &str) -> String {
        format!("{}{}{}", self.base_url, SHARE_PATH, token)
    }

    /// Extract and validate the token from a share URL
    pub fn parse(&self, share_url: &str) -> Result<String> {
        url::Url::parse(share_url)
            .map_err(|_| KeywardError::Validation("invalid share URL format".to_string()))?;

        let token = share_url
            .strip_prefix(&self.base_url)
            .and_then(|rest| rest.strip_prefix(SHARE_PATH))
            .ok_or_else(|| KeywardError::Validation("invalid share URL format".to_string()))?;
        if token.is_empty() {
            return Err(KeywardError::Validation(
                "share token missing from URL".to_string(),
            ));
        }
        validate_token(token)?;
        Ok(token.to_string())
    }
}

/// Reject anything that is not 64 hex characters
pub fn validate_token(token: &str) -> Result<()> {
    if token.is_empty() {
        return Err(KeywardError::Validation(
            "share token cannot be empty".to_string(),
        ));
    }
    if !is_well_formed_token(token) {
        return Err(KeywardError::Validation(
            "invalid share token format".to_string(),
        ));
    }
    Ok(())
}
