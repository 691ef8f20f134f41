//! Remote signing server client.
//!
//! The server holds the device-bridge private key and signs authentication
//! tokens on request:
//!
//! ```text
//! POST <url>   {"token": "<base64>"}
//! 200          {"signature": "<base64>"}
//! ```
//!
//! Requests fail fast: one attempt, short timeout, no retry. Any failure is
//! reported as `AuthorizationFailed`.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const SIGN_TIMEOUT: Duration = Duration::from_secs(10);
/// Length of the bridge's authentication token.
const TOKEN_LEN: usize = 20;

#[derive(Serialize)]
struct SignRequest<'a> {
    token: &'a str,
}

#[derive(Deserialize)]
struct SignResponse {
    signature: String,
}

#[derive(Debug, Clone)]
pub struct RemoteSigner {
    client: Client,
    url: Url,
}

impl RemoteSigner {
    pub fn new(client: Client, url: &str) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| Error::InvalidInput(format!("invalid signing server URL '{url}': {e}")))?;
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Sign an authentication token.
    pub async fn sign(&self, token: &[u8]) -> Result<Vec<u8>> {
        let encoded = STANDARD.encode(token);
        let resp = self
            .client
            .post(self.url.clone())
            .timeout(SIGN_TIMEOUT)
            .json(&SignRequest { token: &encoded })
            .send()
            .await
            .map_err(|e| {
                Error::AuthorizationFailed(format!("signing server {} unreachable: {e}", self.url))
            })?;

        if !resp.status().is_success() {
            return Err(Error::AuthorizationFailed(format!(
                "signing server {} answered HTTP {}",
                self.url,
                resp.status()
            )));
        }

        let body: SignResponse = resp.json().await.map_err(|e| {
            Error::AuthorizationFailed(format!("signing server {} sent a bad response: {e}", self.url))
        })?;
        let signature = STANDARD.decode(body.signature.trim()).map_err(|e| {
            Error::AuthorizationFailed(format!("signing server {} sent a bad signature: {e}", self.url))
        })?;
        if signature.is_empty() {
            return Err(Error::AuthorizationFailed(format!(
                "signing server {} returned an empty signature",
                self.url
            )));
        }
        Ok(signature)
    }

    /// Check the server answers a random challenge.
    pub async fn probe(&self) -> Result<()> {
        let mut nonce = [0u8; TOKEN_LEN];
        rand::rng().fill_bytes(&mut nonce);
        self.sign(&nonce).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    #[tokio::test]
    async fn test_probe_signs_random_token() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/sign")
            .match_body(Matcher::Regex(r#""token":"[A-Za-z0-9+/=]+""#.into()))
            .with_status(200)
            .with_body(r#"{"signature":"c2lnbmVk"}"#)
            .expect(1)
            .create_async()
            .await;

        let signer = RemoteSigner::new(Client::new(), &format!("{}/sign", server.url())).unwrap();
        signer.probe().await.unwrap();
        assert_eq!(signer.sign(b"abc").await.unwrap(), b"signed");
        mock.expect(2).assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_fails_without_retry() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/sign")
            .with_status(500)
            .expect(1)
            .create_async()
            .await;

        let signer = RemoteSigner::new(Client::new(), &format!("{}/sign", server.url())).unwrap();
        let err = signer.probe().await.unwrap_err();
        assert!(matches!(err, Error::AuthorizationFailed(_)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unreachable_server_is_authorization_failure() {
        // Port 9 (discard) on localhost is not expected to be listening.
        let signer = RemoteSigner::new(Client::new(), "http://127.0.0.1:9/sign").unwrap();
        let err = signer.probe().await.unwrap_err();
        assert!(matches!(err, Error::AuthorizationFailed(ref m) if m.contains("unreachable")));
    }
}
