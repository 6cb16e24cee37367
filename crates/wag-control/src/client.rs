//! Control socket client.
//!
//! One HTTP/1.1 exchange per call over a fresh unix stream connection;
//! call volume is a human at a terminal.

use std::path::PathBuf;

use http_body_util::BodyExt;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header;
use hyper::Method;
use hyper::Request;
use hyper::StatusCode;
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::net::UnixStream;
use wag_core::Device;
use wag_core::RegistrationToken;
use wag_core::User;
use wag_reconciler::RuleRecord;
use wag_reconciler::SessionRecord;

use crate::server::TokenRequest;

#[derive(Debug, Error)]
pub enum ControlClientError {
    #[error("unable to reach the control socket at {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("control socket request failed: {0}")]
    Transport(String),

    /// The server answered with a non-2xx status; the body carries the
    /// human-readable reason.
    #[error("{message}")]
    Server { status: StatusCode, message: String },

    #[error("unable to decode control socket response: {0}")]
    Decode(String),
}

/// Client for the daemon's control socket.
pub struct ControlClient {
    path: PathBuf,
}

impl ControlClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn list_users(&self, username: Option<&str>) -> Result<Vec<User>, ControlClientError> {
        self.get_json(&with_filter("/users/list", username)).await
    }

    pub async fn delete_user(&self, username: &str) -> Result<(), ControlClientError> {
        self.post_form("/users/delete", &[("username", username)]).await
    }

    pub async fn lock_user(&self, username: &str) -> Result<(), ControlClientError> {
        self.post_form("/users/lock", &[("username", username)]).await
    }

    pub async fn unlock_user(&self, username: &str) -> Result<(), ControlClientError> {
        self.post_form("/users/unlock", &[("username", username)]).await
    }

    pub async fn reset_user_mfa(&self, username: &str) -> Result<(), ControlClientError> {
        self.post_form("/users/reset-mfa", &[("username", username)]).await
    }

    pub async fn list_devices(&self, username: Option<&str>) -> Result<Vec<Device>, ControlClientError> {
        self.get_json(&with_filter("/device/list", username)).await
    }

    pub async fn delete_device(&self, address: &str) -> Result<(), ControlClientError> {
        self.post_form("/device/delete", &[("address", address)]).await
    }

    pub async fn block_device(&self, address: &str) -> Result<(), ControlClientError> {
        self.post_form("/device/block", &[("address", address)]).await
    }

    pub async fn sessions(&self) -> Result<Vec<SessionRecord>, ControlClientError> {
        self.get_json("/device/sessions").await
    }

    pub async fn firewall_rules(&self) -> Result<Vec<RuleRecord>, ControlClientError> {
        self.get_json("/firewall/list").await
    }

    pub async fn list_tokens(&self) -> Result<Vec<RegistrationToken>, ControlClientError> {
        self.get_json("/tokens/list").await
    }

    pub async fn add_token(&self, request: &TokenRequest) -> Result<RegistrationToken, ControlClientError> {
        let body = serde_json::to_vec(request).map_err(|err| ControlClientError::Decode(err.to_string()))?;
        let (status, bytes) = self.exchange(Method::POST, "/tokens/add", "application/json", Bytes::from(body)).await?;
        decode_response(status, &bytes)
    }

    pub async fn delete_token(&self, token: &str) -> Result<(), ControlClientError> {
        self.post_form("/tokens/delete", &[("token", token)]).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ControlClientError> {
        let (status, bytes) = self.exchange(Method::GET, path, "", Bytes::new()).await?;
        decode_response(status, &bytes)
    }

    async fn post_form(&self, path: &str, fields: &[(&str, &str)]) -> Result<(), ControlClientError> {
        let body = fields
            .iter()
            .map(|(name, value)| format!("{name}={}", form_encode(value)))
            .collect::<Vec<_>>()
            .join("&");
        let (status, bytes) = self
            .exchange(Method::POST, path, "application/x-www-form-urlencoded", Bytes::from(body))
            .await?;
        if status.is_success() {
            Ok(())
        } else {
            Err(server_error(status, &bytes))
        }
    }

    async fn exchange(
        &self,
        method: Method,
        path: &str,
        content_type: &str,
        body: Bytes,
    ) -> Result<(StatusCode, Bytes), ControlClientError> {
        let stream = UnixStream::connect(&self.path).await.map_err(|source| ControlClientError::Connect {
            path: self.path.clone(),
            source,
        })?;

        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|err| ControlClientError::Transport(err.to_string()))?;
        tokio::spawn(connection);

        let mut request = Request::builder().method(method).uri(path).header(header::HOST, "wagd");
        if !content_type.is_empty() {
            request = request.header(header::CONTENT_TYPE, content_type);
        }
        let request = request
            .body(Full::new(body))
            .map_err(|err| ControlClientError::Transport(err.to_string()))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|err| ControlClientError::Transport(err.to_string()))?;
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|err| ControlClientError::Transport(err.to_string()))?
            .to_bytes();
        Ok((status, bytes))
    }
}

fn with_filter(path: &str, username: Option<&str>) -> String {
    match username {
        Some(username) => format!("{path}?username={}", form_encode(username)),
        None => path.to_string(),
    }
}

fn decode_response<T: DeserializeOwned>(status: StatusCode, bytes: &Bytes) -> Result<T, ControlClientError> {
    if !status.is_success() {
        return Err(server_error(status, bytes));
    }
    serde_json::from_slice(bytes).map_err(|err| ControlClientError::Decode(err.to_string()))
}

fn server_error(status: StatusCode, bytes: &Bytes) -> ControlClientError {
    ControlClientError::Server {
        status,
        message: String::from_utf8_lossy(bytes).to_string(),
    }
}

/// Percent-encode a form value. Addresses, usernames, and tokens are
/// mostly plain, so this only escapes what HTTP forms require.
fn form_encode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char);
            }
            b' ' => encoded.push('+'),
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn form_encoding_escapes_reserved_bytes() {
        assert_eq!(form_encode("10.0.0.5"), "10.0.0.5");
        assert_eq!(form_encode("KA=="), "KA%3D%3D");
        assert_eq!(form_encode("two words"), "two+words");
    }
}
