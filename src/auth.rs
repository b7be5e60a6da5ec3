//! Login and logout.

use serde::{Deserialize, Serialize};

use crate::credentials::{Claims, Credential};
use crate::error::Result;
use crate::gateway::Gateway;
use crate::transport::ApiRequest;

/// Credentials a member logs in with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    /// Organization the member belongs to.
    pub organization: String,
}

impl LoginRequest {
    pub fn new(
        email: impl Into<String>,
        password: impl Into<String>,
        organization: impl Into<String>,
    ) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            organization: organization.into(),
        }
    }
}

/// Token pair returned by login and renewal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl Gateway {
    /// Log in and make the returned token pair the live credential.
    pub async fn login(&self, request: &LoginRequest) -> Result<Credential> {
        let tokens: TokenResponse = self
            .call_json(ApiRequest::post("login").json(request)?)
            .await?;
        let credential = self
            .credentials()
            .set(tokens.access_token, tokens.refresh_token);
        tracing::info!(
            user = credential.claims.as_ref().map(|c| c.id.as_str()).unwrap_or("unknown"),
            "logged in"
        );
        Ok(credential)
    }

    /// Tell the server to revoke the refresh token, then forget the credential locally.
    ///
    /// The server call is best-effort: its failure is logged and the local logout happens
    /// regardless.
    pub async fn logout(&self) {
        if let Some(refresh_token) = self.credentials().refresh_token() {
            let request = ApiRequest::post("logout")
                .json(&serde_json::json!({ "refresh_token": refresh_token }));
            let result = match request {
                Ok(request) => self.call(request).await.map(|_| ()),
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                tracing::warn!(error = %err, "server-side logout failed");
            }
        }
        self.credentials().clear();
        tracing::info!("logged out");
    }

    /// Claims of the logged-in member, for UI gating.
    pub fn claims(&self) -> Option<Claims> {
        self.credentials().claims()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use reqwest::StatusCode;
    use serde_json::json;

    use super::*;
    use crate::config::ClientConfig;
    use crate::credentials::CredentialStore;
    use crate::credentials::tests::token_for;
    use crate::error::Error;
    use crate::gateway::LocationTracker;
    use crate::transport::{ApiResponse, StreamResponse, Transport};

    struct AuthServer {
        logout_status: StatusCode,
        seen: Mutex<Vec<ApiRequest>>,
    }

    #[async_trait]
    impl Transport for AuthServer {
        async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse> {
            self.seen.lock().unwrap().push(request.clone());
            Ok(match request.path.as_str() {
                "login" => ApiResponse::json_body(
                    StatusCode::OK,
                    &json!({
                        "access_token": token_for("u1", "OWNER"),
                        "refresh_token": "r1",
                        "expires_in": 900,
                        "token_type": "Bearer"
                    }),
                ),
                "logout" => ApiResponse::json_body(self.logout_status, &json!({})),
                _ => ApiResponse::new(StatusCode::NOT_FOUND, ""),
            })
        }

        async fn open_stream(&self, _: &ApiRequest) -> Result<StreamResponse> {
            Err(Error::connection("unused", None))
        }
    }

    fn gateway(logout_status: StatusCode) -> (Gateway, Arc<AuthServer>) {
        let server = Arc::new(AuthServer {
            logout_status,
            seen: Mutex::new(Vec::new()),
        });
        let gateway = Gateway::new(
            ClientConfig::new(),
            server.clone(),
            CredentialStore::in_memory(),
            Arc::new(LocationTracker::new("/login")),
        );
        (gateway, server)
    }

    #[tokio::test]
    async fn login_stores_credential_and_claims() {
        let (gateway, server) = gateway(StatusCode::OK);
        let credential = gateway
            .login(&LoginRequest::new("ada@example.com", "pw", "acme"))
            .await
            .unwrap();
        assert_eq!(credential.refresh_token.as_deref(), Some("r1"));
        assert_eq!(gateway.claims().map(|c| c.id), Some("u1".to_string()));
        let seen = server.seen.lock().unwrap();
        assert_eq!(
            seen[0].body,
            Some(json!({"email": "ada@example.com", "password": "pw", "organization": "acme"}))
        );
    }

    #[tokio::test]
    async fn logout_clears_even_when_server_fails() {
        let (gateway, server) = gateway(StatusCode::INTERNAL_SERVER_ERROR);
        gateway.credentials().set("a", Some("r1".to_string()));
        gateway.logout().await;
        assert!(!gateway.credentials().is_authenticated());
        let seen = server.seen.lock().unwrap();
        assert_eq!(seen[0].path, "logout");
        assert_eq!(seen[0].body, Some(json!({"refresh_token": "r1"})));
    }

    #[tokio::test]
    async fn logout_without_credential_skips_server() {
        let (gateway, server) = gateway(StatusCode::OK);
        gateway.logout().await;
        assert!(server.seen.lock().unwrap().is_empty());
    }
}
