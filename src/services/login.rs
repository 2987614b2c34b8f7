//! Login gateway: the authentication operations carried over the RPC bus.
//!
//! [`LoginClient`] is what an HTTP front end calls; [`serve_login`] wires a [`LoginService`]
//! implementation to one handler loop per operation. Password hashing, token issuance and
//! persistence belong to the service implementation.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span};

use crate::broker::Connector;
use crate::codec::{Codec, JsonCodec};
use crate::correlation::CorrelationId;
use crate::rpcbus::{Request, RpcClient, RpcError, RpcServer};
use crate::topic::{Topic, topics};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupParams {
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigninParams {
    pub email: String,
    pub password: String,
}

/// Identifies an account awaiting activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAndTokenParams {
    pub email: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTokenParams {
    pub token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserState {
    Valid,
    Initializing,
    Activating,
    Archived,
}

/// A user account as exposed to callers. Never carries the password hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub uuid: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(rename = "access-token", default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(rename = "activation-token", default, skip_serializing_if = "Option::is_none")]
    pub activation_token: Option<String>,
    #[serde(rename = "initialization-token", default, skip_serializing_if = "Option::is_none")]
    pub initialization_token: Option<String>,
    pub state: UserState,
}

/// Business failures of the login service. Only their message crosses the bus.
#[derive(Debug, Error)]
pub enum LoginError {
    #[error("cannot find user with email {0}")]
    UnknownEmail(String),

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("invalid or expired token")]
    InvalidToken,

    #[error("user already exists: {0}")]
    AlreadyExists(String),

    #[error("{0}")]
    Internal(String),
}

/// Business side of the login operations.
///
/// The correlation id of the request is passed along so implementations can tag their own
/// records and logs with it.
#[async_trait]
pub trait LoginService: Send + Sync + 'static {
    async fn signup(&self, id: CorrelationId, params: SignupParams) -> Result<User, LoginError>;

    async fn check_activate(
        &self,
        id: CorrelationId,
        params: EmailAndTokenParams,
    ) -> Result<(), LoginError>;

    async fn activate(
        &self,
        id: CorrelationId,
        params: EmailAndTokenParams,
    ) -> Result<(), LoginError>;

    async fn signin(&self, id: CorrelationId, params: SigninParams) -> Result<User, LoginError>;

    async fn me(&self, id: CorrelationId, params: AccessTokenParams) -> Result<User, LoginError>;

    async fn logout(&self, id: CorrelationId, params: AccessTokenParams) -> Result<(), LoginError>;
}

/// Serve every login operation with `service` until the server shuts down or a loop fails.
pub async fn serve_login<C, K, S>(server: &RpcServer<C, K>, service: Arc<S>) -> Result<(), RpcError>
where
    C: Connector,
    K: Codec,
    S: LoginService,
{
    info!("Serving login operations");

    let signup = {
        let service = Arc::clone(&service);
        server.handle(topics::LOGIN_SIGNUP, move |id, params: SignupParams| {
            let service = Arc::clone(&service);
            async move { service.signup(id, params).await }
        })
    };
    let check_activate = {
        let service = Arc::clone(&service);
        server.handle(topics::LOGIN_CHECK_ACTIVATE, move |id, params: EmailAndTokenParams| {
            let service = Arc::clone(&service);
            async move { service.check_activate(id, params).await }
        })
    };
    let activate = {
        let service = Arc::clone(&service);
        server.handle(topics::LOGIN_ACTIVATE, move |id, params: EmailAndTokenParams| {
            let service = Arc::clone(&service);
            async move { service.activate(id, params).await }
        })
    };
    let signin = {
        let service = Arc::clone(&service);
        server.handle(topics::LOGIN_SIGNIN, move |id, params: SigninParams| {
            let service = Arc::clone(&service);
            async move { service.signin(id, params).await }
        })
    };
    let me = {
        let service = Arc::clone(&service);
        server.handle(topics::LOGIN_ME, move |id, params: AccessTokenParams| {
            let service = Arc::clone(&service);
            async move { service.me(id, params).await }
        })
    };
    let logout = server.handle(topics::LOGIN_LOGOUT, move |id, params: AccessTokenParams| {
        let service = Arc::clone(&service);
        async move { service.logout(id, params).await }
    });

    tokio::try_join!(signup, check_activate, activate, signin, me, logout)?;
    Ok(())
}

/// Typed client for the login operations.
///
/// Every call is sent under a freshly generated correlation id. The `request_id` a caller passes
/// (typically the id of the inbound HTTP request) is only recorded on the `login_call` span, so
/// callers reusing one id for several calls still get each call's own reply.
pub struct LoginClient<C: Connector, K = JsonCodec> {
    client: RpcClient<C, K>,
}

impl<C: Connector, K: Codec> LoginClient<C, K> {
    pub fn new(client: RpcClient<C, K>) -> Self {
        Self { client }
    }

    pub async fn signup(
        &self,
        request_id: CorrelationId,
        cancel: &CancellationToken,
        params: SignupParams,
    ) -> Result<User, RpcError> {
        self.call(topics::LOGIN_SIGNUP, request_id, cancel, params)
            .await
    }

    pub async fn check_activate(
        &self,
        request_id: CorrelationId,
        cancel: &CancellationToken,
        params: EmailAndTokenParams,
    ) -> Result<(), RpcError> {
        self.call(topics::LOGIN_CHECK_ACTIVATE, request_id, cancel, params)
            .await
    }

    pub async fn activate(
        &self,
        request_id: CorrelationId,
        cancel: &CancellationToken,
        params: EmailAndTokenParams,
    ) -> Result<(), RpcError> {
        self.call(topics::LOGIN_ACTIVATE, request_id, cancel, params)
            .await
    }

    pub async fn signin(
        &self,
        request_id: CorrelationId,
        cancel: &CancellationToken,
        params: SigninParams,
    ) -> Result<User, RpcError> {
        self.call(topics::LOGIN_SIGNIN, request_id, cancel, params)
            .await
    }

    pub async fn me(
        &self,
        request_id: CorrelationId,
        cancel: &CancellationToken,
        token: impl Into<String>,
    ) -> Result<User, RpcError> {
        let params = AccessTokenParams {
            token: token.into(),
        };
        self.call(topics::LOGIN_ME, request_id, cancel, params)
            .await
    }

    pub async fn logout(
        &self,
        request_id: CorrelationId,
        cancel: &CancellationToken,
        token: impl Into<String>,
    ) -> Result<(), RpcError> {
        let params = AccessTokenParams {
            token: token.into(),
        };
        self.call(topics::LOGIN_LOGOUT, request_id, cancel, params)
            .await
    }

    async fn call<P, R>(
        &self,
        topic: &'static str,
        request_id: CorrelationId,
        cancel: &CancellationToken,
        params: P,
    ) -> Result<R, RpcError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let request = Request::builder()
            .topic(Topic::from(topic))
            .params(params)
            .cancel(cancel.child_token())
            .build();

        let span = info_span!("login_call", request_id = %request_id);
        async { self.client.request(request).await?.decode() }
            .instrument(span)
            .await
    }
}
