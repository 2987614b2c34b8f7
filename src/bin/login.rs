use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use boxy_bus::services::login::{
    AccessTokenParams, EmailAndTokenParams, LoginClient, LoginError, LoginService, SigninParams,
    SignupParams, User, UserState, serve_login,
};
use boxy_bus::{BusConfig, CorrelationId, MemoryBroker, logging};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

struct Account {
    user: User,
    password: String,
}

/// Keeps accounts in memory and issues tokens derived from the request id.
#[derive(Default)]
struct DemoLogin {
    accounts: Mutex<HashMap<String, Account>>,
}

impl DemoLogin {
    fn accounts(&self) -> std::sync::MutexGuard<'_, HashMap<String, Account>> {
        self.accounts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl LoginService for DemoLogin {
    async fn signup(&self, id: CorrelationId, params: SignupParams) -> Result<User, LoginError> {
        let mut accounts = self.accounts();
        if accounts.contains_key(&params.email) {
            return Err(LoginError::AlreadyExists(params.email));
        }

        let user = User {
            uuid: id.to_string(),
            email: params.email.clone(),
            first_name: params.first_name,
            last_name: params.last_name,
            access_token: None,
            activation_token: Some(CorrelationId::generate().to_string()),
            initialization_token: None,
            state: UserState::Activating,
        };
        accounts.insert(
            params.email,
            Account {
                user: user.clone(),
                password: params.password,
            },
        );
        Ok(user)
    }

    async fn check_activate(
        &self,
        _id: CorrelationId,
        params: EmailAndTokenParams,
    ) -> Result<(), LoginError> {
        let accounts = self.accounts();
        let account = accounts
            .get(&params.email)
            .ok_or_else(|| LoginError::UnknownEmail(params.email.clone()))?;

        if account.user.activation_token.as_deref() != Some(params.token.as_str()) {
            return Err(LoginError::InvalidToken);
        }
        Ok(())
    }

    async fn activate(
        &self,
        id: CorrelationId,
        params: EmailAndTokenParams,
    ) -> Result<(), LoginError> {
        self.check_activate(id, params.clone()).await?;

        if let Some(account) = self.accounts().get_mut(&params.email) {
            account.user.state = UserState::Valid;
            account.user.activation_token = None;
        }
        Ok(())
    }

    async fn signin(&self, id: CorrelationId, params: SigninParams) -> Result<User, LoginError> {
        let mut accounts = self.accounts();
        let account = accounts
            .get_mut(&params.email)
            .ok_or_else(|| LoginError::UnknownEmail(params.email.clone()))?;

        if account.password != params.password || account.user.state != UserState::Valid {
            return Err(LoginError::InvalidCredentials);
        }

        account.user.access_token = Some(format!("token-{id}"));
        Ok(account.user.clone())
    }

    async fn me(&self, _id: CorrelationId, params: AccessTokenParams) -> Result<User, LoginError> {
        self.accounts()
            .values()
            .find(|a| a.user.access_token.as_deref() == Some(params.token.as_str()))
            .map(|a| a.user.clone())
            .ok_or(LoginError::InvalidToken)
    }

    async fn logout(
        &self,
        _id: CorrelationId,
        params: AccessTokenParams,
    ) -> Result<(), LoginError> {
        let mut accounts = self.accounts();
        let account = accounts
            .values_mut()
            .find(|a| a.user.access_token.as_deref() == Some(params.token.as_str()))
            .ok_or(LoginError::InvalidToken)?;

        account.user.access_token = None;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_from_env();
    let config = BusConfig::from_env()?;
    let email = std::env::var("LOGIN_EMAIL").unwrap_or_else(|_| "ada@example.com".to_string());

    let broker = MemoryBroker::new();
    let (client, server) = boxy_bus::connect(broker, &config);

    let serving = {
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_login(&server, Arc::new(DemoLogin::default())).await {
                error!("login handlers stopped: {e}");
            }
        })
    };

    let login = LoginClient::new(client);
    let cancel = CancellationToken::new();

    let user = login
        .signup(
            CorrelationId::generate(),
            &cancel,
            SignupParams {
                email: email.clone(),
                password: "correct horse".to_string(),
                first_name: "Ada".to_string(),
                last_name: "Lovelace".to_string(),
            },
        )
        .await?;
    info!(uuid = %user.uuid, email = %user.email, "Signed up");

    let activation = EmailAndTokenParams {
        email: email.clone(),
        token: user.activation_token.unwrap_or_default(),
    };
    login
        .check_activate(CorrelationId::generate(), &cancel, activation.clone())
        .await?;
    login
        .activate(CorrelationId::generate(), &cancel, activation)
        .await?;
    info!(email = %email, "Activated");

    let wrong = SigninParams {
        email: email.clone(),
        password: "wrong".to_string(),
    };
    if let Err(e) = login.signin(CorrelationId::generate(), &cancel, wrong).await {
        info!("Signin with a wrong password refused: {e}");
    }

    let signed_in = login
        .signin(
            CorrelationId::generate(),
            &cancel,
            SigninParams {
                email: email.clone(),
                password: "correct horse".to_string(),
            },
        )
        .await?;
    let token = signed_in.access_token.unwrap_or_default();
    info!(email = %signed_in.email, "Signed in");

    let me = login.me(CorrelationId::generate(), &cancel, token.clone()).await?;
    info!(uuid = %me.uuid, state = ?me.state, "Me");

    login.logout(CorrelationId::generate(), &cancel, token).await?;
    info!("Logged out");

    server.shutdown();
    serving.await?;

    Ok(())
}
