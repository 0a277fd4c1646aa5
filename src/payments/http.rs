//! HTTP client for the payment gateway.

use async_trait::async_trait;
use reqwest::{Client as HttpClient, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::{
    DepositInstructions, DepositRequest, PaymentError, PaymentGateway, PayoutReceipt,
    PayoutRequest, ResolvedAccount,
};
use crate::config::PaymentsConfig;

/// Gateway responses wrap their payload in `{ "status": bool, "message", "data" }`.
#[derive(Deserialize)]
struct Envelope<T> {
    status: bool,
    message: Option<String>,
    data: Option<T>,
}

/// HttpPaymentGateway authenticates with a bearer secret key.
pub struct HttpPaymentGateway {
    base_url: String,
    secret_key: String,
    http_client: HttpClient,
}

impl HttpPaymentGateway {
    pub fn from_config(config: &PaymentsConfig) -> Result<Self, PaymentError> {
        let http_client = HttpClient::builder().timeout(config.timeout()).build()?;

        Ok(Self {
            base_url: config
                .base_url
                .clone()
                .unwrap_or_default()
                .trim_end_matches('/')
                .to_string(),
            secret_key: config.secret_key.clone(),
            http_client,
        })
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        path: &str,
    ) -> Result<T, PaymentError> {
        debug!(path, "sending payment gateway request");

        let response = request.bearer_auth(&self.secret_key).send().await?;
        let status = response.status();
        let body = response.bytes().await?;

        let envelope = serde_json::from_slice::<Envelope<T>>(&body);
        match envelope {
            Ok(Envelope {
                status: true,
                data: Some(data),
                ..
            }) if status.is_success() => Ok(data),
            Ok(envelope) => Err(api_error(status, envelope.message, &body)),
            Err(_) if !status.is_success() => Err(api_error(status, None, &body)),
            Err(e) => Err(e.into()),
        }
    }
}

fn api_error(status: StatusCode, message: Option<String>, body: &[u8]) -> PaymentError {
    let message = message.unwrap_or_else(|| String::from_utf8_lossy(body).to_string());
    warn!(status = status.as_u16(), message = %message, "payment gateway error");
    PaymentError::Api {
        status: status.as_u16(),
        message,
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn initiate_deposit(
        &self,
        request: &DepositRequest,
    ) -> Result<DepositInstructions, PaymentError> {
        let path = "/deposits";
        let builder = self
            .http_client
            .post(format!("{}{}", self.base_url, path))
            .json(request);
        self.send(builder, path).await
    }

    async fn initiate_payout(&self, request: &PayoutRequest) -> Result<PayoutReceipt, PaymentError> {
        let path = "/payouts";
        let builder = self
            .http_client
            .post(format!("{}{}", self.base_url, path))
            .json(request);
        self.send(builder, path).await
    }

    async fn resolve_account(
        &self,
        bank_code: &str,
        account_number: &str,
    ) -> Result<ResolvedAccount, PaymentError> {
        let path = "/banks/resolve";
        let builder = self
            .http_client
            .get(format!("{}{}", self.base_url, path))
            .query(&[("bank_code", bank_code), ("account_number", account_number)]);

        match self.send(builder, path).await {
            Ok(account) => Ok(account),
            Err(PaymentError::Api { status, message }) if status < 500 => {
                Err(PaymentError::AccountNotResolved(message))
            }
            Err(e) => Err(e),
        }
    }
}
