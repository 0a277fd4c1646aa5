//! HTTP client for the custody ledger API.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client as HttpClient, Method, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, warn};

use super::{AccountBalance, CustodyLedger, LedgerEntry, LedgerError};
use crate::config::LedgerConfig;
use crate::signature;

/// HttpCustodyLedger talks to the custody provider over signed JSON requests.
///
/// Signature: hex HMAC-SHA256 of `{timestamp}\n{METHOD}\n{path}\n{body}`
/// sent in `X-Signature` with `X-Api-Key` and `X-Timestamp`.
pub struct HttpCustodyLedger {
    base_url: String,
    api_key: String,
    api_secret: String,
    http_client: HttpClient,
}

#[derive(Deserialize)]
struct ErrorResponse {
    code: Option<String>,
    message: Option<String>,
    available: Option<Decimal>,
}

#[derive(Deserialize)]
struct HoldResponse {
    hold_id: String,
}

#[derive(Deserialize)]
struct ReleaseResponse {
    released: Decimal,
}

#[derive(Deserialize)]
struct WithdrawalResponse {
    tx_hash: Option<String>,
}

impl HttpCustodyLedger {
    pub fn from_config(config: &LedgerConfig) -> Result<Self, LedgerError> {
        let http_client = HttpClient::builder().timeout(config.timeout()).build()?;

        Ok(Self {
            base_url: config
                .base_url
                .clone()
                .unwrap_or_default()
                .trim_end_matches('/')
                .to_string(),
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            http_client,
        })
    }

    fn headers(&self, method: &Method, path: &str, body: &str) -> Result<HeaderMap, LedgerError> {
        let timestamp = chrono::Utc::now().timestamp_millis().to_string();
        let payload = format!("{}\n{}\n{}\n{}", timestamp, method.as_str(), path, body);
        let signature = signature::sign(&self.api_secret, payload.as_bytes());

        let mut headers = HeaderMap::new();
        headers.insert("X-Api-Key", header_value(&self.api_key)?);
        headers.insert("X-Timestamp", header_value(&timestamp)?);
        headers.insert("X-Signature", header_value(&signature)?);
        Ok(headers)
    }

    /// Sends a signed request. Returns None on 404 so callers can map it.
    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Option<T>, LedgerError> {
        let body = match body {
            Some(value) => serde_json::to_string(&value)?,
            None => String::new(),
        };
        let url = format!("{}{}", self.base_url, path);

        let mut request = self
            .http_client
            .request(method.clone(), &url)
            .headers(self.headers(&method, path, &body)?);
        if !body.is_empty() {
            request = request
                .header("Content-Type", "application/json")
                .body(body);
        }

        debug!(method = %method, path, "sending ledger request");

        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(parse_error_response(status, &bytes));
        }
        if bytes.is_empty() {
            return Ok(Some(serde_json::from_value(serde_json::Value::Null)?));
        }
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

fn header_value(value: &str) -> Result<HeaderValue, LedgerError> {
    HeaderValue::from_str(value)
        .map_err(|e| LedgerError::Rejected(format!("invalid header value: {}", e)))
}

/// Maps an error response onto the ledger error taxonomy.
fn parse_error_response(status: StatusCode, body: &[u8]) -> LedgerError {
    let parsed = serde_json::from_slice::<ErrorResponse>(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|r| r.message.clone())
        .unwrap_or_else(|| String::from_utf8_lossy(body).to_string());
    let code = parsed.as_ref().and_then(|r| r.code.clone()).unwrap_or_default();

    warn!(status = status.as_u16(), code = %code, message = %message, "ledger api error");

    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return LedgerError::Transient(format!("{}: {}", status, message));
    }

    match code.as_str() {
        "insufficient_funds" => LedgerError::InsufficientFunds {
            account: String::new(),
            requested: Decimal::ZERO,
            available: parsed.and_then(|r| r.available).unwrap_or_default(),
        },
        "hold_exhausted" => LedgerError::HoldExhausted {
            hold_id: String::new(),
            requested: Decimal::ZERO,
            remaining: parsed.and_then(|r| r.available).unwrap_or_default(),
        },
        _ => LedgerError::Rejected(format!("{}: {}", status, message)),
    }
}

#[async_trait]
impl CustodyLedger for HttpCustodyLedger {
    async fn balance(&self, account_id: &str) -> Result<AccountBalance, LedgerError> {
        let path = format!("/v1/accounts/{}/balance", account_id);
        self.request(Method::GET, &path, None)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.to_string()))
    }

    async fn escrow(
        &self,
        account_id: &str,
        amount: Decimal,
        reference: &str,
    ) -> Result<String, LedgerError> {
        let body = json!({ "account_id": account_id, "amount": amount, "reference": reference });
        let resp: HoldResponse = self
            .request(Method::POST, "/v1/holds", Some(body))
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.to_string()))?;
        Ok(resp.hold_id)
    }

    async fn release_escrow(&self, hold_id: &str, reference: &str) -> Result<Decimal, LedgerError> {
        let path = format!("/v1/holds/{}/release", hold_id);
        let resp: ReleaseResponse = self
            .request(Method::POST, &path, Some(json!({ "reference": reference })))
            .await?
            .ok_or_else(|| LedgerError::HoldNotFound(hold_id.to_string()))?;
        Ok(resp.released)
    }

    async fn settle_escrow(
        &self,
        hold_id: &str,
        amount: Decimal,
        recipient_id: &str,
        reference: &str,
    ) -> Result<(), LedgerError> {
        let path = format!("/v1/holds/{}/settle", hold_id);
        let body = json!({
            "amount": amount,
            "recipient_account_id": recipient_id,
            "reference": reference,
        });
        self.request::<serde_json::Value>(Method::POST, &path, Some(body))
            .await?
            .ok_or_else(|| LedgerError::HoldNotFound(hold_id.to_string()))?;
        Ok(())
    }

    async fn transfer(
        &self,
        from_id: &str,
        to_id: &str,
        amount: Decimal,
        reference: &str,
    ) -> Result<(), LedgerError> {
        let body = json!({
            "from_account_id": from_id,
            "to_account_id": to_id,
            "amount": amount,
            "reference": reference,
        });
        self.request::<serde_json::Value>(Method::POST, "/v1/transfers", Some(body))
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(format!("{} or {}", from_id, to_id)))?;
        Ok(())
    }

    async fn credit(
        &self,
        account_id: &str,
        amount: Decimal,
        reference: &str,
    ) -> Result<(), LedgerError> {
        let path = format!("/v1/accounts/{}/credit", account_id);
        let body = json!({ "amount": amount, "reference": reference });
        self.request::<serde_json::Value>(Method::POST, &path, Some(body))
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.to_string()))?;
        Ok(())
    }

    async fn debit(
        &self,
        account_id: &str,
        amount: Decimal,
        reference: &str,
    ) -> Result<(), LedgerError> {
        let path = format!("/v1/accounts/{}/debit", account_id);
        let body = json!({ "amount": amount, "reference": reference });
        self.request::<serde_json::Value>(Method::POST, &path, Some(body))
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.to_string()))?;
        Ok(())
    }

    async fn withdraw(
        &self,
        account_id: &str,
        amount: Decimal,
        address: &str,
        network: Option<&str>,
        reference: &str,
    ) -> Result<Option<String>, LedgerError> {
        let path = format!("/v1/accounts/{}/withdrawals", account_id);
        let body = json!({
            "amount": amount,
            "address": address,
            "network": network,
            "reference": reference,
        });
        let resp: WithdrawalResponse = self
            .request(Method::POST, &path, Some(body))
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(account_id.to_string()))?;
        Ok(resp.tx_hash)
    }

    async fn lookup(&self, reference: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        let path = format!("/v1/entries/{}", reference);
        self.request(Method::GET, &path, None).await
    }
}
