use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use uuid::Uuid;

use crate::domain::{Balance, CreditTransaction, ReservationId, TransactionFilter};

use super::{
    CreditsApi, DeductRequest, PurchaseRequest, PurchaseResponse, RemoteError, RemoteResult,
    ReservationRequest, ReserveRequest, ReserveResponse, SettlementResponse,
};

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

/// The transaction endpoint answers with a bare list or an envelope depending on version.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TransactionList {
    Bare(Vec<CreditTransaction>),
    Envelope { transactions: Vec<CreditTransaction> },
}

/// [`CreditsApi`] over the ledger's JSON REST endpoints.
#[derive(Debug, Clone)]
pub struct HttpCreditsApi {
    base_url: Url,
    token: Option<String>,
    http: reqwest::Client,
}

impl HttpCreditsApi {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let mut base = base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).with_context(|| format!("invalid base url '{}'", base_url))?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;

        Ok(Self {
            base_url,
            token,
            http,
        })
    }

    fn endpoint(&self, path: &str) -> RemoteResult<Url> {
        self.base_url
            .join(path)
            .map_err(|err| RemoteError::Validation(format!("invalid endpoint {}: {}", path, err)))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> RemoteResult<T> {
        let res = self
            .authorized(request)
            .send()
            .await
            .map_err(|err| RemoteError::Unavailable(err.to_string()))?;

        if res.status().is_success() {
            return res
                .json::<T>()
                .await
                .map_err(|err| RemoteError::Unavailable(format!("malformed response: {}", err)));
        }

        Err(Self::error_from(res).await)
    }

    async fn send_empty(&self, request: RequestBuilder) -> RemoteResult<()> {
        let res = self
            .authorized(request)
            .send()
            .await
            .map_err(|err| RemoteError::Unavailable(err.to_string()))?;

        if res.status().is_success() {
            return Ok(());
        }

        Err(Self::error_from(res).await)
    }

    async fn error_from(res: Response) -> RemoteError {
        let status = res.status();
        let body = res
            .json::<ErrorResponse>()
            .await
            .map(|err| err.error)
            .unwrap_or_else(|_| "unknown error".to_string());
        debug!(status = status.as_u16(), error = %body, "ledger request failed");

        match status {
            StatusCode::PAYMENT_REQUIRED => RemoteError::InsufficientCredits(body),
            StatusCode::NOT_FOUND => RemoteError::NotFound(body),
            StatusCode::CONFLICT => RemoteError::Conflict(body),
            StatusCode::GONE => RemoteError::Expired(body),
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                RemoteError::Validation(body)
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Unauthorized,
            _ => RemoteError::Server {
                status: status.as_u16(),
                message: body,
            },
        }
    }

    /// POST with an idempotency key so a retried spend is not applied twice.
    fn post(&self, url: Url) -> RequestBuilder {
        self.http
            .post(url)
            .header("Idempotency-Key", Uuid::new_v4().to_string())
    }
}

#[async_trait::async_trait]
impl CreditsApi for HttpCreditsApi {
    async fn fetch_balance(&self) -> RemoteResult<Balance> {
        let url = self.endpoint("credits/balance")?;
        self.send(self.http.get(url)).await
    }

    async fn list_transactions(
        &self,
        filter: &TransactionFilter,
    ) -> RemoteResult<Vec<CreditTransaction>> {
        let url = self.endpoint("credits/transactions")?;

        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(limit) = filter.limit {
            query.push(("limit", limit.to_string()));
        }
        if let Some(offset) = filter.offset {
            query.push(("offset", offset.to_string()));
        }
        if let Some(tx_type) = filter.tx_type {
            query.push(("type", tx_type.as_str().to_string()));
        }
        if let Some(start) = filter.start_date {
            query.push(("startDate", start.to_rfc3339()));
        }
        if let Some(end) = filter.end_date {
            query.push(("endDate", end.to_rfc3339()));
        }

        let list: TransactionList = self.send(self.http.get(url).query(&query)).await?;
        Ok(match list {
            TransactionList::Bare(transactions) => transactions,
            TransactionList::Envelope { transactions } => transactions,
        })
    }

    async fn purchase(&self, request: &PurchaseRequest) -> RemoteResult<PurchaseResponse> {
        let url = self.endpoint("credits/purchase")?;
        self.send(self.post(url).json(request)).await
    }

    async fn deduct(&self, request: &DeductRequest) -> RemoteResult<SettlementResponse> {
        let url = self.endpoint("credits/deduct")?;
        self.send(self.post(url).json(request)).await
    }

    async fn reserve(&self, request: &ReserveRequest) -> RemoteResult<ReserveResponse> {
        let url = self.endpoint("credits/reserve")?;
        self.send(self.post(url).json(request)).await
    }

    async fn confirm(&self, reservation_id: &ReservationId) -> RemoteResult<SettlementResponse> {
        let url = self.endpoint("credits/confirm")?;
        let payload = ReservationRequest {
            reservation_id: reservation_id.clone(),
        };
        self.send(self.http.post(url).json(&payload)).await
    }

    async fn cancel(&self, reservation_id: &ReservationId) -> RemoteResult<()> {
        let url = self.endpoint("credits/cancel")?;
        let payload = ReservationRequest {
            reservation_id: reservation_id.clone(),
        };
        self.send_empty(self.http.post(url).json(&payload)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_gets_trailing_slash() {
        let api = HttpCreditsApi::new("http://ledger.local/api", None, Duration::from_secs(1))
            .unwrap();
        let url = api.endpoint("credits/balance").unwrap();
        assert_eq!(url.as_str(), "http://ledger.local/api/credits/balance");
    }

    #[test]
    fn test_invalid_base_url_is_rejected() {
        assert!(HttpCreditsApi::new("not a url", None, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_transaction_list_accepts_both_shapes() {
        let tx = r#"{"id":"t1","type":"bonus","amount":5,"balanceAfter":5,"description":"welcome","timestamp":"2024-01-01T00:00:00Z"}"#;

        let bare: TransactionList = serde_json::from_str(&format!("[{}]", tx)).unwrap();
        let envelope: TransactionList =
            serde_json::from_str(&format!(r#"{{"transactions":[{}]}}"#, tx)).unwrap();

        assert!(matches!(bare, TransactionList::Bare(ref v) if v.len() == 1));
        assert!(matches!(envelope, TransactionList::Envelope { ref transactions } if transactions.len() == 1));
    }

    #[test]
    fn test_transient_classification() {
        assert!(RemoteError::Unavailable("timeout".into()).is_transient());
        assert!(
            RemoteError::Server {
                status: 503,
                message: "busy".into()
            }
            .is_transient()
        );
        assert!(!RemoteError::InsufficientCredits("low".into()).is_transient());
        assert!(!RemoteError::Validation("bad".into()).is_transient());
    }
}
