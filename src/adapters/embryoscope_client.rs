//! Embryoscope 儀器的 HTTP API 客戶端

use crate::config::lake_config::{ClinicConfig, ExtractionSettings};
use crate::domain::ports::EmbryoscopeApi;
use crate::utils::error::{EtlError, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// 節流：兩次請求之間至少間隔 `delay`
struct RateLimiter {
    delay: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            last_request: Mutex::new(None),
        }
    }

    async fn wait(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.delay {
                let wait = self.delay - elapsed;
                tracing::trace!("Rate limiting: waiting {:?}", wait);
                tokio::time::sleep(wait).await;
            }
        }
        *last = Some(Instant::now());
    }
}

pub struct EmbryoscopeClient {
    location: String,
    base_url: String,
    login: String,
    password: String,
    client: Client,
    token: Mutex<Option<String>>,
    rate_limiter: RateLimiter,
    max_retries: u32,
    retry_backoff: Duration,
}

impl EmbryoscopeClient {
    pub fn new(clinic: &ClinicConfig, settings: &ExtractionSettings) -> Result<Self> {
        Self::with_base_url(clinic, clinic.base_url(), settings)
    }

    /// 指定 base URL (測試用的 mock server)
    pub fn with_base_url(
        clinic: &ClinicConfig,
        base_url: impl Into<String>,
        settings: &ExtractionSettings,
    ) -> Result<Self> {
        // 儀器使用自簽憑證
        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(settings.timeout())
            .build()?;

        Ok(Self {
            location: clinic.name.clone(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            login: clinic.login.clone(),
            password: clinic.password.clone(),
            client,
            token: Mutex::new(None),
            rate_limiter: RateLimiter::new(settings.rate_limit_delay()),
            max_retries: settings.max_retries.max(1),
            retry_backoff: settings.retry_backoff(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// 取得 token；失敗為 AuthenticationError
    pub async fn authenticate(&self) -> Result<String> {
        let url = format!("{}/LOGIN", self.base_url);
        tracing::debug!(
            "🔐 [{}] Authenticating at {} as {} (password: ***MASKED***)",
            self.location,
            url,
            self.login
        );

        let response = self
            .client
            .get(&url)
            .query(&[("username", self.login.as_str()), ("password", self.password.as_str())])
            .send()
            .await
            .map_err(|e| EtlError::AuthenticationError {
                message: format!("{}: {}", self.location, e),
            })?;

        if !response.status().is_success() {
            return Err(EtlError::AuthenticationError {
                message: format!("{}: LOGIN returned {}", self.location, response.status()),
            });
        }

        let body: Value = response.json().await.map_err(|e| EtlError::AuthenticationError {
            message: format!("{}: invalid LOGIN response: {}", self.location, e),
        })?;

        let token = body
            .get("Token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| EtlError::AuthenticationError {
                message: format!("No token found in response for {}", self.location),
            })?;

        *self.token.lock().await = Some(token.clone());
        tracing::info!("✅ [{}] Authentication successful", self.location);
        Ok(token)
    }

    async fn current_token(&self) -> Result<String> {
        let cached = self.token.lock().await.clone();
        match cached {
            Some(token) => Ok(token),
            None => self.authenticate().await,
        }
    }

    async fn clear_token(&self) {
        *self.token.lock().await = None;
    }

    /// 節流 + 重試；401 直接回傳給呼叫端處理
    async fn send_with_retry(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
        token: &str,
    ) -> Result<Response> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let mut backoff = self.retry_backoff;
        let mut last_error = None;

        for attempt in 1..=self.max_retries {
            self.rate_limiter.wait().await;
            tracing::debug!(
                "📡 [{}] {} attempt {}/{} params={:?}",
                self.location,
                endpoint,
                attempt,
                self.max_retries,
                params
            );

            let result = self
                .client
                .get(&url)
                .header("API-token", token)
                .query(params)
                .send()
                .await;

            match result {
                Ok(response)
                    if response.status().is_success()
                        || response.status() == StatusCode::UNAUTHORIZED =>
                {
                    return Ok(response);
                }
                Ok(response) => {
                    last_error = Some(EtlError::ApiStatusError {
                        endpoint: endpoint.to_string(),
                        status: response.status().as_u16(),
                    });
                }
                Err(e) => last_error = Some(EtlError::ApiError(e)),
            }

            if attempt < self.max_retries {
                if let Some(e) = &last_error {
                    tracing::warn!(
                        "⚠️ [{}] Request failed for {} (attempt {}/{}): {}",
                        self.location,
                        endpoint,
                        attempt,
                        self.max_retries,
                        e
                    );
                }
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }

        let error = last_error.unwrap_or_else(|| EtlError::ApiStatusError {
            endpoint: endpoint.to_string(),
            status: 0,
        });
        tracing::error!(
            "❌ [{}] Request failed for {} after {} attempts: {}",
            self.location,
            endpoint,
            self.max_retries,
            error
        );
        Err(error)
    }

    /// 帶 token 的請求；空內容回傳 `None`
    async fn request(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<Option<Value>> {
        for auth_attempt in 0..2 {
            let token = self.current_token().await?;
            let response = self.send_with_retry(endpoint, params, &token).await?;

            if response.status() == StatusCode::UNAUTHORIZED {
                self.clear_token().await;
                if auth_attempt == 0 {
                    tracing::debug!(
                        "🔄 [{}] Token expired, re-authenticating...",
                        self.location
                    );
                    continue;
                }
                break;
            }

            let body = response.text().await?;
            if body.trim().is_empty() {
                tracing::debug!("[{}] Empty response from {}", self.location, endpoint);
                return Ok(None);
            }

            return serde_json::from_str(&body).map(Some).map_err(|e| {
                let preview: String = body.chars().take(200).collect();
                EtlError::ProcessingError {
                    message: format!(
                        "Invalid JSON response from {} - {}: {} ({})",
                        self.location, endpoint, e, preview
                    ),
                }
            });
        }

        Err(EtlError::AuthenticationError {
            message: format!("Failed to re-authenticate for {}", self.location),
        })
    }

    pub async fn get_embryo_ids(
        &self,
        patient_idx: &str,
        treatment_name: &str,
    ) -> Result<Option<Value>> {
        self.request(
            "GET/embryoID",
            &[("PatientIDx", patient_idx), ("TreatmentName", treatment_name)],
        )
        .await
    }

    pub async fn get_fertilization_time(&self, embryo_id: &str) -> Result<Option<Value>> {
        self.request("GET/fertilizationtime", &[("EmbryoID", embryo_id)])
            .await
    }

    pub async fn get_image_runs(&self, embryo_id: &str) -> Result<Option<Value>> {
        self.request("GET/imageruns", &[("EmbryoID", embryo_id)]).await
    }

    pub async fn get_evaluation(&self, embryo_id: &str) -> Result<Option<Value>> {
        self.request("GET/evaluation", &[("EmbryoID", embryo_id)]).await
    }

    pub async fn get_embryo_fate(&self, embryo_id: &str) -> Result<Option<Value>> {
        self.request("GET/embryofate", &[("EmbryoID", embryo_id)]).await
    }

    pub async fn get_embryo_details(&self, embryo_id: &str) -> Result<Option<Value>> {
        self.request("GET/embryodetails", &[("EmbryoID", embryo_id)])
            .await
    }

    pub async fn get_transfers(&self, patient_idx: &str) -> Result<Option<Value>> {
        self.request("GET/transfers", &[("PatientIDx", patient_idx)])
            .await
    }

    /// `GET/patients` 回傳含 `Patients` 的物件即視為連線成功
    pub async fn test_connection(&self) -> bool {
        match self.get_patients().await {
            Ok(Some(body)) if body.get("Patients").is_some() => {
                tracing::info!("✅ [{}] Connection test successful", self.location);
                true
            }
            Ok(_) => {
                tracing::error!("❌ [{}] Connection test failed: invalid response", self.location);
                false
            }
            Err(e) => {
                tracing::error!("❌ [{}] Connection test failed: {}", self.location, e);
                false
            }
        }
    }
}

#[async_trait]
impl EmbryoscopeApi for EmbryoscopeClient {
    fn location(&self) -> &str {
        &self.location
    }

    async fn get_patients(&self) -> Result<Option<Value>> {
        self.request("GET/patients", &[]).await
    }

    async fn get_ongoing_patients(&self) -> Result<Option<Value>> {
        self.request("GET/ongoingpatients", &[]).await
    }

    async fn get_treatments(&self, patient_idx: &str) -> Result<Option<Value>> {
        self.request("GET/TREATMENT", &[("patientIDx", patient_idx)])
            .await
    }

    async fn get_embryo_data(
        &self,
        patient_idx: &str,
        treatment_name: &str,
    ) -> Result<Option<Value>> {
        self.request(
            "GET/embryodata",
            &[("PatientIDx", patient_idx), ("TreatmentName", treatment_name)],
        )
        .await
    }

    async fn get_idascore(&self) -> Result<Option<Value>> {
        self.request("GET/IDASCORE", &[]).await
    }

    async fn refresh_token(&self) -> Result<()> {
        self.clear_token().await;
        self.authenticate().await.map(|_| ())
    }
}
