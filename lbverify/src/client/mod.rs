//! 検証対象サービスのHTTPクライアント
//!
//! 認証・provider/key CRUD・モデルキャッシュ/価格・クライアントトークン・
//! チャットディスパッチ・リクエストログ照会の型付きファサード。
//! ポリシーは持たず、各呼び出しは厳密なステータスコード契約で検証する。
//! エラーやログに載せるレスポンス本文は必ずリダクションする。

pub mod types;

use crate::common::types::ClientCredential;
use crate::config::{CHAT_TIMEOUT, FALLBACK_MODEL, HEALTH_PROBE_TIMEOUT, HTTP_TIMEOUT, MODEL_REFRESH_TIMEOUT};
use crate::redact::{self, response_snippet};
use reqwest::{Method, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};
use types::*;

/// エラーメッセージに含めるレスポンス本文の上限
const SNIPPET_LIMIT: usize = 320;

/// ServiceClient のエラー型
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// 接続失敗・タイムアウト（URLは除去済み）
    #[error("{op}: transport error: {source}")]
    Transport {
        /// 操作名
        op: String,
        /// 元のエラー
        #[source]
        source: reqwest::Error,
    },

    /// ステータスコード契約違反
    #[error("{op}: expected HTTP {expected}, got {actual}: {body}")]
    UnexpectedStatus {
        /// 操作名
        op: String,
        /// 期待したステータス
        expected: String,
        /// 実際のステータス
        actual: u16,
        /// リダクション済みの本文断片
        body: String,
    },

    /// レスポンス形状が不正
    #[error("{op}: invalid response: {message}")]
    InvalidResponse {
        /// 操作名
        op: String,
        /// 詳細
        message: String,
    },

    /// ベースURLが不正
    #[error("Invalid base URL '{0}'")]
    InvalidBaseUrl(String),

    /// 管理APIをアクセストークンなしで呼び出した
    #[error("{0}: not authenticated")]
    NotAuthenticated(String),
}

impl ClientError {
    /// HTTP ステータスコード（契約違反の場合のみ）
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::UnexpectedStatus { actual, .. } => Some(*actual),
            _ => None,
        }
    }
}

/// ステータスと本文
#[derive(Debug)]
struct RawResponse {
    status: u16,
    body: String,
}

fn expect_status(op: &str, resp: RawResponse, expected: &[u16]) -> Result<RawResponse, ClientError> {
    if expected.contains(&resp.status) {
        return Ok(resp);
    }
    Err(ClientError::UnexpectedStatus {
        op: op.to_string(),
        expected: expected
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join("|"),
        actual: resp.status,
        body: response_snippet(&resp.body, SNIPPET_LIMIT),
    })
}

fn parse_json<T: DeserializeOwned>(op: &str, resp: &RawResponse) -> Result<T, ClientError> {
    serde_json::from_str(&resp.body).map_err(|e| ClientError::InvalidResponse {
        op: op.to_string(),
        message: e.to_string(),
    })
}

/// 上流ベースURLを正規化する
///
/// 末尾の `/` を除去し、`openai` タイプで末尾が `/v1` の場合は取り除く
/// （サービス側が `/v1/...` を付与するため）。除去した場合は注記を返す。
pub fn normalize_provider_base_url(api_type: &str, base_url: &str) -> (String, Option<&'static str>) {
    let trimmed = base_url.trim().trim_end_matches('/');
    if api_type == "openai" && trimmed.to_ascii_lowercase().ends_with("/v1") {
        return (
            trimmed[..trimmed.len() - 3].to_string(),
            Some("openai base_url ends with /v1, stripped"),
        );
    }
    (trimmed.to_string(), None)
}

/// ディスパッチに使うモデルを選ぶ
///
/// 優先モデルの完全一致、大文字小文字を無視した一致、一覧の先頭、
/// 最後に `gpt-4o-mini` の順。
pub fn pick_model_id(ids: &[String], preferred: Option<&str>) -> String {
    if let Some(pref) = preferred.map(str::trim).filter(|p| !p.is_empty()) {
        if let Some(id) = ids.iter().find(|id| id.as_str() == pref) {
            return id.clone();
        }
        if let Some(id) = ids.iter().find(|id| id.eq_ignore_ascii_case(pref)) {
            return id.clone();
        }
    }
    match ids.first() {
        Some(id) => id.clone(),
        None => {
            warn!(
                "Model list is empty; falling back to {} (upstream-dependent)",
                FALLBACK_MODEL
            );
            FALLBACK_MODEL.to_string()
        }
    }
}

/// 検証対象サービスのHTTPクライアント
#[derive(Clone)]
pub struct ServiceClient {
    http: reqwest::Client,
    base_url: Url,
    access_token: Option<String>,
}

impl std::fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceClient")
            .field("base_url", &self.base_url.as_str())
            .field("authenticated", &self.access_token.is_some())
            .finish()
    }
}

impl ServiceClient {
    /// クライアントを作成する
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let base_url =
            Url::parse(base_url).map_err(|_| ClientError::InvalidBaseUrl(base_url.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(ClientError::InvalidBaseUrl(base_url.to_string()));
        }
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|source| ClientError::Transport {
                op: "build http client".to_string(),
                source,
            })?;
        Ok(Self {
            http,
            base_url,
            access_token: None,
        })
    }

    /// ベースURL
    pub fn base_url(&self) -> &str {
        self.base_url.as_str().trim_end_matches('/')
    }

    /// アクセストークンを設定する
    pub fn set_access_token(&mut self, token: impl Into<String>) {
        let token = token.into();
        redact::register_secret(&token);
        self.access_token = Some(token);
    }

    /// 認証済みか
    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some()
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        self.http
            .request(method, self.url(segments))
            .header(reqwest::header::ACCEPT, "application/json")
    }

    fn admin(&self, op: &str, method: Method, segments: &[&str]) -> Result<RequestBuilder, ClientError> {
        let token = self
            .access_token
            .as_deref()
            .ok_or_else(|| ClientError::NotAuthenticated(op.to_string()))?;
        Ok(self.request(method, segments).bearer_auth(token))
    }

    async fn execute(&self, op: &str, builder: RequestBuilder) -> Result<RawResponse, ClientError> {
        let resp = builder
            .send()
            .await
            .map_err(|e| ClientError::Transport {
                op: op.to_string(),
                source: e.without_url(),
            })?;
        let status = resp.status().as_u16();
        let body = resp.text().await.map_err(|e| ClientError::Transport {
            op: op.to_string(),
            source: e.without_url(),
        })?;
        debug!(op = %op, status, "Service call completed");
        Ok(RawResponse { status, body })
    }

    async fn call<B: Serialize + ?Sized>(
        &self,
        op: &str,
        method: Method,
        segments: &[&str],
        body: Option<&B>,
        expected: &[u16],
        timeout: Option<Duration>,
    ) -> Result<RawResponse, ClientError> {
        let mut builder = self.admin(op, method, segments)?;
        if let Some(body) = body {
            builder = builder.json(body);
        }
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let resp = self.execute(op, builder).await?;
        expect_status(op, resp, expected)
    }

    /// ヘルスエンドポイントを1回叩いてステータスを返す（認証なし）
    pub async fn probe_health(&self, path: &str) -> Result<u16, ClientError> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let builder = self.request(Method::GET, &segments).timeout(HEALTH_PROBE_TIMEOUT);
        Ok(self.execute("health probe", builder).await?.status)
    }

    async fn login(&self, email: &str, password: &str) -> Result<RawResponse, ClientError> {
        let builder = self
            .request(Method::POST, &["auth", "login"])
            .json(&LoginRequest { email, password });
        self.execute("POST /auth/login", builder).await
    }

    /// 管理者としてログインし、アクセストークンを保持する
    ///
    /// ログインが 401 でブートストラップコードがある場合のみ、
    /// `POST /auth/register` を1回試してから再ログインする。
    pub async fn authenticate(
        &mut self,
        email: &str,
        password: &str,
        bootstrap_code: Option<&str>,
    ) -> Result<(), ClientError> {
        const OP: &str = "POST /auth/login";
        let mut resp = self.login(email, password).await?;
        if resp.status == 401 {
            if let Some(code) = bootstrap_code.filter(|c| !c.is_empty()) {
                warn!("Admin login returned 401, trying one-time /auth/register bootstrap");
                let builder = self.request(Method::POST, &["auth", "register"]).json(&RegisterRequest {
                    bootstrap_code: code,
                    email,
                    password,
                });
                let reg = self.execute("POST /auth/register", builder).await?;
                debug!(status = reg.status, "Bootstrap register finished");
                resp = self.login(email, password).await?;
            }
        }
        let resp = expect_status(OP, resp, &[200])?;
        let parsed: LoginResponse = parse_json(OP, &resp)?;
        let token = parsed
            .access_token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ClientError::InvalidResponse {
                op: OP.to_string(),
                message: "login response missing accessToken".to_string(),
            })?;
        self.set_access_token(token);
        Ok(())
    }

    /// `GET /providers`
    pub async fn list_providers(&self) -> Result<Vec<ProviderOut>, ClientError> {
        const OP: &str = "GET /providers";
        let resp = self
            .call::<()>(OP, Method::GET, &["providers"], None, &[200], None)
            .await?;
        Ok(parse_json::<ProviderList>(OP, &resp)?.into_vec())
    }

    /// `GET /providers/{name}`
    pub async fn get_provider(&self, name: &str) -> Result<ProviderOut, ClientError> {
        let op = format!("GET /providers/{}", name);
        let resp = self
            .call::<()>(&op, Method::GET, &["providers", name], None, &[200], None)
            .await?;
        parse_json(&op, &resp)
    }

    /// `POST /providers`（200 のみ成功）
    pub async fn create_provider(&self, req: &CreateProviderRequest) -> Result<(), ClientError> {
        let op = format!("POST /providers name={}", req.name);
        self.call(&op, Method::POST, &["providers"], Some(req), &[200], None)
            .await?;
        Ok(())
    }

    /// `DELETE /providers/{name}`（200/204）
    pub async fn delete_provider(&self, name: &str) -> Result<(), ClientError> {
        let op = format!("DELETE /providers/{}", name);
        self.call::<()>(&op, Method::DELETE, &["providers", name], None, &[200, 204], None)
            .await?;
        Ok(())
    }

    /// `GET /providers/{name}/keys/raw`（平文キーを作成順で返す）
    pub async fn provider_keys_raw(&self, name: &str) -> Result<Vec<String>, ClientError> {
        let op = format!("GET /providers/{}/keys/raw", name);
        let resp = self
            .call::<()>(&op, Method::GET, &["providers", name, "keys", "raw"], None, &[200], None)
            .await?;
        let keys = parse_json::<RawKeyList>(&op, &resp)?.into_values();
        for key in &keys {
            redact::register_secret(key);
        }
        Ok(keys)
    }

    /// `POST /providers/{name}/keys`（200/201）
    pub async fn add_key(&self, name: &str, key: &str) -> Result<(), ClientError> {
        let op = format!("POST /providers/{}/keys", name);
        self.call(&op, Method::POST, &["providers", name, "keys"], Some(&KeyRequest { key }), &[200, 201], None)
            .await?;
        Ok(())
    }

    /// `POST /providers/{name}/keys/batch`（200）
    pub async fn add_keys_batch(&self, name: &str, keys: &[String]) -> Result<(), ClientError> {
        if keys.is_empty() {
            return Ok(());
        }
        let op = format!("POST /providers/{}/keys/batch count={}", name, keys.len());
        self.call(
            &op,
            Method::POST,
            &["providers", name, "keys", "batch"],
            Some(&KeysBatchRequest { keys }),
            &[200],
            None,
        )
        .await?;
        Ok(())
    }

    /// `DELETE /providers/{name}/keys/batch`（200）
    pub async fn delete_keys_batch(&self, name: &str, keys: &[String]) -> Result<(), ClientError> {
        if keys.is_empty() {
            return Ok(());
        }
        let op = format!("DELETE /providers/{}/keys/batch count={}", name, keys.len());
        self.call(
            &op,
            Method::DELETE,
            &["providers", name, "keys", "batch"],
            Some(&KeysBatchRequest { keys }),
            &[200],
            None,
        )
        .await?;
        Ok(())
    }

    /// `GET /models/{provider}?refresh=true`（モデルID一覧）
    pub async fn refresh_models(&self, provider: &str) -> Result<Vec<String>, ClientError> {
        let op = format!("GET /models/{}?refresh=true", provider);
        let builder = self
            .admin(&op, Method::GET, &["models", provider])?
            .query(&[("refresh", "true")])
            .timeout(MODEL_REFRESH_TIMEOUT);
        let resp = expect_status(&op, self.execute(&op, builder).await?, &[200])?;
        let list: ModelList = parse_json(&op, &resp)?;
        if list.object != "list" {
            return Err(ClientError::InvalidResponse {
                op,
                message: format!("unexpected object '{}'", list.object),
            });
        }
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }

    /// `POST /models/{provider}/cache`（選択モデルのみキャッシュ、200）
    pub async fn update_model_cache(&self, provider: &str, model: &str) -> Result<(), ClientError> {
        let op = format!("POST /models/{}/cache", provider);
        let body = ModelCacheRequest {
            mode: "selected",
            include: vec![model],
            replace: false,
        };
        self.call(&op, Method::POST, &["models", provider, "cache"], Some(&body), &[200], Some(CHAT_TIMEOUT))
            .await?;
        Ok(())
    }

    /// `POST /admin/model-prices`（価格0で登録、200/201）
    pub async fn upsert_model_price(&self, provider: &str, model: &str) -> Result<(), ClientError> {
        let op = format!("POST /admin/model-prices provider={}", provider);
        let body = ModelPriceRequest {
            provider,
            model,
            prompt_price_per_million: 0.0,
            completion_price_per_million: 0.0,
            currency: "USD",
        };
        self.call(&op, Method::POST, &["admin", "model-prices"], Some(&body), &[200, 201], None)
            .await?;
        Ok(())
    }

    /// `POST /admin/tokens`（201 で ID とトークン値の両方が必須）
    pub async fn create_client_token(&self, name: &str) -> Result<ClientCredential, ClientError> {
        const OP: &str = "POST /admin/tokens";
        let body = CreateTokenRequest {
            name,
            enabled: true,
        };
        let resp = self
            .call(OP, Method::POST, &["admin", "tokens"], Some(&body), &[201], None)
            .await?;
        let created: CreatedToken = parse_json(OP, &resp)?;
        let token = created.token.trim().to_string();
        if token.is_empty() || created.id.0.is_empty() {
            return Err(ClientError::InvalidResponse {
                op: OP.to_string(),
                message: "created token is missing id or token value".to_string(),
            });
        }
        redact::register_secret(&token);
        Ok(ClientCredential {
            id: created.id.0,
            token,
        })
    }

    /// `POST /admin/tokens/{id}/toggle`（200）
    pub async fn toggle_client_token(&self, id: &str) -> Result<(), ClientError> {
        let op = format!("POST /admin/tokens/{}/toggle", id);
        self.call::<()>(&op, Method::POST, &["admin", "tokens", id, "toggle"], None, &[200], None)
            .await?;
        Ok(())
    }

    /// `DELETE /admin/tokens/{id}`（204）
    pub async fn delete_client_token(&self, id: &str) -> Result<(), ClientError> {
        let op = format!("DELETE /admin/tokens/{}", id);
        self.call::<()>(&op, Method::DELETE, &["admin", "tokens", id], None, &[204], None)
            .await?;
        Ok(())
    }

    /// `POST /v1/chat/completions` をクライアントトークンで1回発行し、ステータスを返す
    ///
    /// ステータスコードは検証しない（帰属はリクエストログから読み戻す）。
    pub async fn chat_once(&self, credential: &ClientCredential, model: &str) -> Result<u16, ClientError> {
        let builder = self
            .request(Method::POST, &["v1", "chat", "completions"])
            .bearer_auth(&credential.token)
            .json(&ChatRequest::ping(model))
            .timeout(CHAT_TIMEOUT);
        Ok(self.execute("POST /v1/chat/completions", builder).await?.status)
    }

    /// このクライアントトークン・モデルの最新ディスパッチ記録
    pub async fn latest_request_log(
        &self,
        credential: &ClientCredential,
        model: &str,
    ) -> Result<Option<RequestLogEntry>, ClientError> {
        const OP: &str = "GET /admin/logs/requests";
        let builder = self
            .admin(OP, Method::GET, &["admin", "logs", "requests"])?
            .query(&[
                ("limit", "1"),
                ("request_type", "chat_once"),
                ("method", "POST"),
                ("path", "/v1/chat/completions"),
                ("client_token", credential.token.as_str()),
                ("model", model),
            ]);
        let resp = expect_status(OP, self.execute(OP, builder).await?, &[200])?;
        let page: RequestLogPage = parse_json(OP, &resp)?;
        Ok(page.data.into_iter().next())
    }
}
