//! 検証対象サービスのリクエスト/レスポンス型
//!
//! 境界で必須フィールドを検証するため、消費する各エンドポイントごとに型を定義する。
//! シークレットを含む型には `Debug` を実装しない。

use crate::redact::mask_key;
use serde::{Deserialize, Deserializer, Serialize};

/// 数値・文字列どちらの ID も受け付ける表現
#[derive(Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Int(i64),
    Str(String),
}

/// サーバーが採番した ID（数値 ID は10進文字列に正規化）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordId(pub String);

impl<'de> Deserialize<'de> for RecordId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match IdRepr::deserialize(deserializer)? {
            IdRepr::Int(n) => RecordId(n.to_string()),
            IdRepr::Str(s) => RecordId(s),
        })
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// `POST /auth/login` リクエスト
#[derive(Serialize)]
pub struct LoginRequest<'a> {
    /// メールアドレス
    pub email: &'a str,
    /// パスワード
    pub password: &'a str,
}

/// `POST /auth/register` リクエスト（初回ブートストラップ）
#[derive(Serialize)]
pub struct RegisterRequest<'a> {
    /// ブートストラップコード
    pub bootstrap_code: &'a str,
    /// メールアドレス
    pub email: &'a str,
    /// パスワード
    pub password: &'a str,
}

/// `POST /auth/login` レスポンス
#[derive(Deserialize)]
pub struct LoginResponse {
    /// アクセストークン
    #[serde(rename = "accessToken")]
    pub access_token: Option<String>,
}

/// provider 情報（キーはサーバー側でマスク済み）
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderOut {
    /// provider 名
    pub name: String,
    /// 表示名
    #[serde(default)]
    pub display_name: Option<String>,
    /// APIタイプ
    #[serde(default)]
    pub api_type: Option<String>,
    /// 上流ベースURL
    #[serde(default)]
    pub base_url: Option<String>,
    /// マスク済みキー一覧（件数のみ利用）
    #[serde(default)]
    pub api_keys: Vec<serde_json::Value>,
    /// モデル一覧エンドポイント
    #[serde(default)]
    pub models_endpoint: Option<String>,
    /// 有効/無効
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl ProviderOut {
    /// キーを1つ以上保持しているか
    pub fn has_keys(&self) -> bool {
        !self.api_keys.is_empty()
    }
}

/// `GET /providers` レスポンス（裸の配列と `{data: [...]}` の両方を許容）
#[derive(Deserialize)]
#[serde(untagged)]
pub enum ProviderList {
    /// 裸の配列
    Bare(Vec<ProviderOut>),
    /// エンベロープ
    Envelope {
        /// provider 一覧
        data: Vec<ProviderOut>,
    },
}

impl ProviderList {
    /// provider 一覧を取り出す
    pub fn into_vec(self) -> Vec<ProviderOut> {
        match self {
            ProviderList::Bare(items) | ProviderList::Envelope { data: items } => items,
        }
    }
}

/// 平文キー1件
#[derive(Deserialize)]
pub struct RawKeyItem {
    /// キー値
    #[serde(default)]
    pub value: Option<String>,
}

/// `GET /providers/{name}/keys/raw` レスポンス
#[derive(Deserialize)]
#[serde(untagged)]
pub enum RawKeyList {
    /// `{keys: [{value}]}`
    Envelope {
        /// キー一覧
        keys: Vec<RawKeyItem>,
    },
    /// 裸の配列
    Bare(Vec<RawKeyItem>),
}

impl RawKeyList {
    /// 空でないキー値を作成順で取り出す
    pub fn into_values(self) -> Vec<String> {
        let items = match self {
            RawKeyList::Envelope { keys } => keys,
            RawKeyList::Bare(items) => items,
        };
        items
            .into_iter()
            .filter_map(|item| item.value)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect()
    }
}

/// `POST /providers` リクエスト
#[derive(Debug, Clone, Serialize)]
pub struct CreateProviderRequest {
    /// provider 名
    pub name: String,
    /// APIタイプ
    pub api_type: String,
    /// 上流ベースURL
    pub base_url: String,
    /// モデル一覧エンドポイント（未指定は null として送る）
    pub models_endpoint: Option<String>,
}

/// 単一キーの追加
#[derive(Serialize)]
pub struct KeyRequest<'a> {
    /// キー値
    pub key: &'a str,
}

/// キーの一括追加・削除
#[derive(Serialize)]
pub struct KeysBatchRequest<'a> {
    /// キー値の一覧
    pub keys: &'a [String],
}

/// `GET /models/{provider}?refresh=true` レスポンス
#[derive(Debug, Deserialize)]
pub struct ModelList {
    /// 常に `list`
    pub object: String,
    /// モデル一覧
    pub data: Vec<ModelItem>,
}

/// モデル1件
#[derive(Debug, Deserialize)]
pub struct ModelItem {
    /// モデルID
    pub id: String,
}

/// `POST /models/{provider}/cache` リクエスト
#[derive(Debug, Serialize)]
pub struct ModelCacheRequest<'a> {
    /// `selected` 固定
    pub mode: &'a str,
    /// キャッシュ対象のモデル
    pub include: Vec<&'a str>,
    /// 既存キャッシュを置き換えるか
    pub replace: bool,
}

/// `POST /admin/model-prices` リクエスト
#[derive(Debug, Serialize)]
pub struct ModelPriceRequest<'a> {
    /// provider 名
    pub provider: &'a str,
    /// モデルID
    pub model: &'a str,
    /// 入力単価（100万トークンあたり）
    pub prompt_price_per_million: f64,
    /// 出力単価（100万トークンあたり）
    pub completion_price_per_million: f64,
    /// 通貨
    pub currency: &'a str,
}

/// `POST /admin/tokens` リクエスト
#[derive(Debug, Serialize)]
pub struct CreateTokenRequest<'a> {
    /// トークン名
    pub name: &'a str,
    /// 作成時に有効化するか
    pub enabled: bool,
}

/// `POST /admin/tokens` レスポンス
#[derive(Deserialize)]
pub struct CreatedToken {
    /// トークンID
    pub id: RecordId,
    /// トークン値
    pub token: String,
}

/// チャットメッセージ
#[derive(Debug, Serialize)]
pub struct ChatMessage<'a> {
    /// ロール
    pub role: &'a str,
    /// 本文
    pub content: &'a str,
}

/// `POST /v1/chat/completions` リクエスト（最小ペイロード）
#[derive(Debug, Serialize)]
pub struct ChatRequest<'a> {
    /// モデルID
    pub model: &'a str,
    /// メッセージ
    pub messages: Vec<ChatMessage<'a>>,
    /// 出力トークン上限
    pub max_tokens: u32,
    /// 温度
    pub temperature: f32,
}

impl<'a> ChatRequest<'a> {
    /// 1トークン応答の ping リクエスト
    pub fn ping(model: &'a str) -> Self {
        Self {
            model,
            messages: vec![ChatMessage {
                role: "user",
                content: "ping",
            }],
            max_tokens: 1,
            temperature: 0.0,
        }
    }
}

/// リクエストログ1件
#[derive(Debug, Clone, Deserialize)]
pub struct RequestLogEntry {
    /// ログID（新しいリクエストほど異なる値。サーバーによっては `null`）
    #[serde(default)]
    pub id: Option<RecordId>,
    /// 記録時刻
    #[serde(default)]
    pub timestamp: Option<String>,
    /// ディスパッチ先 provider
    #[serde(default)]
    pub provider: Option<String>,
    /// 使用キー（サーバー設定により masked/plain/none）
    #[serde(default)]
    pub api_key: Option<String>,
    /// HTTPステータス
    #[serde(default)]
    pub status_code: Option<u16>,
    /// サーバー側レスポンス時間
    #[serde(default)]
    pub response_time_ms: Option<u64>,
    /// 要求モデル
    #[serde(default)]
    pub requested_model: Option<String>,
    /// 成功可否
    #[serde(default)]
    pub success: Option<bool>,
}

impl RequestLogEntry {
    /// 新旧の記録を見分けるキー
    ///
    /// ID が無い記録は時刻・provider・キー（ローカルでマスク）・レイテンシの組で代用する。
    pub fn record_key(&self) -> RecordKey {
        match &self.id {
            Some(id) => RecordKey::Id(id.clone()),
            None => RecordKey::Fingerprint {
                timestamp: self.timestamp.clone(),
                provider: self.provider.clone(),
                key_hint: self.api_key.as_deref().map(mask_key),
                response_time_ms: self.response_time_ms,
            },
        }
    }
}

/// リクエストログ記録の同一性キー
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordKey {
    /// サーバー採番の ID
    Id(RecordId),
    /// ID が無い場合の内容による識別
    Fingerprint {
        /// 記録時刻
        timestamp: Option<String>,
        /// ディスパッチ先 provider
        provider: Option<String>,
        /// マスク済みキー
        key_hint: Option<String>,
        /// サーバー側レスポンス時間
        response_time_ms: Option<u64>,
    },
}

/// `GET /admin/logs/requests` レスポンス
#[derive(Debug, Deserialize)]
pub struct RequestLogPage {
    /// 総件数
    #[serde(default)]
    pub total: Option<u64>,
    /// 新しい順のログ
    pub data: Vec<RequestLogEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_id_accepts_number_and_string() {
        let a: RecordId = serde_json::from_value(json!(42)).unwrap();
        let b: RecordId = serde_json::from_value(json!("log-7")).unwrap();
        assert_eq!(a, RecordId("42".to_string()));
        assert_eq!(b.to_string(), "log-7");
    }

    #[test]
    fn test_provider_list_shapes() {
        let bare: ProviderList =
            serde_json::from_value(json!([{"name": "a", "api_keys": ["sk-a****"]}])).unwrap();
        let env: ProviderList = serde_json::from_value(json!({"data": [{"name": "b"}]})).unwrap();
        let bare = bare.into_vec();
        assert!(bare[0].has_keys());
        assert!(!env.into_vec()[0].has_keys());

        // name が無い provider は境界で拒否する
        assert!(serde_json::from_value::<ProviderList>(json!([{"api_type": "openai"}])).is_err());
    }

    #[test]
    fn test_raw_key_list_shapes() {
        let env: RawKeyList =
            serde_json::from_value(json!({"keys": [{"value": " k1 "}, {"value": ""}, {}]})).unwrap();
        assert_eq!(env.into_values(), vec!["k1".to_string()]);
        let bare: RawKeyList =
            serde_json::from_value(json!([{"value": "k1"}, {"value": "k2"}])).unwrap();
        assert_eq!(bare.into_values(), vec!["k1".to_string(), "k2".to_string()]);
    }

    #[test]
    fn test_chat_ping_payload() {
        let body = serde_json::to_value(ChatRequest::ping("gpt-4o-mini")).unwrap();
        assert_eq!(
            body,
            json!({
                "model": "gpt-4o-mini",
                "messages": [{"role": "user", "content": "ping"}],
                "max_tokens": 1,
                "temperature": 0.0
            })
        );
    }

    #[test]
    fn test_create_provider_sends_null_models_endpoint() {
        let body = serde_json::to_value(CreateProviderRequest {
            name: "p".to_string(),
            api_type: "openai".to_string(),
            base_url: "https://api.example.com".to_string(),
            models_endpoint: None,
        })
        .unwrap();
        assert!(body.get("models_endpoint").unwrap().is_null());
    }

    #[test]
    fn test_request_log_page_requires_data() {
        let page: RequestLogPage = serde_json::from_value(json!({
            "total": 1,
            "data": [{"id": 9, "provider": "p", "api_key": "sk-a****wxyz", "response_time_ms": 12}],
            "next_cursor": null
        }))
        .unwrap();
        assert_eq!(page.data[0].id, Some(RecordId("9".to_string())));
        assert_eq!(page.data[0].record_key(), RecordKey::Id(RecordId("9".to_string())));
        assert!(serde_json::from_value::<RequestLogPage>(json!({"total": 0})).is_err());
    }

    #[test]
    fn test_null_id_falls_back_to_fingerprint() {
        let entry = |ts: &str| -> RequestLogEntry {
            serde_json::from_value(json!({
                "id": null,
                "timestamp": ts,
                "provider": "p_a",
                "api_key": "sk-plainsecretvalue9876",
                "response_time_ms": 4
            }))
            .unwrap()
        };
        let a = entry("2026-01-01T00:00:00Z");
        assert!(a.id.is_none());
        match a.record_key() {
            RecordKey::Fingerprint { provider, key_hint, .. } => {
                assert_eq!(provider.as_deref(), Some("p_a"));
                // 生のキーはキーに残さない
                assert_eq!(key_hint.as_deref(), Some("sk-p****9876"));
            }
            other => panic!("unexpected key: {other:?}"),
        }
        assert_eq!(a.record_key(), entry("2026-01-01T00:00:00Z").record_key());
        assert_ne!(a.record_key(), entry("2026-01-01T00:00:01Z").record_key());

        // id フィールド自体が無くても読める
        let missing: RequestLogEntry = serde_json::from_value(json!({"provider": "p_b"})).unwrap();
        assert!(missing.id.is_none());
    }
}
