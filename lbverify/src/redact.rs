//! シークレットのマスク・リダクション・漏洩検出
//!
//! - キーヒント用のローカルマスク（先頭4文字 + `****` + 末尾4文字）
//! - ログ用の長さのみ表示マスク
//! - JSON の機密フィールド・Bearer トークン・JWT・provider キー形状の文字列のリダクション
//! - 成果物（レポート・ランログ）の漏洩セルフチェック

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// リダクション後に残すマーカー
pub const REDACTED: &str = "***REDACTED***";

/// 完全一致で機密扱いする JSON キー（小文字）
const SENSITIVE_JSON_KEYS: &[&str] = &[
    "authorization",
    "accesstoken",
    "refreshtoken",
    "password",
    "token",
    "clienttoken",
    "api_key",
    "api_keys",
    "apikey",
    "key",
    "keys",
    "secret",
    "provider_key",
    // `/providers/{name}/keys/raw` は平文キーを `value` に載せる
    "value",
];

/// 部分一致で機密扱いする JSON キー断片
const SENSITIVE_KEY_SUBSTRINGS: &[&str] = &["token", "password", "secret", "key", "authorization"];

/// 実行中に登録されたシークレットの最短長（短い値は誤検出が多い）
const MIN_KNOWN_SECRET_LEN: usize = 8;

static AUTH_HEADER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(authorization:\s*bearer)\s+(\S+)").expect("valid regex"));

static BEARER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bbearer\s+[A-Za-z0-9._+/=\-]+").expect("valid regex"));

static JSON_SECRET_FIELD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)"(refreshToken|accessToken|password|token|key|value|api_key|apiKey|secret)"\s*:\s*"[^"]+""#,
    )
    .expect("valid regex")
});

static JWT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"eyJ[A-Za-z0-9_-]{10,}\.[A-Za-z0-9_-]{10,}\.[A-Za-z0-9_-]{10,}").expect("valid regex")
});

static PROVIDER_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bsk-[A-Za-z0-9_\-]{10,}").expect("valid regex"));

static LEAK_AUTH_HEADER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)authorization:\s*bearer\s+[^\s*]").expect("valid regex"));

static LEAK_BEARER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bbearer\s+[A-Za-z0-9._+/=\-]{20,}").expect("valid regex"));

static KNOWN_SECRETS: Lazy<RwLock<Vec<String>>> = Lazy::new(|| RwLock::new(Vec::new()));

/// キーヒント用のローカルマスク
///
/// 空 → `(none)`、8文字以下 → `****`、それ以外 → 先頭4文字 + `****` + 末尾4文字。
/// サーバーが平文でキーを返した場合でも必ずこの関数で再マスクする。
pub fn mask_key(key: &str) -> String {
    let s = key.trim();
    if s.is_empty() {
        return "(none)".to_string();
    }
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}****{}", head, tail)
}

/// ログ表示用のマスク
///
/// 空 → `(empty)`、`keep == 0` → `(len=N)`、`N <= keep` → 先頭1文字 + `…(len=N)`、
/// それ以外 → 先頭 `keep` 文字 + `…(len=N)`。
pub fn mask_secret(value: &str, keep: usize) -> String {
    let chars: Vec<char> = value.chars().collect();
    let n = chars.len();
    if n == 0 {
        return "(empty)".to_string();
    }
    if keep == 0 {
        return format!("(len={})", n);
    }
    let shown = if n <= keep { 1 } else { keep };
    let head: String = chars[..shown].iter().collect();
    format!("{}…(len={})", head, n)
}

/// 実行中に扱うシークレット値を登録する
///
/// 登録済みの値は `redact_text` で置換され、`find_leaks` で漏洩として検出される。
pub fn register_secret(value: &str) {
    let value = value.trim();
    if value.chars().count() < MIN_KNOWN_SECRET_LEN {
        return;
    }
    let mut secrets = KNOWN_SECRETS.write().unwrap_or_else(|e| e.into_inner());
    if !secrets.iter().any(|s| s == value) {
        secrets.push(value.to_string());
        // 長い値から置換しないと部分一致で断片が残る
        secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
    }
}

fn known_secrets() -> Vec<String> {
    KNOWN_SECRETS
        .read()
        .map(|s| s.clone())
        .unwrap_or_else(|e| e.into_inner().clone())
}

/// JSON キー名が機密かどうか（大文字小文字を区別しない）
pub fn is_sensitive_key(name: &str) -> bool {
    let k = name.to_ascii_lowercase();
    SENSITIVE_JSON_KEYS.contains(&k.as_str())
        || SENSITIVE_KEY_SUBSTRINGS.iter().any(|sub| k.contains(sub))
}

/// JSON 値の機密フィールドをリダクションする
///
/// 文字列値は `***REDACTED*** (len=N)`、null はそのまま、それ以外は `***REDACTED***`。
pub fn redact_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let redacted = if is_sensitive_key(k) {
                        match v {
                            Value::String(s) => {
                                Value::String(format!("{} (len={})", REDACTED, s.chars().count()))
                            }
                            Value::Null => Value::Null,
                            _ => Value::String(REDACTED.to_string()),
                        }
                    } else {
                        redact_json(v)
                    };
                    (k.clone(), redacted)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_json).collect()),
        other => other.clone(),
    }
}

/// 自由テキストのリダクション
pub fn redact_text(text: &str) -> String {
    let mut out = AUTH_HEADER_RE
        .replace_all(text, |caps: &Captures| format!("{} {}", &caps[1], REDACTED))
        .into_owned();
    out = BEARER_RE
        .replace_all(&out, format!("Bearer {}", REDACTED).as_str())
        .into_owned();
    out = JSON_SECRET_FIELD_RE
        .replace_all(&out, |caps: &Captures| {
            format!("\"{}\": \"{}\"", &caps[1], REDACTED)
        })
        .into_owned();
    out = JWT_RE.replace_all(&out, REDACTED).into_owned();
    out = PROVIDER_KEY_RE
        .replace_all(&out, format!("sk-{}", REDACTED).as_str())
        .into_owned();
    for secret in known_secrets() {
        if out.contains(&secret) {
            out = out.replace(&secret, REDACTED);
        }
    }
    out
}

/// エラーメッセージ用のレスポンス断片（リダクション済み、最大 `limit` 文字）
pub fn response_snippet(body: &str, limit: usize) -> String {
    let text = body.trim();
    if text.is_empty() {
        return String::new();
    }
    match serde_json::from_str::<Value>(text) {
        Ok(parsed) => {
            let rendered = redact_json(&parsed).to_string();
            redact_text(&truncate_chars(&rendered, limit))
        }
        Err(_) => redact_text(&truncate_chars(text, limit)),
    }
}

fn truncate_chars(s: &str, limit: usize) -> String {
    s.chars().take(limit).collect()
}

/// 検出された漏洩の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeakKind {
    /// 平文の `Authorization: Bearer` ヘッダ
    AuthorizationHeader,
    /// JWT 形状の文字列
    Jwt,
    /// provider キー形状の文字列（`sk-...`）
    ProviderKey,
    /// 長い Bearer トークン
    BearerToken,
    /// 実行中に登録されたシークレット値
    KnownSecret,
}

impl fmt::Display for LeakKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LeakKind::AuthorizationHeader => "Authorization header",
            LeakKind::Jwt => "JWT-like token",
            LeakKind::ProviderKey => "provider key-like token",
            LeakKind::BearerToken => "bearer token",
            LeakKind::KnownSecret => "run secret",
        };
        f.write_str(s)
    }
}

/// 漏洩の検出位置（一致した文字列そのものは保持しない）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakFinding {
    /// 種類
    pub kind: LeakKind,
    /// 1始まりの行番号
    pub line: usize,
}

/// 漏洩チェックのエラー型
#[derive(Debug, thiserror::Error)]
pub enum LeakError {
    /// 成果物にシークレットが含まれていた
    #[error("secret leak detected in {artifact}: {summary}")]
    Found {
        /// 成果物の名前（パス）
        artifact: String,
        /// 検出内容の要約（種類と行番号のみ）
        summary: String,
    },

    /// 成果物の読み込みに失敗
    #[error("failed to read {path}: {source}")]
    Io {
        /// 対象パス
        path: PathBuf,
        /// 元のエラー
        #[source]
        source: std::io::Error,
    },
}

/// テキスト中の漏洩を検出する
pub fn find_leaks(text: &str) -> Vec<LeakFinding> {
    let secrets = known_secrets();
    let mut findings = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let checks = [
            (LeakKind::AuthorizationHeader, LEAK_AUTH_HEADER_RE.is_match(line)),
            (LeakKind::Jwt, JWT_RE.is_match(line)),
            (LeakKind::ProviderKey, PROVIDER_KEY_RE.is_match(line)),
            (LeakKind::BearerToken, LEAK_BEARER_RE.is_match(line)),
            (
                LeakKind::KnownSecret,
                secrets.iter().any(|s| line.contains(s.as_str())),
            ),
        ];
        for (kind, hit) in checks {
            if hit {
                findings.push(LeakFinding {
                    kind,
                    line: idx + 1,
                });
            }
        }
    }
    findings
}

fn summarize(findings: &[LeakFinding]) -> String {
    findings
        .iter()
        .map(|f| format!("{} (line {})", f.kind, f.line))
        .collect::<Vec<_>>()
        .join(", ")
}

/// テキストに漏洩がないことを確認する
pub fn ensure_no_leak(text: &str, artifact: &str) -> Result<(), LeakError> {
    let findings = find_leaks(text);
    if findings.is_empty() {
        return Ok(());
    }
    Err(LeakError::Found {
        artifact: artifact.to_string(),
        summary: summarize(&findings),
    })
}

/// ファイルを読み込んで漏洩を検出する
pub fn scan_file(path: &Path) -> Result<Vec<LeakFinding>, LeakError> {
    let bytes = std::fs::read(path).map_err(|source| LeakError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(find_leaks(&String::from_utf8_lossy(&bytes)))
}
