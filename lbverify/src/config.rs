//! 設定管理（envファイル・環境変数・CLI上書き）
//!
//! ゲートウェイと上流の設定は `<root>/.env.example`、`<root>/.env`、プロセス環境変数の
//! 順に読み、後のものが優先される。
//! ハーネス自体の設定（ポート・パス・フェーズ）は CLI フラグから取る。
//! clap が `LBVERIFY_*` 環境変数で裏打ちする。

use crate::common::types::{parse_phases, Phase};
use crate::retry::RetryPolicy;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 通常のAPI呼び出し1回あたりのHTTPタイムアウト
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
/// `GET /models/{name}?refresh=true` のHTTPタイムアウト
pub const MODEL_REFRESH_TIMEOUT: Duration = Duration::from_secs(45);
/// チャットのディスパッチとモデルキャッシュ更新のHTTPタイムアウト
pub const CHAT_TIMEOUT: Duration = Duration::from_secs(60);
/// ヘルスチェック1回のタイムアウト
pub const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// ヘルスチェックの間隔
pub const POLL_INTERVAL: Duration = Duration::from_millis(300);
/// SIGTERM から SIGKILL までの猶予
pub const STOP_GRACE: Duration = Duration::from_secs(10);
/// 後片付けの最終再起動での readiness タイムアウト
pub const TEARDOWN_READY_TIMEOUT: Duration = Duration::from_secs(240);
/// リクエストログからディスパッチ記録を読み戻す試行回数
pub const LOG_POLL_ATTEMPTS: u32 = 8;
/// リクエストログ読み出しの間隔
pub const LOG_POLL_DELAY: Duration = Duration::from_millis(200);

/// provider のモデル一覧が空または取得できないときに使うモデル
pub const FALLBACK_MODEL: &str = "gpt-4o-mini";

const UPSTREAM_KEY_1_NAMES: &[&str] = &[
    "UPSTREAM_API_KEY_1",
    "UPSTREAM_API_KEY1",
    "PROVIDER_API_KEY_1",
    "PROVIDER_API_KEY1",
];
const UPSTREAM_KEY_2_NAMES: &[&str] = &[
    "UPSTREAM_API_KEY_2",
    "UPSTREAM_API_KEY2",
    "PROVIDER_API_KEY_2",
    "PROVIDER_API_KEY2",
];
const API_TYPE_NAMES: &[&str] = &["PROVIDER_API_TYPE", "UPSTREAM_API_TYPE", "API_TYPE"];
const UPSTREAM_BASE_URL_NAMES: &[&str] = &[
    "UPSTREAM_BASE_URL",
    "PROVIDER_BASE_URL",
    "OPENAI_BASE_URL",
    "BASEURL",
    "BASE_URL",
];
const MODEL_NAMES: &[&str] = &["BIZ_TEST_MODEL", "TEST_MODEL", "OPENAI_MODEL", "MODEL", "CHAT_MODEL"];

static NON_ALNUM_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9]+").expect("valid regex"));

/// 設定エラー
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// envファイルは存在するが読めない
    #[error("Failed to read env file {path}: {source}")]
    EnvFile {
        /// ファイルパス
        path: PathBuf,
        /// 元のエラー
        #[source]
        source: std::io::Error,
    },

    /// 値はあるが使えない
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// 非推奨の旧名にフォールバックして環境変数を取得する
///
/// 旧名だけが設定されている場合はその値を返し、非推奨の警告を出す。
pub fn get_env_with_fallback(new_name: &str, old_name: &str) -> Option<String> {
    if let Ok(val) = std::env::var(new_name) {
        return Some(val);
    }
    if let Ok(val) = std::env::var(old_name) {
        tracing::warn!(
            "Environment variable '{}' is deprecated, use '{}' instead",
            old_name,
            new_name
        );
        return Some(val);
    }
    None
}

/// envキーを `UPPER_SNAKE` に正規化する（`export ` 接頭辞は落とす）
pub fn norm_env_key(key: &str) -> String {
    let mut k = key.trim();
    if k.get(..7)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("export "))
    {
        k = k[7..].trim();
    }
    NON_ALNUM_RE
        .replace_all(k, "_")
        .trim_matches('_')
        .to_ascii_uppercase()
}

/// dotenv 形式のファイルを解析する
///
/// `KEY=value` と `KEY: value`（先に出現した区切りを採用）、`#` のコメント行、
/// シングル/ダブルクォートの値を受け付ける。ファイルが無ければ空のマップを返す。
pub fn parse_env_file(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let bytes = std::fs::read(path).map_err(|source| ConfigError::EnvFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse_env_str(&String::from_utf8_lossy(&bytes)))
}

fn parse_env_str(text: &str) -> HashMap<String, String> {
    let mut env = HashMap::new();
    for raw in text.lines() {
        let line = raw.trim_end_matches('\r');
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let idx = match (line.find('='), line.find(':')) {
            (None, None) => continue,
            (Some(eq), None) => eq,
            (None, Some(col)) => col,
            (Some(eq), Some(col)) => eq.min(col),
        };
        let key = line[..idx].trim();
        if key.is_empty() {
            continue;
        }
        env.insert(norm_env_key(key), unquote(line[idx + 1..].trim()).to_string());
    }
    env
}

fn unquote(val: &str) -> &str {
    let quoted = val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')));
    if quoted {
        &val[1..val.len() - 1]
    } else {
        val
    }
}

/// envファイルとプロセス環境変数を統合したキー/値ビュー
#[derive(Debug, Default, Clone)]
pub struct EnvSource {
    values: HashMap<String, String>,
}

impl EnvSource {
    /// `<root>/.env.example`、`<root>/.env`、プロセス環境変数の順に統合する
    pub fn load(root: &Path) -> Result<Self, ConfigError> {
        let mut values = parse_env_file(&root.join(".env.example"))?;
        values.extend(parse_env_file(&root.join(".env"))?);
        values.extend(std::env::vars().map(|(k, v)| (norm_env_key(&k), v)));
        Ok(Self { values })
    }

    /// 明示的なマップから作る（キーは正規化される）
    pub fn from_map(map: HashMap<String, String>) -> Self {
        Self {
            values: map
                .into_iter()
                .map(|(k, v)| (norm_env_key(&k), v))
                .collect(),
        }
    }

    /// `names` のうち最初の空でない値
    pub fn pick(&self, names: &[&str]) -> Option<String> {
        names.iter().find_map(|name| {
            self.values
                .get(&norm_env_key(name))
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        })
    }
}

/// 設定で与えられた上流の資格情報とエンドポイント
///
/// `None` のフィールドは、キーを持つ既存の最初の provider から補う。
#[derive(Clone, Default)]
pub struct UpstreamSettings {
    /// 1本目の上流キー
    pub key_1: Option<String>,
    /// 2本目の上流キー（キー単位の検証を有効にする）
    pub key_2: Option<String>,
    /// 上流APIタイプ（小文字化済み）
    pub api_type: Option<String>,
    /// 上流ベースURL
    pub base_url: Option<String>,
    /// 優先するモデルID
    pub preferred_model: Option<String>,
}

impl std::fmt::Debug for UpstreamSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamSettings")
            .field("key_1", &self.key_1.as_ref().map(|_| "***"))
            .field("key_2", &self.key_2.as_ref().map(|_| "***"))
            .field("api_type", &self.api_type)
            .field("base_url", &self.base_url.is_some())
            .field("preferred_model", &self.preferred_model)
            .finish()
    }
}

impl UpstreamSettings {
    /// 別名リストに従って [`EnvSource`] から解決する
    pub fn from_env(env: &EnvSource) -> Self {
        Self {
            key_1: env.pick(UPSTREAM_KEY_1_NAMES),
            key_2: env.pick(UPSTREAM_KEY_2_NAMES),
            api_type: env.pick(API_TYPE_NAMES).map(|s| s.to_ascii_lowercase()),
            base_url: env.pick(UPSTREAM_BASE_URL_NAMES),
            preferred_model: env.pick(MODEL_NAMES),
        }
    }
}

/// CLI からの上書き（`None` は解決済みの既定値を使う）
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// ゲートウェイのベースURL
    pub base_url: Option<String>,
    /// 戦略設定ファイル
    pub config_path: Option<PathBuf>,
    /// サービスのコマンドライン（空白区切り）
    pub service_command: Option<String>,
    /// 一度だけ実行するビルドのコマンドライン
    pub build_command: Option<String>,
    /// サービスの待ち受けポート
    pub port: Option<u16>,
    /// ヘルスエンドポイントのパス
    pub health_path: Option<String>,
    /// readiness タイムアウト（秒）
    pub ready_timeout_secs: Option<u64>,
    /// 成果物ディレクトリ
    pub out_dir: Option<PathBuf>,
    /// フェーズ一覧（`strategy:count,...`）
    pub phases: Option<String>,
    /// フィクスチャ名の接頭辞
    pub prefix_root: Option<String>,
}

/// 解決済みのハーネス設定
#[derive(Clone)]
pub struct HarnessConfig {
    /// プロジェクトルート（サービスの作業ディレクトリ）
    pub root: PathBuf,
    /// ゲートウェイのベースURL（末尾スラッシュなし）
    pub base_url: String,
    /// 管理者ログインのメールアドレス
    pub email: String,
    /// 管理者ログインのパスワード
    pub password: String,
    /// `/auth/register` 用の一度きりのブートストラップコード
    pub bootstrap_code: Option<String>,
    /// 設定から得た上流の設定
    pub upstream: UpstreamSettings,
    /// 戦略設定ファイル（`[load_balancing] strategy = ...`）
    pub config_path: PathBuf,
    /// サービスのコマンドライン
    pub service_command: Vec<String>,
    /// 一度だけ実行するビルドのコマンドライン
    pub build_command: Option<Vec<String>>,
    /// サービスの待ち受けポート
    pub port: u16,
    /// ヘルスエンドポイントのパス
    pub health_path: String,
    /// 再起動ごとの readiness タイムアウト
    pub ready_timeout: Duration,
    /// 後片付けの再起動での readiness タイムアウト
    pub teardown_ready_timeout: Duration,
    /// SIGKILL までの猶予
    pub stop_grace: Duration,
    /// リクエストログ読み戻しのリトライ方針
    pub log_poll: RetryPolicy,
    /// 成果物ディレクトリ
    pub out_dir: PathBuf,
    /// サービス出力用のスクラッチディレクトリ
    pub scratch_dir: PathBuf,
    /// 実行順のフェーズ
    pub phases: Vec<Phase>,
    /// フィクスチャ名の接頭辞
    pub prefix_root: String,
}

impl std::fmt::Debug for HarnessConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarnessConfig")
            .field("root", &self.root)
            .field("base_url", &self.base_url)
            .field("email", &self.email)
            .field("upstream", &self.upstream)
            .field("config_path", &self.config_path)
            .field("service_command", &self.service_command)
            .field("port", &self.port)
            .field("phases", &self.phases)
            .finish_non_exhaustive()
    }
}

impl HarnessConfig {
    /// `root` の設定を解決する
    pub fn load(root: &Path, overrides: ConfigOverrides) -> Result<Self, ConfigError> {
        let env = EnvSource::load(root)?;
        Self::resolve(root, &env, overrides)
    }

    /// 明示的な [`EnvSource`] から解決する
    pub fn resolve(
        root: &Path,
        env: &EnvSource,
        overrides: ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let port = overrides.port.unwrap_or(8080);
        let base_url = overrides
            .base_url
            .or_else(|| env.pick(&["GATEWAY_BASE_URL"]))
            .unwrap_or_else(|| format!("http://localhost:{}", port))
            .trim_end_matches('/')
            .to_string();

        let service_command = match overrides.service_command {
            Some(cmd) => split_command(&cmd)?,
            None => vec![root
                .join("target")
                .join("debug")
                .join("gateway")
                .to_string_lossy()
                .into_owned()],
        };
        let build_command = overrides
            .build_command
            .map(|cmd| split_command(&cmd))
            .transpose()?;

        let phases = match overrides.phases {
            Some(spec) => parse_phases(&spec).map_err(|e| ConfigError::Invalid(e.to_string()))?,
            None => Phase::defaults(),
        };

        let mut health_path = overrides.health_path.unwrap_or_else(|| "/auth/me".to_string());
        if !health_path.starts_with('/') {
            health_path.insert(0, '/');
        }

        Ok(Self {
            root: root.to_path_buf(),
            base_url,
            email: env.pick(&["EMAIL"]).unwrap_or_default(),
            password: env.pick(&["PASSWORD"]).unwrap_or_default(),
            bootstrap_code: env.pick(&["GATEWAY_BOOTSTRAP_CODE"]),
            upstream: UpstreamSettings::from_env(env),
            config_path: overrides
                .config_path
                .unwrap_or_else(|| root.join("custom-config.toml")),
            service_command,
            build_command,
            port,
            health_path,
            ready_timeout: Duration::from_secs(overrides.ready_timeout_secs.unwrap_or(180)),
            teardown_ready_timeout: TEARDOWN_READY_TIMEOUT,
            stop_grace: STOP_GRACE,
            log_poll: RetryPolicy::new(LOG_POLL_ATTEMPTS, LOG_POLL_DELAY),
            out_dir: overrides
                .out_dir
                .unwrap_or_else(|| root.join("target").join("lbverify")),
            scratch_dir: std::env::temp_dir(),
            phases,
            prefix_root: overrides.prefix_root.unwrap_or_else(|| "lbverify".to_string()),
        })
    }

    /// ヘルスエンドポイントのURL
    pub fn health_url(&self) -> String {
        format!("{}{}", self.base_url, self.health_path)
    }
}

fn split_command(cmd: &str) -> Result<Vec<String>, ConfigError> {
    let parts: Vec<String> = cmd.split_whitespace().map(str::to_string).collect();
    if parts.is_empty() {
        return Err(ConfigError::Invalid("command line is empty".to_string()));
    }
    Ok(parts)
}
