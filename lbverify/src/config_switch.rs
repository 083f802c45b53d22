//! 設定ファイルの strategy 書き換え
//!
//! `[load_balancing]` セクション内の `strategy = "..."` の値だけを書き換え、
//! 他の行・コメント・セクション境界はバイト単位で保持する。
//! 書き込んだ値はメモリに保持せず、読み出しは常にディスクから行う。

use crate::common::types::Strategy;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::debug;

/// 対象セクション名
pub const SECTION: &str = "load_balancing";
/// 対象キー名
pub const KEY: &str = "strategy";

static HEADER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(\[\[?)\s*([^\[\]]+?)\s*\]\]?\s*(?:#.*)?$").expect("valid regex")
});

static ASSIGNMENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^(\s*strategy\s*=\s*)(?:"[^"]*"|'[^']*')(\s*(?:#.*)?)$"#).expect("valid regex")
});

/// ConfigSwitcher のエラー型
#[derive(Debug, thiserror::Error)]
pub enum ConfigSwitchError {
    /// 設定ファイルが存在しない
    #[error("Config file not found: {0}")]
    Missing(PathBuf),

    /// 読み書きに失敗
    #[error("Config file I/O error ({path}): {source}")]
    Io {
        /// 対象パス
        path: PathBuf,
        /// 元のエラー
        #[source]
        source: std::io::Error,
    },

    /// TOML として解釈できない
    #[error("Config file is not valid TOML ({path}): {message}")]
    Parse {
        /// 対象パス
        path: PathBuf,
        /// パーサのメッセージ
        message: String,
    },

    /// strategy の値が未知
    #[error("Config file has unknown strategy '{0}'")]
    UnknownStrategy(String),
}

/// strategy スカラーの書き換えと復元
#[derive(Debug, Clone)]
pub struct ConfigSwitcher {
    path: PathBuf,
}

impl ConfigSwitcher {
    /// 対象ファイルを指定して作成する
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// 対象ファイルのパス
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_exists(&self) -> Result<(), ConfigSwitchError> {
        if self.path.is_file() {
            Ok(())
        } else {
            Err(ConfigSwitchError::Missing(self.path.clone()))
        }
    }

    fn io_error(&self, source: std::io::Error) -> ConfigSwitchError {
        ConfigSwitchError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// 現在の内容をそのまま取得する（`restore` 用）
    pub fn capture(&self) -> Result<String, ConfigSwitchError> {
        self.ensure_exists()?;
        std::fs::read_to_string(&self.path).map_err(|e| self.io_error(e))
    }

    /// strategy を書き換える
    pub fn set(&self, strategy: Strategy) -> Result<(), ConfigSwitchError> {
        let original = self.capture()?;
        let rewritten = rewrite_strategy(&original, strategy.as_str());
        std::fs::write(&self.path, rewritten).map_err(|e| self.io_error(e))?;
        debug!(path = %self.path.display(), strategy = %strategy, "Config strategy rewritten");
        Ok(())
    }

    /// `capture` で取得した内容を書き戻す
    pub fn restore(&self, original: &str) -> Result<(), ConfigSwitchError> {
        self.ensure_exists()?;
        std::fs::write(&self.path, original).map_err(|e| self.io_error(e))
    }

    /// ディスク上の strategy を読み出す（未設定なら `None`）
    pub fn current_strategy(&self) -> Result<Option<Strategy>, ConfigSwitchError> {
        let text = self.capture()?;
        let table: toml::Table = text.parse().map_err(|e: toml::de::Error| ConfigSwitchError::Parse {
            path: self.path.clone(),
            message: e.message().to_string(),
        })?;
        let value = table
            .get(SECTION)
            .and_then(|section| section.get(KEY))
            .and_then(|v| v.as_str());
        match value {
            Some(s) => s
                .parse()
                .map(Some)
                .map_err(|_| ConfigSwitchError::UnknownStrategy(s.to_string())),
            None => Ok(None),
        }
    }
}

fn split_line_ending(raw: &str) -> (&str, &str) {
    if let Some(body) = raw.strip_suffix("\r\n") {
        (body, "\r\n")
    } else if let Some(body) = raw.strip_suffix('\n') {
        (body, "\n")
    } else {
        (raw, "")
    }
}

/// ヘッダ行なら `(セクション名, 配列テーブルか)` を返す
fn section_header(body: &str) -> Option<(&str, bool)> {
    HEADER_RE.captures(body).map(|caps| {
        let name = caps.get(2).map_or("", |m| m.as_str());
        let is_array = caps.get(1).is_some_and(|m| m.as_str() == "[[");
        (name, is_array)
    })
}

/// `[load_balancing]` の strategy を `value` に書き換えたテキストを返す
///
/// - 既存の代入行は引用符内の値だけを置換する（インデント・行末コメント・改行コードは保持）
/// - セクション内に代入行がなければ、セクションの最後の設定行（空行・コメント以外）の直後に1行追加する
/// - セクション自体がなければファイル末尾にセクションごと追加する
pub fn rewrite_strategy(text: &str, value: &str) -> String {
    let eol = if text.contains("\r\n") { "\r\n" } else { "\n" };
    let assignment = format!("{} = \"{}\"{}", KEY, value, eol);

    let mut out: Vec<String> = Vec::new();
    let mut in_section = false;
    let mut seen_section = false;
    let mut replaced = false;
    // セクション内の最後の非空行の直後（out のインデックス）
    let mut insert_at = 0usize;

    for raw in text.split_inclusive('\n') {
        let (body, ending) = split_line_ending(raw);

        if let Some((name, is_array)) = section_header(body) {
            if in_section && !replaced {
                out.insert(insert_at, assignment.clone());
                replaced = true;
            }
            in_section = !is_array && name == SECTION;
            out.push(raw.to_string());
            if in_section {
                seen_section = true;
                insert_at = out.len();
            }
            continue;
        }

        if in_section {
            if let Some(caps) = ASSIGNMENT_RE.captures(body) {
                out.push(format!("{}\"{}\"{}{}", &caps[1], value, &caps[2], ending));
                replaced = true;
                insert_at = out.len();
                continue;
            }
            out.push(raw.to_string());
            // コメント行は次のセクションの見出しとして扱う
            let trimmed = body.trim();
            if !trimmed.is_empty() && !trimmed.starts_with('#') {
                insert_at = out.len();
            }
            continue;
        }

        out.push(raw.to_string());
    }

    if in_section && !replaced {
        if insert_at == out.len() {
            terminate_last_line(&mut out, eol);
        }
        out.insert(insert_at, assignment);
    } else if !seen_section {
        terminate_last_line(&mut out, eol);
        if !out.is_empty() {
            out.push(eol.to_string());
        }
        out.push(format!("[{}]{}", SECTION, eol));
        out.push(assignment);
    }

    out.concat()
}

fn terminate_last_line(out: &mut [String], eol: &str) {
    if let Some(last) = out.last_mut() {
        if !last.ends_with('\n') {
            last.push_str(eol);
        }
    }
}
