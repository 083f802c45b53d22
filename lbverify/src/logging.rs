//! ロギング初期化
//!
//! フィルタの優先順位: `LBVERIFY_LOG_LEVEL`（旧名 `LOG_LEVEL`）> `RUST_LOG` > `info`
//!
//! stderr と実行ログ（任意）の両方に出力する。どちらの出力も1イベント単位で
//! `redact::redact_text` を通してから書き込む。

use crate::config::get_env_with_fallback;
use crate::redact::redact_text;
use std::io::{self, Write};
use std::path::Path;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const LOG_LEVEL_ENV: &str = "LBVERIFY_LOG_LEVEL";
const LEGACY_LOG_LEVEL_ENV: &str = "LOG_LEVEL";

/// 書き込み内容をバッファし、flush/drop 時にマスクしてから下位へ書くライタ
pub struct RedactingWriter<W: Write> {
    inner: W,
    buf: Vec<u8>,
}

impl<W: Write> RedactingWriter<W> {
    /// ライタを包む
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: Vec::new(),
        }
    }

    fn drain(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let text = String::from_utf8_lossy(&self.buf);
        let redacted = redact_text(&text);
        self.buf.clear();
        self.inner.write_all(redacted.as_bytes())
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.drain()?;
        self.inner.flush()
    }
}

impl<W: Write> Drop for RedactingWriter<W> {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// [`RedactingWriter`] を払い出す `MakeWriter`
pub struct RedactingMakeWriter<M> {
    inner: M,
}

impl<M> RedactingMakeWriter<M> {
    /// `MakeWriter` を包む
    pub fn new(inner: M) -> Self {
        Self { inner }
    }
}

impl<'a, M> MakeWriter<'a> for RedactingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer())
    }
}

fn build_env_filter() -> EnvFilter {
    if let Some(directives) = get_env_with_fallback(LOG_LEVEL_ENV, LEGACY_LOG_LEVEL_ENV) {
        if let Ok(filter) = EnvFilter::try_new(&directives) {
            return filter;
        }
    }
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    EnvFilter::new("info")
}

/// ロギングを初期化する
///
/// `run_log` を指定すると、ANSI なしの同内容をそのファイルにも書き出す。
/// 既に subscriber が設定済みの場合はエラーを返す（テストでは無視してよい）。
pub fn init(run_log: Option<&Path>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let stderr_layer = fmt::layer()
        .with_writer(RedactingMakeWriter::new(io::stderr))
        .with_target(false);

    let file_layer = match run_log {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(dir)?;
            let file_name = path.file_name().ok_or("run log path has no file name")?;
            let appender = tracing_appender::rolling::never(dir, file_name);
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(RedactingMakeWriter::new(appender)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(build_env_filter())
        .with(stderr_layer)
        .with(file_layer)
        .try_init()?;
    Ok(())
}
