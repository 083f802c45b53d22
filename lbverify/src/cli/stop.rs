//! stop サブコマンド
//!
//! 指定ポートを LISTEN しているプロセスを停止します。

use crate::lock::{is_process_running, lock_dir, lock_path, read_lock_info};
use crate::process::{find_listening_pids, stop_by_port};
use clap::Args;
use std::time::Duration;

/// stop サブコマンドの引数
#[derive(Args, Debug, Clone)]
pub struct StopArgs {
    /// Port whose listeners should be stopped
    #[arg(short, long)]
    pub port: u16,

    /// Seconds to wait after SIGTERM before sending SIGKILL
    #[arg(short, long, default_value = "10")]
    pub timeout: u64,
}

/// stop コマンドを実行
pub async fn execute(args: &StopArgs) -> Result<(), anyhow::Error> {
    let port = args.port;

    // 検証実行中ならその旨を表示する（停止自体は行う）
    if let Some(info) = read_lock_info(&lock_path(&lock_dir(), port))? {
        if is_process_running(info.pid) {
            println!(
                "Note: a verification run (PID {}, started {}) holds the lock for port {}",
                info.pid, info.started_at, port
            );
        }
    }

    let pids = find_listening_pids(port).await;
    if pids.is_empty() {
        println!("No process listening on port {}", port);
        return Ok(());
    }

    let list: Vec<String> = pids.iter().map(u32::to_string).collect();
    println!("Stopping listeners on port {} (PID: {})...", port, list.join(", "));
    stop_by_port(port, Duration::from_secs(args.timeout)).await?;

    let remaining = find_listening_pids(port).await;
    if remaining.is_empty() {
        println!("Port {} released", port);
    } else {
        let list: Vec<String> = remaining.iter().map(u32::to_string).collect();
        println!(
            "Warning: port {} is still in use (PID: {}). You may need to kill it manually.",
            port,
            list.join(", ")
        );
    }
    Ok(())
}
