use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use vf_core::domain::settings::ForgeSettings;
use vf_core::infra::queue::SqliteTaskQueue;
use vf_core::infra::storage::SqliteStore;
use vf_core::usecase::context::ForgeContext;

/// ログ初期化。`log` クレートの出力も tracing-log 経由で拾う。RUST_LOG で上書き可。
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn load_settings() -> anyhow::Result<ForgeSettings> {
    // 設定ファイルは VF_CONFIG、DB パスは VF_DB_PATH で上書き
    let config_path = std::env::var("VF_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("voiceforge.json"));
    let mut settings = ForgeSettings::load(&config_path)
        .with_context(|| format!("設定の読み込みに失敗: {}", config_path.display()))?;
    if let Ok(db_path) = std::env::var("VF_DB_PATH") {
        settings.storage.database_path = Some(PathBuf::from(db_path));
    }
    Ok(settings)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let settings = load_settings()?;

    let db_path = settings.storage.database_path();
    if let Some(dir) = db_path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("データディレクトリを作成できません: {}", dir.display()))?;
    }
    log::info!("DB: {}", db_path.display());

    let store = SqliteStore::open(&db_path).context("SQLite の初期化に失敗しました")?;
    let queue = SqliteTaskQueue::open(
        &db_path,
        Duration::from_secs(settings.worker.lease_secs),
        Duration::from_millis(settings.worker.poll_interval_ms),
    )
    .context("タスクキューの初期化に失敗しました")?;

    let ctx = ForgeContext::new(settings, Arc::new(store), Arc::new(queue))
        .context("ワーカーコンテキストの構築に失敗しました")?;

    for status in ctx.health().await.engines {
        if status.health.ready {
            log::info!("エンジン {} ({}) 準備完了", status.engine, status.health.backend);
        } else {
            log::warn!(
                "エンジン {} ({}) 未準備: {}",
                status.engine,
                status.health.backend,
                status.health.detail.unwrap_or_default()
            );
        }
    }

    ctx.start();
    tokio::signal::ctrl_c()
        .await
        .context("シグナルハンドラの登録に失敗しました")?;
    log::info!("停止シグナルを受信");
    ctx.shutdown().await;
    Ok(())
}
