use std::env::var;
use machro::{Auth, Database, Env, PoolConfig, Result};

pub async fn main() -> Result<()> {
    // raw handles
    let env = Env::new();
    let conn = env.connect(&var("MACHBASE_CONN").unwrap()).await?;
    let mut stmt = conn.alloc_stmt()?;
    stmt.exec_direct("SELECT 1 FROM M$SYS_TABLES LIMIT 1").await?;
    stmt.free().await?;
    conn.disconnect().await?;
    env.finalize().await?;

    // pooled
    let db = Database::from_env();
    let mut conn = db.connect(Auth::password("sys", "manager")).await?;
    conn.exec("SELECT 1 FROM M$SYS_TABLES LIMIT 1", &[]).await?;
    conn.close().await?;

    let elapsed = db.ping().await?;
    tracing::info!(?elapsed, "ping");

    let (ok, reason) = db.user_auth("sys", "wrong").await?;
    assert!(!ok, "{reason}");

    let db = PoolConfig::from_env().max_open_conn(2).trust_user("sys", "manager").open();
    let mut conn = db.connect(Auth::trust("sys")).await?;
    assert_eq!(db.max_open_conns(), (2, 1));
    conn.close().await?;
    db.close().await?;

    Ok(())
}
