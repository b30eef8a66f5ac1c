use machro::{Auth, Database, Result, Value};

pub async fn main() -> Result<()> {
    let db = Database::from_env();
    let mut conn = db.connect(Auth::password("sys", "manager")).await?;

    conn.exec("DROP TABLE demo_tag", &[]).await.ok();
    conn.exec("CREATE TAG TABLE demo_tag (name VARCHAR(20) PRIMARY KEY, time DATETIME BASETIME, value DOUBLE SUMMARIZED)", &[]).await?;

    let mut appender = conn.appender_with("demo_tag", 1024).await?;
    for i in 0..2048i64 {
        let row = ["sensor-1".into(), Value::DateTime(i * 1_000_000), Value::Float64(i as f64)];
        appender.append(&row).await?;
    }
    let (count, result) = appender.close().await;
    result?;
    tracing::info!(success = count.success, fail = count.fail, "appended");

    conn.exec("DROP TABLE demo_log", &[]).await.ok();
    conn.exec("CREATE TABLE demo_log (name VARCHAR(20), value INTEGER)", &[]).await?;

    let mut appender = conn.appender("demo_log").await?.with_input_columns(&["value"])?;
    appender.append(&[1i32.into()]).await?;
    appender.flush().await?;
    let (count, result) = appender.close().await;
    result?;
    assert_eq!(count.success, 1);

    conn.exec("DROP TABLE demo_tag", &[]).await?;
    conn.exec("DROP TABLE demo_log", &[]).await?;
    conn.close().await?;
    Ok(())
}
