use futures::StreamExt;
use machro::{Auth, Database, Result, Value, types::Json};
use time::OffsetDateTime;

#[derive(Debug, serde::Deserialize)]
struct Payload {
    unit: String,
}

pub async fn main() -> Result<()> {
    let db = Database::from_env();
    let mut conn = db.connect(Auth::password("sys", "manager")).await?;

    // Execute

    conn.exec("DROP TABLE demo", &[]).await.ok();
    let res = conn.exec("CREATE TABLE demo (id INTEGER, name VARCHAR(20), ts DATETIME, meta JSON)", &[]).await?;
    assert_eq!(res.message(), "Created successfully.");

    let meta = serde_json::json!({ "unit": "celsius" });
    let res = conn
        .exec(
            "INSERT INTO demo VALUES (?, ?, ?, ?)",
            &[1i32.into(), "Deez".into(), OffsetDateTime::now_utc().into(), Json(meta).into()],
        )
        .await?;
    assert_eq!(res.rows_affected(), 1);

    conn.exec("INSERT INTO demo VALUES (2, 'Foo', now, NULL)", &[]).await?;

    // Queries

    let row = conn.query_row("SELECT id, name, ts, meta FROM demo WHERE id = ?", &[1i32.into()]).await?;
    let (id, name, _ts, meta) = row.decode::<(i32, String, OffsetDateTime, Json<Payload>)>()?;
    assert_eq!((id, name.as_str(), meta.0.unit.as_str()), (1, "Deez", "celsius"));

    let err = conn.query_row("SELECT id FROM demo WHERE id = ?", &[Value::Int32(99)]).await.unwrap_err();
    assert!(err.is_row_not_found());

    let rows = conn.query("SELECT id, name FROM demo ORDER BY id", &[]).await?;
    tracing::info!("{}", rows.message());
    let names = rows
        .map(|row| row.try_get::<_, String>("NAME"))
        .collect::<Vec<_>>()
        .await;
    assert_eq!(names.len(), 2);

    // Prepared

    let mut stmt = conn.prepare("SELECT name FROM demo WHERE id = ?").await?;
    for id in [1i32, 2] {
        let mut rows = stmt.query(&[id.into()]).await?;
        while let Some((name,)) = rows.next_as::<(String,)>() {
            tracing::info!(id, name = %name);
        }
    }
    stmt.close().await?;

    tracing::info!("{}", conn.explain("SELECT * FROM demo", false).await?);

    conn.exec("DROP TABLE demo", &[]).await?;
    conn.close().await?;
    Ok(())
}
