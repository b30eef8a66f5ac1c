use machro::{Auth, Database, DecodeError, FromRow, Result, Row};
use tracing::{Instrument, trace_span};

pub async fn main() -> Result<()> {
    let db = Database::from_env();

    let handles = (0..48).map(|i| {
        let db = db.clone();
        tokio::spawn(async move {
            let mut conn = db.connect(Auth::password("sys", "manager")).await?;
            let result = if i % 6 == 0 {
                conn.exec("SELECT foo FROM bar", &[]).await.map(|_| ())
            } else {
                let row = conn.query_row("SELECT 1 FROM M$SYS_TABLES LIMIT 1", &[]).await?;
                row.decode::<FailRow>().map(|_| ()).map_err(Into::into)
            };
            conn.close().await?;
            result
        }.instrument(trace_span!("task", i)))
    });

    for h in handles {
        if let Err(err) = h.await.unwrap() {
            tracing::warn!("{err}");
        }
    }

    Ok(())
}

struct FailRow;

impl FromRow for FailRow {
    fn from_row(_: Row) -> Result<Self, DecodeError> {
        Err(DecodeError::IndexOutOfBounds(69))
    }
}
