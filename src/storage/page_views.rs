use crate::error::{AppError, AppResult};
use crate::types::{CountEntry, PageViewSummary, ProcessedPageView};
use deadpool_sqlite::Pool;
use rusqlite::{params, Connection};

/// Batch-write page views to SQLite in a single transaction.
pub async fn write_page_views(
    pool: &Pool,
    views: Vec<ProcessedPageView>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if views.is_empty() {
        return Ok(());
    }

    let conn = pool.get().await?;
    conn.interact(move |conn| {
        let tx = conn.transaction()?;
        insert_views(&tx, &views)?;
        tx.commit()?;
        tracing::debug!(count = views.len(), "flushed page views to sqlite");
        Ok::<_, rusqlite::Error>(())
    })
    .await
    .map_err(|e| format!("interact error: {e}"))??;

    Ok(())
}

fn insert_views(conn: &Connection, views: &[ProcessedPageView]) -> rusqlite::Result<()> {
    let mut insert = conn.prepare_cached(
        "INSERT INTO page_views (
            store_id, session_id, referrer, utm_source, utm_params, received_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;

    for view in views {
        let e = &view.event;
        let utm_json = serde_json::to_string(&e.utm_params).unwrap_or_else(|_| "{}".to_string());
        insert.execute(params![
            e.store_id,
            e.session_id,
            e.referrer,
            e.utm_params.get("utm_source"),
            utm_json,
            view.received_at,
        ])?;
    }
    Ok(())
}

const TOP_N: i64 = 10;

fn top_values(
    conn: &Connection,
    column: &str,
    store_id: &str,
    since: i64,
) -> rusqlite::Result<Vec<CountEntry>> {
    let sql = format!(
        "SELECT {column}, COUNT(*) AS n FROM page_views
         WHERE store_id = ?1 AND received_at >= ?2 AND {column} IS NOT NULL AND {column} != ''
         GROUP BY {column} ORDER BY n DESC, {column} LIMIT ?3"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![store_id, since, TOP_N], |row| {
            Ok(CountEntry {
                value: row.get(0)?,
                count: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Roll up page views for `store_id` received at or after `since` (unix millis).
pub fn summarize(conn: &Connection, store_id: &str, since: i64) -> rusqlite::Result<PageViewSummary> {
    let (total_views, unique_sessions): (i64, i64) = conn.query_row(
        "SELECT COUNT(*), COUNT(DISTINCT session_id) FROM page_views
         WHERE store_id = ?1 AND received_at >= ?2",
        params![store_id, since],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    Ok(PageViewSummary {
        store_id: store_id.to_string(),
        since,
        total_views,
        unique_sessions,
        top_referrers: top_values(conn, "referrer", store_id, since)?,
        top_utm_sources: top_values(conn, "utm_source", store_id, since)?,
    })
}

pub async fn page_view_summary(pool: &Pool, store_id: &str, since: i64) -> AppResult<PageViewSummary> {
    let conn = pool
        .get()
        .await
        .map_err(|e| AppError::Internal(format!("pool error: {e}")))?;

    let store_id = store_id.to_string();
    let summary = conn
        .interact(move |conn| summarize(conn, &store_id, since))
        .await
        .map_err(|e| AppError::Internal(format!("interact error: {e}")))??;

    Ok(summary)
}
