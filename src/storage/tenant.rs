//! Tenant data: the storefront aggregate loader and the dashboard writes that
//! change it.
//!
//! Writes return the slug(s) whose cached storefront is now stale. Callers
//! invalidate those after the write returns, never before.

use crate::error::{AppError, AppResult};
use crate::types::{
    CreateStore, DesignCustomization, Product, SocialLink, StoreProfile, StorefrontData,
    UpdateDesign, UpdateStore, UpsertProduct,
};
use deadpool_sqlite::Pool;
use rusqlite::{params, Connection, OptionalExtension};

fn store_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoreProfile> {
    Ok(StoreProfile {
        id: row.get(0)?,
        slug: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        logo_url: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

const STORE_COLUMNS: &str = "id, slug, name, description, logo_url, created_at, updated_at";

fn query_store(conn: &Connection, slug: &str) -> rusqlite::Result<Option<StoreProfile>> {
    conn.query_row(
        &format!("SELECT {STORE_COLUMNS} FROM stores WHERE slug = ?1"),
        params![slug],
        store_from_row,
    )
    .optional()
}

fn query_products(conn: &Connection, store_id: &str) -> rusqlite::Result<Vec<Product>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, name, description, price_cents, currency, image_url, position
         FROM products WHERE store_id = ?1 AND visible = 1
         ORDER BY position, id",
    )?;
    let rows = stmt
        .query_map(params![store_id], |row| {
            Ok(Product {
                id: row.get(0)?,
                name: row.get(1)?,
                description: row.get(2)?,
                price_cents: row.get(3)?,
                currency: row.get(4)?,
                image_url: row.get(5)?,
                position: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn query_social_links(conn: &Connection, store_id: &str) -> rusqlite::Result<Vec<SocialLink>> {
    let mut stmt = conn.prepare_cached(
        "SELECT platform, url FROM social_links WHERE store_id = ?1 ORDER BY position, platform",
    )?;
    let rows = stmt
        .query_map(params![store_id], |row| {
            Ok(SocialLink {
                platform: row.get(0)?,
                url: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn query_design(conn: &Connection, store_id: &str) -> rusqlite::Result<Option<DesignCustomization>> {
    let row: Option<(String, i64)> = conn
        .query_row(
            "SELECT settings, updated_at FROM design_settings WHERE store_id = ?1",
            params![store_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    Ok(row.map(|(settings, updated_at)| DesignCustomization {
        // Rows are only written through `update_design`, which stores valid JSON.
        settings: serde_json::from_str(&settings).unwrap_or(serde_json::Value::Null),
        updated_at,
    }))
}

/// Load the public aggregate for `slug`. `Ok(None)` when no such store exists.
///
/// All four reads run in one transaction so the snapshot is consistent.
pub async fn load_storefront(pool: &Pool, slug: &str) -> AppResult<Option<StorefrontData>> {
    let conn = pool
        .get()
        .await
        .map_err(|e| AppError::Internal(format!("pool error: {e}")))?;

    let slug = slug.to_string();
    let data = conn
        .interact(move |conn| {
            let tx = conn.transaction()?;
            let Some(store) = query_store(&tx, &slug)? else {
                return Ok(None);
            };
            let products = query_products(&tx, &store.id)?;
            let social_links = query_social_links(&tx, &store.id)?;
            let design = query_design(&tx, &store.id)?;
            tx.commit()?;
            Ok::<_, rusqlite::Error>(Some(StorefrontData {
                store,
                products,
                social_links,
                design,
            }))
        })
        .await
        .map_err(|e| AppError::Internal(format!("interact error: {e}")))??;

    Ok(data)
}

/// Resolve a slug to its store id.
pub async fn store_id_for_slug(pool: &Pool, slug: &str) -> AppResult<Option<String>> {
    let conn = pool
        .get()
        .await
        .map_err(|e| AppError::Internal(format!("pool error: {e}")))?;

    let slug = slug.to_string();
    let id = conn
        .interact(move |conn| {
            conn.query_row(
                "SELECT id FROM stores WHERE slug = ?1",
                params![slug],
                |row| row.get::<_, String>(0),
            )
            .optional()
        })
        .await
        .map_err(|e| AppError::Internal(format!("interact error: {e}")))??;

    Ok(id)
}

fn map_unique_violation(e: rusqlite::Error) -> AppError {
    if e.to_string().contains("UNIQUE constraint failed") {
        AppError::Conflict("a store with that slug already exists".to_string())
    } else {
        AppError::Database(e)
    }
}

fn not_found(e: rusqlite::Error) -> AppError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => AppError::NotFound("store not found".to_string()),
        _ => map_unique_violation(e),
    }
}

pub async fn create_store(pool: &Pool, input: CreateStore) -> AppResult<StoreProfile> {
    let now = chrono::Utc::now().timestamp();
    let store = StoreProfile {
        id: uuid::Uuid::new_v4().to_string(),
        slug: input.slug,
        name: input.name,
        description: input.description,
        logo_url: input.logo_url,
        created_at: now,
        updated_at: now,
    };

    let conn = pool
        .get()
        .await
        .map_err(|e| AppError::Internal(format!("pool error: {e}")))?;

    let s = store.clone();
    conn.interact(move |conn| {
        conn.execute(
            "INSERT INTO stores (id, slug, name, description, logo_url, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![s.id, s.slug, s.name, s.description, s.logo_url, s.created_at, s.updated_at],
        )
    })
    .await
    .map_err(|e| AppError::Internal(format!("interact error: {e}")))?
    .map_err(map_unique_violation)?;

    Ok(store)
}

/// Apply a profile update. Returns the stored profile and the slug it had
/// before the update (differs from `profile.slug` on rename).
pub async fn update_store(
    pool: &Pool,
    slug: &str,
    input: UpdateStore,
) -> AppResult<(StoreProfile, String)> {
    let conn = pool
        .get()
        .await
        .map_err(|e| AppError::Internal(format!("pool error: {e}")))?;

    let old_slug = slug.to_string();
    let s = old_slug.clone();
    let now = chrono::Utc::now().timestamp();

    let profile = conn
        .interact(move |conn| {
            let tx = conn.transaction()?;
            let updated = tx.execute(
                "UPDATE stores SET
                    slug        = COALESCE(?1, slug),
                    name        = COALESCE(?2, name),
                    description = COALESCE(?3, description),
                    logo_url    = COALESCE(?4, logo_url),
                    updated_at  = ?5
                 WHERE slug = ?6",
                params![input.slug, input.name, input.description, input.logo_url, now, s],
            )?;
            if updated == 0 {
                return Err(rusqlite::Error::QueryReturnedNoRows);
            }
            let new_slug = input.slug.unwrap_or(s);
            let profile = tx.query_row(
                &format!("SELECT {STORE_COLUMNS} FROM stores WHERE slug = ?1"),
                params![new_slug],
                store_from_row,
            )?;
            tx.commit()?;
            Ok(profile)
        })
        .await
        .map_err(|e| AppError::Internal(format!("interact error: {e}")))?
        .map_err(not_found)?;

    Ok((profile, old_slug))
}

/// Insert or replace one product of the store at `slug`.
pub async fn upsert_product(
    pool: &Pool,
    slug: &str,
    product_id: &str,
    input: UpsertProduct,
) -> AppResult<()> {
    let conn = pool
        .get()
        .await
        .map_err(|e| AppError::Internal(format!("pool error: {e}")))?;

    let s = slug.to_string();
    let pid = product_id.to_string();
    let now = chrono::Utc::now().timestamp();

    conn.interact(move |conn| {
        let tx = conn.transaction()?;
        let store_id: String = tx.query_row(
            "SELECT id FROM stores WHERE slug = ?1",
            params![s],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO products (
                id, store_id, name, description, price_cents, currency,
                image_url, visible, position, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
             ON CONFLICT (store_id, id) DO UPDATE SET
                name        = excluded.name,
                description = excluded.description,
                price_cents = excluded.price_cents,
                currency    = excluded.currency,
                image_url   = excluded.image_url,
                visible     = excluded.visible,
                position    = excluded.position,
                updated_at  = excluded.updated_at",
            params![
                pid,
                store_id,
                input.name,
                input.description,
                input.price_cents,
                input.currency.unwrap_or_else(|| "USD".to_string()),
                input.image_url,
                input.visible.unwrap_or(true),
                input.position.unwrap_or(0),
                now,
            ],
        )?;
        touch_store(&tx, &store_id, now)?;
        tx.commit()
    })
    .await
    .map_err(|e| AppError::Internal(format!("interact error: {e}")))?
    .map_err(not_found)?;

    Ok(())
}

/// Delete a product. `NotFound` when either the store or the product is missing.
pub async fn delete_product(pool: &Pool, slug: &str, product_id: &str) -> AppResult<()> {
    let conn = pool
        .get()
        .await
        .map_err(|e| AppError::Internal(format!("pool error: {e}")))?;

    let s = slug.to_string();
    let pid = product_id.to_string();
    let now = chrono::Utc::now().timestamp();

    let deleted = conn
        .interact(move |conn| {
            let tx = conn.transaction()?;
            let store_id: String = tx.query_row(
                "SELECT id FROM stores WHERE slug = ?1",
                params![s],
                |row| row.get(0),
            )?;
            let deleted = tx.execute(
                "DELETE FROM products WHERE store_id = ?1 AND id = ?2",
                params![store_id, pid],
            )?;
            if deleted > 0 {
                touch_store(&tx, &store_id, now)?;
            }
            tx.commit()?;
            Ok(deleted)
        })
        .await
        .map_err(|e| AppError::Internal(format!("interact error: {e}")))?
        .map_err(not_found)?;

    if deleted == 0 {
        return Err(AppError::NotFound("product not found".to_string()));
    }
    Ok(())
}

/// Replace the full set of social links, keeping the given order.
pub async fn replace_social_links(
    pool: &Pool,
    slug: &str,
    links: Vec<SocialLink>,
) -> AppResult<()> {
    let conn = pool
        .get()
        .await
        .map_err(|e| AppError::Internal(format!("pool error: {e}")))?;

    let s = slug.to_string();
    let now = chrono::Utc::now().timestamp();

    conn.interact(move |conn| {
        let tx = conn.transaction()?;
        let store_id: String = tx.query_row(
            "SELECT id FROM stores WHERE slug = ?1",
            params![s],
            |row| row.get(0),
        )?;
        tx.execute(
            "DELETE FROM social_links WHERE store_id = ?1",
            params![store_id],
        )?;
        {
            let mut insert = tx.prepare_cached(
                "INSERT OR REPLACE INTO social_links (store_id, platform, url, position)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (position, link) in links.iter().enumerate() {
                insert.execute(params![store_id, link.platform, link.url, position as i64])?;
            }
        }
        touch_store(&tx, &store_id, now)?;
        tx.commit()
    })
    .await
    .map_err(|e| AppError::Internal(format!("interact error: {e}")))?
    .map_err(not_found)?;

    Ok(())
}

pub async fn update_design(pool: &Pool, slug: &str, input: UpdateDesign) -> AppResult<()> {
    let settings = serde_json::to_string(&input.settings)
        .map_err(|e| AppError::Internal(format!("serialize design: {e}")))?;

    let conn = pool
        .get()
        .await
        .map_err(|e| AppError::Internal(format!("pool error: {e}")))?;

    let s = slug.to_string();
    let now = chrono::Utc::now().timestamp();

    conn.interact(move |conn| {
        let tx = conn.transaction()?;
        let store_id: String = tx.query_row(
            "SELECT id FROM stores WHERE slug = ?1",
            params![s],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO design_settings (store_id, settings, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (store_id) DO UPDATE SET
                settings   = excluded.settings,
                updated_at = excluded.updated_at",
            params![store_id, settings, now],
        )?;
        touch_store(&tx, &store_id, now)?;
        tx.commit()
    })
    .await
    .map_err(|e| AppError::Internal(format!("interact error: {e}")))?
    .map_err(not_found)?;

    Ok(())
}

fn touch_store(conn: &Connection, store_id: &str, now: i64) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE stores SET updated_at = ?1 WHERE id = ?2",
        params![now, store_id],
    )?;
    Ok(())
}
