//! Artwork rows owned by an item.

use rk_core::{ArtworkId, ArtworkKind, ItemId, Result};
use rusqlite::{Connection, OptionalExtension};

use crate::error::sql_err;
use crate::models::{Artwork, NewArtwork};

const COLS: &str =
    "id, item_id, kind, url, local_path, content_hash, width, height, provider, created_at";

/// Create an artwork row.
pub fn create_artwork(conn: &Connection, new: &NewArtwork) -> Result<Artwork> {
    let now = super::timestamp();
    conn.execute(
        "INSERT INTO artwork (item_id, kind, url, local_path, content_hash, width, height,
            provider, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        rusqlite::params![
            new.item_id.get(),
            new.kind.as_str(),
            new.url,
            new.local_path,
            new.content_hash,
            new.width,
            new.height,
            new.provider,
            &now,
        ],
    )
    .map_err(sql_err)?;

    Ok(Artwork {
        id: ArtworkId::new(conn.last_insert_rowid()),
        item_id: new.item_id,
        kind: new.kind,
        url: new.url.clone(),
        local_path: new.local_path.clone(),
        content_hash: new.content_hash.clone(),
        width: new.width,
        height: new.height,
        provider: new.provider.clone(),
        created_at: now,
    })
}

pub fn get_artwork(conn: &Connection, id: ArtworkId) -> Result<Option<Artwork>> {
    let q = format!("SELECT {COLS} FROM artwork WHERE id = ?1");
    conn.query_row(&q, [id.get()], Artwork::from_row)
        .optional()
        .map_err(sql_err)
}

pub fn update_artwork(conn: &Connection, artwork: &Artwork) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE artwork SET kind=?1, url=?2, local_path=?3, content_hash=?4, width=?5,
                height=?6, provider=?7
             WHERE id=?8",
            rusqlite::params![
                artwork.kind.as_str(),
                artwork.url,
                artwork.local_path,
                artwork.content_hash,
                artwork.width,
                artwork.height,
                artwork.provider,
                artwork.id.get(),
            ],
        )
        .map_err(sql_err)?;
    Ok(n > 0)
}

pub fn delete_artwork(conn: &Connection, id: ArtworkId) -> Result<bool> {
    let n = conn
        .execute("DELETE FROM artwork WHERE id = ?1", [id.get()])
        .map_err(sql_err)?;
    Ok(n > 0)
}

/// Remove every artwork row of one kind for an item.
pub fn delete_artwork_by_kind(conn: &Connection, item_id: ItemId, kind: ArtworkKind) -> Result<usize> {
    conn.execute(
        "DELETE FROM artwork WHERE item_id = ?1 AND kind = ?2",
        rusqlite::params![item_id.get(), kind.as_str()],
    )
    .map_err(sql_err)
}

/// All artwork of an item.
pub fn list_artwork(conn: &Connection, item_id: ItemId) -> Result<Vec<Artwork>> {
    let q = format!("SELECT {COLS} FROM artwork WHERE item_id = ?1 ORDER BY kind, id");
    let mut stmt = conn.prepare(&q).map_err(sql_err)?;
    let rows = stmt
        .query_map([item_id.get()], Artwork::from_row)
        .map_err(sql_err)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(sql_err)?;
    Ok(rows)
}
