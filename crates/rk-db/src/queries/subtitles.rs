//! Subtitle rows owned by an item.

use rk_core::{ItemId, Result, SubtitleId};
use rusqlite::{Connection, OptionalExtension};

use crate::error::sql_err;
use crate::models::{NewSubtitle, Subtitle};

const COLS: &str = "id, item_id, language, format, url, local_path, provider, created_at";

pub fn create_subtitle(conn: &Connection, new: &NewSubtitle) -> Result<Subtitle> {
    let now = super::timestamp();
    conn.execute(
        "INSERT INTO subtitles (item_id, language, format, url, local_path, provider, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            new.item_id.get(),
            new.language,
            new.format,
            new.url,
            new.local_path,
            new.provider,
            &now,
        ],
    )
    .map_err(sql_err)?;

    Ok(Subtitle {
        id: SubtitleId::new(conn.last_insert_rowid()),
        item_id: new.item_id,
        language: new.language.clone(),
        format: new.format.clone(),
        url: new.url.clone(),
        local_path: new.local_path.clone(),
        provider: new.provider.clone(),
        created_at: now,
    })
}

pub fn get_subtitle(conn: &Connection, id: SubtitleId) -> Result<Option<Subtitle>> {
    let q = format!("SELECT {COLS} FROM subtitles WHERE id = ?1");
    conn.query_row(&q, [id.get()], Subtitle::from_row)
        .optional()
        .map_err(sql_err)
}

pub fn update_subtitle(conn: &Connection, subtitle: &Subtitle) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE subtitles SET language=?1, format=?2, url=?3, local_path=?4, provider=?5
             WHERE id=?6",
            rusqlite::params![
                subtitle.language,
                subtitle.format,
                subtitle.url,
                subtitle.local_path,
                subtitle.provider,
                subtitle.id.get(),
            ],
        )
        .map_err(sql_err)?;
    Ok(n > 0)
}

pub fn delete_subtitle(conn: &Connection, id: SubtitleId) -> Result<bool> {
    let n = conn
        .execute("DELETE FROM subtitles WHERE id = ?1", [id.get()])
        .map_err(sql_err)?;
    Ok(n > 0)
}

/// Remove an item's subtitles in one language.
pub fn delete_subtitles_by_language(
    conn: &Connection,
    item_id: ItemId,
    language: &str,
) -> Result<usize> {
    conn.execute(
        "DELETE FROM subtitles WHERE item_id = ?1 AND language = ?2",
        rusqlite::params![item_id.get(), language],
    )
    .map_err(sql_err)
}

pub fn list_subtitles(conn: &Connection, item_id: ItemId) -> Result<Vec<Subtitle>> {
    let q = format!("SELECT {COLS} FROM subtitles WHERE item_id = ?1 ORDER BY language, id");
    let mut stmt = conn.prepare(&q).map_err(sql_err)?;
    let rows = stmt
        .query_map([item_id.get()], Subtitle::from_row)
        .map_err(sql_err)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(sql_err)?;
    Ok(rows)
}
