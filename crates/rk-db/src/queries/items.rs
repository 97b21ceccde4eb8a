//! Item CRUD, windowed listing, and counting.
//!
//! Listing orders by the requested sort key and always ends with `id`, so
//! consecutive `LIMIT/OFFSET` windows tile the result set exactly. Each sort
//! key has a matching `(library_id, ...)` index created in the migrations.

use std::collections::HashSet;

use rk_core::{ItemId, LibraryId, MatchStatus, Result, SortKey};
use rusqlite::types::ToSql;
use rusqlite::{Connection, OptionalExtension};

use crate::error::sql_err;
use crate::models::{sort_title, Item, ItemFilter, NewItem};

/// Column list used in SELECT statements.
const COLS: &str = "id, library_id, file_path, title, sort_title, original_title, year,
    runtime_minutes, overview, genres, match_status, external_ids, created_at, updated_at";

fn order_clause(sort: SortKey) -> &'static str {
    match sort {
        SortKey::Title => "sort_title ASC, id ASC",
        SortKey::Year => "year ASC, sort_title ASC, id ASC",
        SortKey::Added => "created_at ASC, id ASC",
    }
}

/// Append `AND ...` conditions for `filter`, pushing their parameters.
fn filter_clause(filter: &ItemFilter, params: &mut Vec<Box<dyn ToSql>>) -> String {
    let mut sql = String::new();
    if let Some(status) = filter.match_status {
        params.push(Box::new(status.as_str()));
        sql.push_str(&format!(" AND match_status = ?{}", params.len()));
    }
    if let Some(ref needle) = filter.title_contains {
        params.push(Box::new(needle.trim().to_lowercase()));
        sql.push_str(&format!(" AND instr(lower(title), ?{}) > 0", params.len()));
    }
    sql
}

/// Create a new, unmatched item.
pub fn create_item(conn: &Connection, new: &NewItem) -> Result<Item> {
    let now = super::timestamp();
    let sort = sort_title(&new.title);

    conn.execute(
        "INSERT INTO items (library_id, file_path, title, sort_title, year, match_status,
            created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        rusqlite::params![
            new.library_id.get(),
            new.file_path,
            new.title,
            sort,
            new.year,
            MatchStatus::Unmatched.as_str(),
            &now,
        ],
    )
    .map_err(sql_err)?;

    Ok(Item {
        id: ItemId::new(conn.last_insert_rowid()),
        library_id: new.library_id,
        file_path: new.file_path.clone(),
        title: new.title.clone(),
        sort_title: sort,
        original_title: None,
        year: new.year,
        runtime_minutes: None,
        overview: None,
        genres: Vec::new(),
        match_status: MatchStatus::Unmatched,
        external_ids: Default::default(),
        created_at: now.clone(),
        updated_at: now,
    })
}

/// Get an item by ID.
pub fn get_item(conn: &Connection, id: ItemId) -> Result<Option<Item>> {
    let q = format!("SELECT {COLS} FROM items WHERE id = ?1");
    let result = conn.query_row(&q, [id.get()], Item::from_row);
    match result {
        Ok(i) => Ok(Some(i)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(sql_err(e)),
    }
}

/// Get a library's item by its file path. Libraries with overlapping roots
/// each own their own row for a shared file.
pub fn get_item_by_path(
    conn: &Connection,
    library_id: LibraryId,
    file_path: &str,
) -> Result<Option<Item>> {
    let q = format!("SELECT {COLS} FROM items WHERE library_id = ?1 AND file_path = ?2");
    conn.query_row(&q, rusqlite::params![library_id.get(), file_path], Item::from_row)
        .optional()
        .map_err(sql_err)
}

/// Update every mutable field of an item and bump `updated_at`.
pub fn update_item(conn: &Connection, item: &Item) -> Result<bool> {
    let now = super::timestamp();
    let genres = serde_json::to_string(&item.genres)
        .map_err(|e| rk_core::Error::Internal(format!("encode genres: {e}")))?;
    let external_ids = serde_json::to_string(&item.external_ids)
        .map_err(|e| rk_core::Error::Internal(format!("encode external ids: {e}")))?;

    let n = conn
        .execute(
            "UPDATE items SET title=?1, sort_title=?2, original_title=?3, year=?4,
                runtime_minutes=?5, overview=?6, genres=?7, match_status=?8,
                external_ids=?9, updated_at=?10
             WHERE id=?11",
            rusqlite::params![
                item.title,
                item.sort_title,
                item.original_title,
                item.year,
                item.runtime_minutes,
                item.overview,
                genres,
                item.match_status.as_str(),
                external_ids,
                now,
                item.id.get(),
            ],
        )
        .map_err(sql_err)?;
    Ok(n > 0)
}

/// Delete an item by ID. Credits, artwork and subtitles cascade; history
/// rows keep a NULL item reference.
pub fn delete_item(conn: &Connection, id: ItemId) -> Result<bool> {
    let n = conn
        .execute("DELETE FROM items WHERE id = ?1", [id.get()])
        .map_err(sql_err)?;
    Ok(n > 0)
}

/// One ordered window of a library's items.
pub fn list_window(
    conn: &Connection,
    library_id: LibraryId,
    sort: SortKey,
    filter: &ItemFilter,
    offset: i64,
    limit: i64,
) -> Result<Vec<Item>> {
    let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(library_id.get())];
    let conditions = filter_clause(filter, &mut params);
    params.push(Box::new(limit));
    let limit_idx = params.len();
    params.push(Box::new(offset));
    let offset_idx = params.len();

    let q = format!(
        "SELECT {COLS} FROM items WHERE library_id = ?1{conditions}
         ORDER BY {} LIMIT ?{limit_idx} OFFSET ?{offset_idx}",
        order_clause(sort)
    );

    let mut stmt = conn.prepare_cached(&q).map_err(sql_err)?;
    let params_refs: Vec<&dyn ToSql> = params.iter().map(|b| b.as_ref()).collect();
    let rows = stmt
        .query_map(params_refs.as_slice(), Item::from_row)
        .map_err(sql_err)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(sql_err)?;
    Ok(rows)
}

/// Number of items in a library matching `filter`.
pub fn count_items(conn: &Connection, library_id: LibraryId, filter: &ItemFilter) -> Result<u64> {
    let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(library_id.get())];
    let conditions = filter_clause(filter, &mut params);
    let q = format!("SELECT COUNT(*) FROM items WHERE library_id = ?1{conditions}");

    let params_refs: Vec<&dyn ToSql> = params.iter().map(|b| b.as_ref()).collect();
    let n: i64 = conn
        .query_row(&q, params_refs.as_slice(), |row| row.get(0))
        .map_err(sql_err)?;
    Ok(n.max(0) as u64)
}

/// All file paths already known for a library.
pub fn list_file_paths(conn: &Connection, library_id: LibraryId) -> Result<HashSet<String>> {
    let mut stmt = conn
        .prepare("SELECT file_path FROM items WHERE library_id = ?1")
        .map_err(sql_err)?;
    let paths = stmt
        .query_map([library_id.get()], |row| row.get::<_, String>(0))
        .map_err(sql_err)?
        .collect::<std::result::Result<HashSet<_>, _>>()
        .map_err(sql_err)?;
    Ok(paths)
}
