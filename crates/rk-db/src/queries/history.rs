//! Append-only audit trail of item mutations.

use rk_core::{HistoryEventId, ItemId, Result};
use rusqlite::{Connection, OptionalExtension};

use crate::error::sql_err;
use crate::models::{HistoryEvent, NewHistoryEvent};

const COLS: &str = "id, item_id, job_id, action, detail, created_at";

/// Record one history event.
pub fn record_event(conn: &Connection, new: &NewHistoryEvent) -> Result<HistoryEvent> {
    let now = super::timestamp();
    conn.execute(
        "INSERT INTO history_events (item_id, job_id, action, detail, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            new.item_id.map(|id| id.get()),
            new.job_id.map(|id| id.to_string()),
            new.action,
            new.detail,
            &now,
        ],
    )
    .map_err(sql_err)?;

    Ok(HistoryEvent {
        id: HistoryEventId::new(conn.last_insert_rowid()),
        item_id: new.item_id,
        job_id: new.job_id,
        action: new.action.clone(),
        detail: new.detail.clone(),
        created_at: now,
    })
}

pub fn get_event(conn: &Connection, id: HistoryEventId) -> Result<Option<HistoryEvent>> {
    let q = format!("SELECT {COLS} FROM history_events WHERE id = ?1");
    conn.query_row(&q, [id.get()], HistoryEvent::from_row)
        .optional()
        .map_err(sql_err)
}

/// Only the free-text detail of a history row may change.
pub fn update_event_detail(conn: &Connection, event: &HistoryEvent) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE history_events SET detail = ?1 WHERE id = ?2",
            rusqlite::params![event.detail, event.id.get()],
        )
        .map_err(sql_err)?;
    Ok(n > 0)
}

pub fn delete_event(conn: &Connection, id: HistoryEventId) -> Result<bool> {
    let n = conn
        .execute("DELETE FROM history_events WHERE id = ?1", [id.get()])
        .map_err(sql_err)?;
    Ok(n > 0)
}

/// History of an item, oldest first.
pub fn list_for_item(conn: &Connection, item_id: ItemId) -> Result<Vec<HistoryEvent>> {
    let q = format!("SELECT {COLS} FROM history_events WHERE item_id = ?1 ORDER BY id");
    let mut stmt = conn.prepare(&q).map_err(sql_err)?;
    let rows = stmt
        .query_map([item_id.get()], HistoryEvent::from_row)
        .map_err(sql_err)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(sql_err)?;
    Ok(rows)
}

/// Total number of history rows.
pub fn count_events(conn: &Connection) -> Result<u64> {
    let n: i64 = conn
        .query_row("SELECT COUNT(*) FROM history_events", [], |row| row.get(0))
        .map_err(sql_err)?;
    Ok(n.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewItem;
    use crate::pool::init_memory_pool;
    use crate::queries::{items, libraries};
    use rk_core::JobId;

    #[test]
    fn history_survives_item_removal() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        let lib = libraries::create_library(&conn, "Movies", "/m").unwrap();
        let item = items::create_item(
            &conn,
            &NewItem {
                library_id: lib.id,
                file_path: "/m/heat.mkv".into(),
                title: "Heat".into(),
                year: None,
            },
        )
        .unwrap();

        let job_id = JobId::new();
        let event = record_event(
            &conn,
            &NewHistoryEvent::new(item.id, Some(job_id), "matched").with_detail("tmdb:949"),
        )
        .unwrap();
        assert_eq!(list_for_item(&conn, item.id).unwrap(), vec![event.clone()]);

        items::delete_item(&conn, item.id).unwrap();
        let kept = get_event(&conn, event.id).unwrap().unwrap();
        assert_eq!(kept.item_id, None);
        assert_eq!(kept.job_id, Some(job_id));
        assert_eq!(count_events(&conn).unwrap(), 1);
    }
}
