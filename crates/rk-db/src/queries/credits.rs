//! Cast and crew rows owned by an item.

use rk_core::{ItemId, Result};
use rusqlite::{Connection, OptionalExtension};

use crate::error::sql_err;
use crate::models::{Credit, NewCredit};

const COLS: &str = "id, item_id, name, role, part, ordinal";

/// Insert one credit row.
pub fn create_credit(conn: &Connection, new: &NewCredit) -> Result<Credit> {
    conn.execute(
        "INSERT INTO credits (item_id, name, role, part, ordinal) VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            new.item_id.get(),
            new.name,
            new.role.as_str(),
            new.part,
            new.ordinal
        ],
    )
    .map_err(sql_err)?;

    Ok(Credit {
        id: conn.last_insert_rowid(),
        item_id: new.item_id,
        name: new.name.clone(),
        role: new.role,
        part: new.part.clone(),
        ordinal: new.ordinal,
    })
}

pub fn get_credit(conn: &Connection, id: i64) -> Result<Option<Credit>> {
    let q = format!("SELECT {COLS} FROM credits WHERE id = ?1");
    conn.query_row(&q, [id], Credit::from_row)
        .optional()
        .map_err(sql_err)
}

pub fn update_credit(conn: &Connection, credit: &Credit) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE credits SET name=?1, role=?2, part=?3, ordinal=?4 WHERE id=?5",
            rusqlite::params![
                credit.name,
                credit.role.as_str(),
                credit.part,
                credit.ordinal,
                credit.id
            ],
        )
        .map_err(sql_err)?;
    Ok(n > 0)
}

pub fn delete_credit(conn: &Connection, id: i64) -> Result<bool> {
    let n = conn
        .execute("DELETE FROM credits WHERE id = ?1", [id])
        .map_err(sql_err)?;
    Ok(n > 0)
}

/// Credits of an item in billing order.
pub fn list_credits(conn: &Connection, item_id: ItemId) -> Result<Vec<Credit>> {
    let q = format!("SELECT {COLS} FROM credits WHERE item_id = ?1 ORDER BY ordinal, id");
    let mut stmt = conn.prepare(&q).map_err(sql_err)?;
    let rows = stmt
        .query_map([item_id.get()], Credit::from_row)
        .map_err(sql_err)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(sql_err)?;
    Ok(rows)
}

/// Replace all credits of an item. Call inside a transaction.
pub fn replace_credits(conn: &Connection, item_id: ItemId, credits: &[NewCredit]) -> Result<usize> {
    conn.execute("DELETE FROM credits WHERE item_id = ?1", [item_id.get()])
        .map_err(sql_err)?;
    for credit in credits {
        create_credit(
            conn,
            &NewCredit {
                item_id,
                ..credit.clone()
            },
        )?;
    }
    Ok(credits.len())
}
