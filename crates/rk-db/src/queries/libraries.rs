//! Library CRUD operations.

use rk_core::{LibraryId, Result};
use rusqlite::{Connection, OptionalExtension};

use crate::error::sql_err;
use crate::models::Library;

const COLS: &str = "id, name, root_path, created_at";

/// Create a new library.
pub fn create_library(conn: &Connection, name: &str, root_path: &str) -> Result<Library> {
    let now = super::timestamp();
    conn.execute(
        "INSERT INTO libraries (name, root_path, created_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![name, root_path, &now],
    )
    .map_err(sql_err)?;

    Ok(Library {
        id: LibraryId::new(conn.last_insert_rowid()),
        name: name.to_string(),
        root_path: root_path.to_string(),
        created_at: now,
    })
}

/// Get a library by ID.
pub fn get_library(conn: &Connection, id: LibraryId) -> Result<Option<Library>> {
    let q = format!("SELECT {COLS} FROM libraries WHERE id = ?1");
    conn.query_row(&q, [id.get()], Library::from_row)
        .optional()
        .map_err(sql_err)
}

/// Get a library by its unique name.
pub fn get_library_by_name(conn: &Connection, name: &str) -> Result<Option<Library>> {
    let q = format!("SELECT {COLS} FROM libraries WHERE name = ?1");
    conn.query_row(&q, [name], Library::from_row)
        .optional()
        .map_err(sql_err)
}

/// List all libraries ordered by name.
pub fn list_libraries(conn: &Connection) -> Result<Vec<Library>> {
    let q = format!("SELECT {COLS} FROM libraries ORDER BY name ASC");
    let mut stmt = conn.prepare(&q).map_err(sql_err)?;
    let rows = stmt
        .query_map([], Library::from_row)
        .map_err(sql_err)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(sql_err)?;
    Ok(rows)
}

/// Rename or re-root a library.
pub fn update_library(conn: &Connection, library: &Library) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE libraries SET name = ?1, root_path = ?2 WHERE id = ?3",
            rusqlite::params![library.name, library.root_path, library.id.get()],
        )
        .map_err(sql_err)?;
    Ok(n > 0)
}

/// Delete a library. Its items cascade.
pub fn delete_library(conn: &Connection, id: LibraryId) -> Result<bool> {
    let n = conn
        .execute("DELETE FROM libraries WHERE id = ?1", [id.get()])
        .map_err(sql_err)?;
    Ok(n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::init_memory_pool;
    use rk_core::FailureKind;

    #[test]
    fn create_and_get() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();

        let lib = create_library(&conn, "Movies", "/media/movies").unwrap();
        let found = get_library(&conn, lib.id).unwrap().unwrap();
        assert_eq!(found, lib);

        let by_name = get_library_by_name(&conn, "Movies").unwrap().unwrap();
        assert_eq!(by_name.id, lib.id);
        assert!(get_library(&conn, LibraryId::new(999)).unwrap().is_none());
    }

    #[test]
    fn duplicate_name_is_constraint_violation() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();

        create_library(&conn, "Movies", "/a").unwrap();
        let err = create_library(&conn, "Movies", "/b").unwrap_err();
        assert_eq!(err.kind(), FailureKind::ConstraintViolation);
    }

    #[test]
    fn list_update_delete() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();

        let mut tv = create_library(&conn, "TV", "/tv").unwrap();
        create_library(&conn, "Anime", "/anime").unwrap();

        let names: Vec<_> = list_libraries(&conn)
            .unwrap()
            .into_iter()
            .map(|l| l.name)
            .collect();
        assert_eq!(names, vec!["Anime", "TV"]);

        tv.root_path = "/srv/tv".into();
        assert!(update_library(&conn, &tv).unwrap());
        assert_eq!(get_library(&conn, tv.id).unwrap().unwrap().root_path, "/srv/tv");

        assert!(delete_library(&conn, tv.id).unwrap());
        assert!(!delete_library(&conn, tv.id).unwrap());
    }
}
