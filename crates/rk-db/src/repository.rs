//! Generic per-entity repository over a borrowed connection.
//!
//! [`Entity`] ties a model to its query module; [`Repository`] exposes the
//! uniform `find` / `create` / `update` / `delete` surface. Repositories are
//! normally obtained from [`UnitOfWork::repository`](crate::uow::UnitOfWork::repository)
//! so that every write lands in the unit's transaction.

use std::fmt;
use std::marker::PhantomData;

use rk_core::{
    ArtworkId, ArtworkKind, Error, HistoryEventId, ItemId, JobId, LibraryId, Result,
    SubtitleId,
};
use rusqlite::Connection;

use crate::models::{
    Artwork, Credit, HistoryEvent, Item, JobRecord, Library, NewArtwork, NewCredit,
    NewHistoryEvent, NewItem, NewLibrary, NewSubtitle, Subtitle,
};
use crate::queries::{artwork, credits, history, items, jobs, libraries, subtitles};

/// A persisted entity with CRUD operations.
pub trait Entity: Sized {
    type Id: Copy + fmt::Display;
    /// Data needed to create a row.
    type New;
    /// Entity name used in `NotFound` errors.
    const NAME: &'static str;

    fn id(&self) -> Self::Id;
    fn find(conn: &Connection, id: Self::Id) -> Result<Option<Self>>;
    fn create(conn: &Connection, new: &Self::New) -> Result<Self>;
    fn update(conn: &Connection, entity: &Self) -> Result<bool>;
    fn delete(conn: &Connection, id: Self::Id) -> Result<bool>;
}

/// Typed CRUD access to one entity type.
pub struct Repository<'c, E> {
    conn: &'c Connection,
    _entity: PhantomData<fn() -> E>,
}

impl<'c, E: Entity> Repository<'c, E> {
    pub fn new(conn: &'c Connection) -> Self {
        Self {
            conn,
            _entity: PhantomData,
        }
    }

    pub fn find(&self, id: E::Id) -> Result<Option<E>> {
        E::find(self.conn, id)
    }

    /// Like [`find`](Self::find), but absence is an [`Error::NotFound`].
    pub fn get(&self, id: E::Id) -> Result<E> {
        E::find(self.conn, id)?.ok_or_else(|| Error::not_found(E::NAME, id))
    }

    pub fn create(&self, new: &E::New) -> Result<E> {
        E::create(self.conn, new)
    }

    /// Persist `entity`. Updating a row that no longer exists is an error.
    pub fn update(&self, entity: &E) -> Result<()> {
        if E::update(self.conn, entity)? {
            Ok(())
        } else {
            Err(Error::not_found(E::NAME, entity.id()))
        }
    }

    /// Delete by id, returning whether a row was removed.
    pub fn delete(&self, id: E::Id) -> Result<bool> {
        E::delete(self.conn, id)
    }
}

// ---------------------------------------------------------------------------
// Entity-specific extensions
// ---------------------------------------------------------------------------

impl Repository<'_, Item> {
    pub fn find_by_path(&self, library_id: LibraryId, file_path: &str) -> Result<Option<Item>> {
        items::get_item_by_path(self.conn, library_id, file_path)
    }
}

impl Repository<'_, Credit> {
    /// Replace an item's whole credit list.
    pub fn replace_for_item(&self, item_id: ItemId, new: &[NewCredit]) -> Result<usize> {
        credits::replace_credits(self.conn, item_id, new)
    }

    pub fn list_for_item(&self, item_id: ItemId) -> Result<Vec<Credit>> {
        credits::list_credits(self.conn, item_id)
    }
}

impl Repository<'_, Artwork> {
    pub fn delete_kind(&self, item_id: ItemId, kind: ArtworkKind) -> Result<usize> {
        artwork::delete_artwork_by_kind(self.conn, item_id, kind)
    }

    pub fn list_for_item(&self, item_id: ItemId) -> Result<Vec<Artwork>> {
        artwork::list_artwork(self.conn, item_id)
    }
}

impl Repository<'_, Subtitle> {
    pub fn delete_language(&self, item_id: ItemId, language: &str) -> Result<usize> {
        subtitles::delete_subtitles_by_language(self.conn, item_id, language)
    }

    pub fn list_for_item(&self, item_id: ItemId) -> Result<Vec<Subtitle>> {
        subtitles::list_subtitles(self.conn, item_id)
    }
}

// ---------------------------------------------------------------------------
// Entity impls
// ---------------------------------------------------------------------------

impl Entity for Library {
    type Id = LibraryId;
    type New = NewLibrary;
    const NAME: &'static str = "library";

    fn id(&self) -> LibraryId {
        self.id
    }
    fn find(conn: &Connection, id: LibraryId) -> Result<Option<Self>> {
        libraries::get_library(conn, id)
    }
    fn create(conn: &Connection, new: &NewLibrary) -> Result<Self> {
        libraries::create_library(conn, &new.name, &new.root_path)
    }
    fn update(conn: &Connection, entity: &Self) -> Result<bool> {
        libraries::update_library(conn, entity)
    }
    fn delete(conn: &Connection, id: LibraryId) -> Result<bool> {
        libraries::delete_library(conn, id)
    }
}

impl Entity for Item {
    type Id = ItemId;
    type New = NewItem;
    const NAME: &'static str = "item";

    fn id(&self) -> ItemId {
        self.id
    }
    fn find(conn: &Connection, id: ItemId) -> Result<Option<Self>> {
        items::get_item(conn, id)
    }
    fn create(conn: &Connection, new: &NewItem) -> Result<Self> {
        items::create_item(conn, new)
    }
    fn update(conn: &Connection, entity: &Self) -> Result<bool> {
        items::update_item(conn, entity)
    }
    fn delete(conn: &Connection, id: ItemId) -> Result<bool> {
        items::delete_item(conn, id)
    }
}

impl Entity for Credit {
    type Id = i64;
    type New = NewCredit;
    const NAME: &'static str = "credit";

    fn id(&self) -> i64 {
        self.id
    }
    fn find(conn: &Connection, id: i64) -> Result<Option<Self>> {
        credits::get_credit(conn, id)
    }
    fn create(conn: &Connection, new: &NewCredit) -> Result<Self> {
        credits::create_credit(conn, new)
    }
    fn update(conn: &Connection, entity: &Self) -> Result<bool> {
        credits::update_credit(conn, entity)
    }
    fn delete(conn: &Connection, id: i64) -> Result<bool> {
        credits::delete_credit(conn, id)
    }
}

impl Entity for Artwork {
    type Id = ArtworkId;
    type New = NewArtwork;
    const NAME: &'static str = "artwork";

    fn id(&self) -> ArtworkId {
        self.id
    }
    fn find(conn: &Connection, id: ArtworkId) -> Result<Option<Self>> {
        artwork::get_artwork(conn, id)
    }
    fn create(conn: &Connection, new: &NewArtwork) -> Result<Self> {
        artwork::create_artwork(conn, new)
    }
    fn update(conn: &Connection, entity: &Self) -> Result<bool> {
        artwork::update_artwork(conn, entity)
    }
    fn delete(conn: &Connection, id: ArtworkId) -> Result<bool> {
        artwork::delete_artwork(conn, id)
    }
}

impl Entity for Subtitle {
    type Id = SubtitleId;
    type New = NewSubtitle;
    const NAME: &'static str = "subtitle";

    fn id(&self) -> SubtitleId {
        self.id
    }
    fn find(conn: &Connection, id: SubtitleId) -> Result<Option<Self>> {
        subtitles::get_subtitle(conn, id)
    }
    fn create(conn: &Connection, new: &NewSubtitle) -> Result<Self> {
        subtitles::create_subtitle(conn, new)
    }
    fn update(conn: &Connection, entity: &Self) -> Result<bool> {
        subtitles::update_subtitle(conn, entity)
    }
    fn delete(conn: &Connection, id: SubtitleId) -> Result<bool> {
        subtitles::delete_subtitle(conn, id)
    }
}

impl Entity for HistoryEvent {
    type Id = HistoryEventId;
    type New = NewHistoryEvent;
    const NAME: &'static str = "history event";

    fn id(&self) -> HistoryEventId {
        self.id
    }
    fn find(conn: &Connection, id: HistoryEventId) -> Result<Option<Self>> {
        history::get_event(conn, id)
    }
    fn create(conn: &Connection, new: &NewHistoryEvent) -> Result<Self> {
        history::record_event(conn, new)
    }
    fn update(conn: &Connection, entity: &Self) -> Result<bool> {
        history::update_event_detail(conn, entity)
    }
    fn delete(conn: &Connection, id: HistoryEventId) -> Result<bool> {
        history::delete_event(conn, id)
    }
}

impl Entity for JobRecord {
    type Id = JobId;
    type New = JobRecord;
    const NAME: &'static str = "job";

    fn id(&self) -> JobId {
        self.id
    }
    fn find(conn: &Connection, id: JobId) -> Result<Option<Self>> {
        jobs::get_job(conn, id)
    }
    fn create(conn: &Connection, new: &JobRecord) -> Result<Self> {
        jobs::insert_job(conn, new)?;
        Ok(new.clone())
    }
    fn update(conn: &Connection, entity: &Self) -> Result<bool> {
        jobs::update_job_status(conn, entity)
    }
    fn delete(conn: &Connection, id: JobId) -> Result<bool> {
        jobs::delete_job(conn, id)
    }
}
