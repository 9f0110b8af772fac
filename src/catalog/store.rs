use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::diff::CatalogDiff;
use super::{CatalogError, CatalogSnapshot, Movie, MovieTag, Tag, TagType};

const SCHEMA_VERSION: u32 = 1;
const STAMP_KEY: &str = "remote_version_stamp";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS movies (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        archive_key TEXT NOT NULL,
        file_name TEXT NOT NULL,
        file_size INTEGER NOT NULL,
        added_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS tag_types (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        sort_order INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS tags (
        id TEXT PRIMARY KEY,
        tag_type_id TEXT NOT NULL,
        name TEXT NOT NULL,
        sort_order INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS movie_tags (
        movie_id TEXT NOT NULL,
        tag_id TEXT NOT NULL,
        PRIMARY KEY (movie_id, tag_id)
    );
    CREATE TABLE IF NOT EXISTS sync_state (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS movie_files (
        movie_id TEXT NOT NULL,
        member TEXT NOT NULL,
        path TEXT NOT NULL,
        PRIMARY KEY (movie_id, member)
    );
";

/// Fichier local d'un film : (id du film, nom du membre, chemin).
pub type MovieFile = (String, String, PathBuf);

/// Miroir local du catalogue basé sur SQLite.
///
/// Une seule connexion, protégée par un verrou : les lectures comme les
/// écritures passent l'une après l'autre.
pub struct LocalCatalog {
    conn: Mutex<Connection>,
}

impl LocalCatalog {
    /// Ouvre ou crée la base à `db_path`.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, CatalogError> {
        let db_path = db_path.as_ref();
        log::info!("LocalCatalog::open: Opening database at {}", db_path.display());
        Self::init(Connection::open(db_path)?)
    }

    pub fn open_in_memory() -> Result<Self, CatalogError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, CatalogError> {
        // Crée le schéma si nécessaire.
        conn.execute_batch(SCHEMA)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, CatalogError> {
        self.conn.lock().map_err(|_| CatalogError::Poisoned)
    }

    /// Lit l'état complet du catalogue, trié par clé primaire.
    pub fn snapshot(&self) -> Result<CatalogSnapshot, CatalogError> {
        let conn = self.lock()?;
        Ok(CatalogSnapshot {
            movies: query_all(
                &conn,
                "SELECT id, title, archive_key, file_name, file_size, added_at FROM movies ORDER BY id",
                movie_from_row,
            )?,
            tag_types: query_all(
                &conn,
                "SELECT id, name, sort_order FROM tag_types ORDER BY id",
                |row| {
                    Ok(TagType {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        sort_order: row.get(2)?,
                    })
                },
            )?,
            tags: query_all(
                &conn,
                "SELECT id, tag_type_id, name, sort_order FROM tags ORDER BY id",
                |row| {
                    Ok(Tag {
                        id: row.get(0)?,
                        tag_type_id: row.get(1)?,
                        name: row.get(2)?,
                        sort_order: row.get(3)?,
                    })
                },
            )?,
            movie_tags: query_all(
                &conn,
                "SELECT movie_id, tag_id FROM movie_tags ORDER BY movie_id, tag_id",
                |row| {
                    Ok(MovieTag {
                        movie_id: row.get(0)?,
                        tag_id: row.get(1)?,
                    })
                },
            )?,
        })
    }

    pub fn movie(&self, id: &str) -> Result<Option<Movie>, CatalogError> {
        let conn = self.lock()?;
        let movie = conn
            .query_row(
                "SELECT id, title, archive_key, file_name, file_size, added_at FROM movies WHERE id = ?1",
                [id],
                movie_from_row,
            )
            .optional()?;
        Ok(movie)
    }

    /// Dernier tag de version distant connu, absent si jamais synchronisé.
    pub fn version_stamp(&self) -> Result<Option<String>, CatalogError> {
        let conn = self.lock()?;
        read_stamp(&conn)
    }

    pub fn set_version_stamp(&self, stamp: &str) -> Result<(), CatalogError> {
        let conn = self.lock()?;
        write_stamp(&conn, stamp)
    }

    /// Applique la différence distante, les fichiers des nouveaux films et le
    /// nouveau tag de version dans une seule transaction.
    ///
    /// Renvoie le nombre de lignes du catalogue modifiées.
    pub fn apply_remote(&self, diff: &CatalogDiff, stamp: &str, files: &[MovieFile]) -> Result<usize, CatalogError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        // Suppressions : enfants d'abord.
        for link in &diff.movie_tags.deletes {
            delete_link(&tx, &link.movie_id, &link.tag_id)?;
        }
        for tag in &diff.tags.deletes {
            tx.execute("DELETE FROM tags WHERE id = ?1", [&tag.id])?;
        }
        for tag_type in &diff.tag_types.deletes {
            tx.execute("DELETE FROM tag_types WHERE id = ?1", [&tag_type.id])?;
        }
        for movie in &diff.movies.deletes {
            tx.execute("DELETE FROM movies WHERE id = ?1", [&movie.id])?;
            tx.execute("DELETE FROM movie_files WHERE movie_id = ?1", [&movie.id])?;
        }

        // Insertions et mises à jour : parents d'abord.
        for tag_type in diff.tag_types.inserts.iter().chain(&diff.tag_types.updates) {
            upsert_tag_type(&tx, tag_type)?;
        }
        for tag in diff.tags.inserts.iter().chain(&diff.tags.updates) {
            upsert_tag(&tx, tag)?;
        }
        for movie in diff.movies.inserts.iter().chain(&diff.movies.updates) {
            upsert_movie(&tx, movie)?;
        }
        for link in diff.movie_tags.inserts.iter().chain(&diff.movie_tags.updates) {
            insert_link(&tx, link)?;
        }

        for (movie_id, member, path) in files {
            insert_movie_file(&tx, movie_id, member, path)?;
        }
        write_stamp(&tx, stamp)?;
        tx.commit()?;

        let changes = diff.change_count();
        log::info!(
            "LocalCatalog::apply_remote: changes={}, files={}, stamp={}",
            changes,
            files.len(),
            stamp
        );
        Ok(changes)
    }

    /// Fichiers locaux connus d'un film, par nom de membre.
    pub fn movie_files(&self, movie_id: &str) -> Result<BTreeMap<String, PathBuf>, CatalogError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT member, path FROM movie_files WHERE movie_id = ?1")?;
        let rows = stmt.query_map([movie_id], |row| {
            Ok((row.get::<_, String>(0)?, PathBuf::from(row.get::<_, String>(1)?)))
        })?;

        let mut result = BTreeMap::new();
        for row in rows {
            let (member, path) = row?;
            result.insert(member, path);
        }
        Ok(result)
    }

    pub fn record_movie_files(&self, files: &[MovieFile]) -> Result<(), CatalogError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for (movie_id, member, path) in files {
            insert_movie_file(&tx, movie_id, member, path)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Exécute une mutation locale dans une transaction.
    pub fn write<T, F>(&self, mutation: F) -> Result<T, CatalogError>
    where
        F: FnOnce(&CatalogWriter<'_>) -> Result<T, CatalogError>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let value = mutation(&CatalogWriter { conn: &tx })?;
        tx.commit()?;
        Ok(value)
    }
}

/// Mutations locales, disponibles dans [`LocalCatalog::write`].
pub struct CatalogWriter<'a> {
    conn: &'a Connection,
}

impl CatalogWriter<'_> {
    pub fn upsert_movie(&self, movie: &Movie) -> Result<(), CatalogError> {
        upsert_movie(self.conn, movie)
    }

    /// Supprime le film, ses étiquettes et ses fichiers locaux connus.
    pub fn delete_movie(&self, movie_id: &str) -> Result<bool, CatalogError> {
        self.conn.execute("DELETE FROM movie_tags WHERE movie_id = ?1", [movie_id])?;
        self.conn.execute("DELETE FROM movie_files WHERE movie_id = ?1", [movie_id])?;
        let removed = self.conn.execute("DELETE FROM movies WHERE id = ?1", [movie_id])?;
        Ok(removed > 0)
    }

    pub fn upsert_tag_type(&self, tag_type: &TagType) -> Result<(), CatalogError> {
        upsert_tag_type(self.conn, tag_type)
    }

    /// Supprime le type, ses étiquettes et leurs liens.
    pub fn delete_tag_type(&self, tag_type_id: &str) -> Result<bool, CatalogError> {
        self.conn.execute(
            "DELETE FROM movie_tags WHERE tag_id IN (SELECT id FROM tags WHERE tag_type_id = ?1)",
            [tag_type_id],
        )?;
        self.conn.execute("DELETE FROM tags WHERE tag_type_id = ?1", [tag_type_id])?;
        let removed = self.conn.execute("DELETE FROM tag_types WHERE id = ?1", [tag_type_id])?;
        Ok(removed > 0)
    }

    pub fn upsert_tag(&self, tag: &Tag) -> Result<(), CatalogError> {
        upsert_tag(self.conn, tag)
    }

    pub fn delete_tag(&self, tag_id: &str) -> Result<bool, CatalogError> {
        self.conn.execute("DELETE FROM movie_tags WHERE tag_id = ?1", [tag_id])?;
        let removed = self.conn.execute("DELETE FROM tags WHERE id = ?1", [tag_id])?;
        Ok(removed > 0)
    }

    pub fn link(&self, movie_id: &str, tag_id: &str) -> Result<(), CatalogError> {
        insert_link(
            self.conn,
            &MovieTag {
                movie_id: movie_id.to_string(),
                tag_id: tag_id.to_string(),
            },
        )
    }

    pub fn unlink(&self, movie_id: &str, tag_id: &str) -> Result<bool, CatalogError> {
        Ok(delete_link(self.conn, movie_id, tag_id)? > 0)
    }

    pub fn next_sort_order(&self, table: SortedTable, tag_type_id: Option<&str>) -> Result<i64, CatalogError> {
        let next = match (table, tag_type_id) {
            (SortedTable::Tags, Some(tag_type_id)) => self.conn.query_row(
                "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM tags WHERE tag_type_id = ?1",
                [tag_type_id],
                |row| row.get(0),
            )?,
            (SortedTable::Tags, None) => {
                self.conn
                    .query_row("SELECT COALESCE(MAX(sort_order) + 1, 0) FROM tags", [], |row| row.get(0))?
            }
            (SortedTable::TagTypes, _) => self.conn.query_row(
                "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM tag_types",
                [],
                |row| row.get(0),
            )?,
        };
        Ok(next)
    }

    pub fn movie_exists(&self, movie_id: &str) -> Result<bool, CatalogError> {
        exists(self.conn, "SELECT 1 FROM movies WHERE id = ?1", movie_id)
    }

    pub fn tag_exists(&self, tag_id: &str) -> Result<bool, CatalogError> {
        exists(self.conn, "SELECT 1 FROM tags WHERE id = ?1", tag_id)
    }

    pub fn tag_type_exists(&self, tag_type_id: &str) -> Result<bool, CatalogError> {
        exists(self.conn, "SELECT 1 FROM tag_types WHERE id = ?1", tag_type_id)
    }
}

/// Tables ordonnées par `sort_order`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortedTable {
    TagTypes,
    Tags,
}

fn query_all<T, F>(conn: &Connection, sql: &str, map: F) -> Result<Vec<T>, CatalogError>
where
    F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
{
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], map)?;

    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

fn exists(conn: &Connection, sql: &str, id: &str) -> Result<bool, CatalogError> {
    Ok(conn.query_row(sql, [id], |_| Ok(())).optional()?.is_some())
}

fn movie_from_row(row: &Row<'_>) -> rusqlite::Result<Movie> {
    Ok(Movie {
        id: row.get(0)?,
        title: row.get(1)?,
        archive_key: row.get(2)?,
        file_name: row.get(3)?,
        file_size: row.get::<_, i64>(4)? as u64,
        added_at: row.get(5)?,
    })
}

fn upsert_movie(conn: &Connection, movie: &Movie) -> Result<(), CatalogError> {
    conn.execute(
        "INSERT OR REPLACE INTO movies (id, title, archive_key, file_name, file_size, added_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            movie.id,
            movie.title,
            movie.archive_key,
            movie.file_name,
            movie.file_size as i64,
            movie.added_at
        ],
    )?;
    Ok(())
}

fn upsert_tag_type(conn: &Connection, tag_type: &TagType) -> Result<(), CatalogError> {
    conn.execute(
        "INSERT OR REPLACE INTO tag_types (id, name, sort_order) VALUES (?1, ?2, ?3)",
        params![tag_type.id, tag_type.name, tag_type.sort_order],
    )?;
    Ok(())
}

fn upsert_tag(conn: &Connection, tag: &Tag) -> Result<(), CatalogError> {
    conn.execute(
        "INSERT OR REPLACE INTO tags (id, tag_type_id, name, sort_order) VALUES (?1, ?2, ?3, ?4)",
        params![tag.id, tag.tag_type_id, tag.name, tag.sort_order],
    )?;
    Ok(())
}

fn insert_link(conn: &Connection, link: &MovieTag) -> Result<(), CatalogError> {
    conn.execute(
        "INSERT OR IGNORE INTO movie_tags (movie_id, tag_id) VALUES (?1, ?2)",
        params![link.movie_id, link.tag_id],
    )?;
    Ok(())
}

fn delete_link(conn: &Connection, movie_id: &str, tag_id: &str) -> Result<usize, CatalogError> {
    Ok(conn.execute(
        "DELETE FROM movie_tags WHERE movie_id = ?1 AND tag_id = ?2",
        [movie_id, tag_id],
    )?)
}

fn insert_movie_file(conn: &Connection, movie_id: &str, member: &str, path: &Path) -> Result<(), CatalogError> {
    conn.execute(
        "INSERT OR REPLACE INTO movie_files (movie_id, member, path) VALUES (?1, ?2, ?3)",
        params![movie_id, member, path.to_string_lossy().into_owned()],
    )?;
    Ok(())
}

fn read_stamp(conn: &Connection) -> Result<Option<String>, CatalogError> {
    let stamp = conn
        .query_row("SELECT value FROM sync_state WHERE key = ?1", [STAMP_KEY], |row| row.get(0))
        .optional()?;
    Ok(stamp)
}

fn write_stamp(conn: &Connection, stamp: &str) -> Result<(), CatalogError> {
    conn.execute(
        "INSERT OR REPLACE INTO sync_state (key, value) VALUES (?1, ?2)",
        [STAMP_KEY, stamp],
    )?;
    Ok(())
}
