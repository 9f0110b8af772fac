use std::collections::BTreeMap;

use super::{CatalogSnapshot, Keyed, Movie, MovieTag, Tag, TagType};

/// Différence d'une table entre le miroir local et le document distant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDiff<T> {
    /// Lignes présentes uniquement à distance.
    pub inserts: Vec<T>,
    /// Lignes présentes des deux côtés dont les colonnes diffèrent (version distante).
    pub updates: Vec<T>,
    /// Lignes présentes uniquement en local.
    pub deletes: Vec<T>,
}

impl<T> Default for TableDiff<T> {
    fn default() -> Self {
        Self {
            inserts: Vec::new(),
            updates: Vec::new(),
            deletes: Vec::new(),
        }
    }
}

impl<T> TableDiff<T> {
    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.deletes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Keyed + Clone + PartialEq> TableDiff<T> {
    /// Compare deux tables par clé primaire.
    pub fn between(local: &[T], remote: &[T]) -> Self {
        let local_rows: BTreeMap<T::Key, &T> = local.iter().map(|row| (row.key(), row)).collect();
        let remote_rows: BTreeMap<T::Key, &T> = remote.iter().map(|row| (row.key(), row)).collect();

        let mut diff = Self::default();
        for (key, remote_row) in &remote_rows {
            match local_rows.get(key) {
                None => diff.inserts.push((*remote_row).clone()),
                Some(local_row) if local_row != remote_row => diff.updates.push((*remote_row).clone()),
                Some(_) => {}
            }
        }
        for (key, local_row) in &local_rows {
            if !remote_rows.contains_key(key) {
                diff.deletes.push((*local_row).clone());
            }
        }
        diff
    }
}

/// Différence complète du catalogue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogDiff {
    pub movies: TableDiff<Movie>,
    pub tag_types: TableDiff<TagType>,
    pub tags: TableDiff<Tag>,
    pub movie_tags: TableDiff<MovieTag>,
}

impl CatalogDiff {
    pub fn between(local: &CatalogSnapshot, remote: &CatalogSnapshot) -> Self {
        Self {
            movies: TableDiff::between(&local.movies, &remote.movies),
            tag_types: TableDiff::between(&local.tag_types, &remote.tag_types),
            tags: TableDiff::between(&local.tags, &remote.tags),
            movie_tags: TableDiff::between(&local.movie_tags, &remote.movie_tags),
        }
    }

    pub fn change_count(&self) -> usize {
        self.movies.len() + self.tag_types.len() + self.tags.len() + self.movie_tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.change_count() == 0
    }

    /// Films apparus à distance : leurs fichiers de lecture restent à récupérer.
    pub fn new_movies(&self) -> &[Movie] {
        &self.movies.inserts
    }
}
