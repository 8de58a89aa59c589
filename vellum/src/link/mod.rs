// Link - one half of a typed relation: the sorted list of ids related to a
// single entity, stored under links/{relation}/{direction}/{shard}/{id}.json.
// Every connection is mirrored: a forth file on the left id and a back file
// on the right id.

use crate::error::Result;
use crate::store::Store;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forth,
    Back,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Forth => "forth",
            Direction::Back => "back",
        }
    }

    pub fn reverse(self) -> Direction {
        match self {
            Direction::Forth => Direction::Back,
            Direction::Back => Direction::Forth,
        }
    }
}

/// Two-level directory shard from the id's first four characters, keeping
/// link directories from growing unboundedly flat.
fn shard(id: &str) -> PathBuf {
    let chars: Vec<char> = id.chars().take(4).collect();
    let mut path = PathBuf::new();
    for chunk in chars.chunks(2) {
        path.push(chunk.iter().collect::<String>());
    }
    path
}

/// The adjacency list of one entity on one side of one relation. Lazily
/// loaded; a missing file reads as empty, and saving an empty list deletes
/// the file.
#[derive(Debug, Clone)]
pub struct Link {
    relation: String,
    id: String,
    direction: Direction,
    data: Option<Vec<String>>,
    dirty: bool,
}

impl Link {
    pub fn new(relation: &str, id: &str, direction: Direction) -> Self {
        Link {
            relation: relation.to_string(),
            id: id.to_string(),
            direction,
            data: None,
            dirty: false,
        }
    }

    pub fn file(&self, home: &Path) -> PathBuf {
        home.join("links")
            .join(&self.relation)
            .join(self.direction.as_str())
            .join(shard(&self.id))
            .join(format!("{}.json", self.id))
    }

    fn load(&mut self, home: &Path, store: &mut Store) -> Result<&mut Vec<String>> {
        if self.data.is_none() {
            let relatives = match store.get(&self.file(home))? {
                Some(bytes) => serde_json::from_slice(&bytes)?,
                None => Vec::new(),
            };
            self.data = Some(relatives);
        }
        Ok(self.data.get_or_insert_with(Vec::new))
    }

    pub fn relatives(&mut self, home: &Path, store: &mut Store) -> Result<Vec<String>> {
        Ok(self.load(home, store)?.clone())
    }

    pub fn first_child(&mut self, home: &Path, store: &mut Store) -> Result<Option<String>> {
        Ok(self.load(home, store)?.first().cloned())
    }

    pub fn has(&mut self, home: &Path, store: &mut Store, relative: &str) -> Result<bool> {
        let relatives = self.load(home, store)?;
        Ok(relatives.binary_search(&relative.to_string()).is_ok())
    }

    /// Add a relative, keeping the list sorted. Idempotent.
    pub fn add(&mut self, home: &Path, store: &mut Store, relative: &str) -> Result<()> {
        let relatives = self.load(home, store)?;
        if let Err(position) = relatives.binary_search(&relative.to_string()) {
            relatives.insert(position, relative.to_string());
            self.dirty = true;
        }
        Ok(())
    }

    /// Remove a relative. Idempotent.
    pub fn remove(&mut self, home: &Path, store: &mut Store, relative: &str) -> Result<()> {
        let relatives = self.load(home, store)?;
        if let Ok(position) = relatives.binary_search(&relative.to_string()) {
            relatives.remove(position);
            self.dirty = true;
        }
        Ok(())
    }

    pub fn save(&mut self, home: &Path, store: &mut Store) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        let file = self.file(home);
        match self.data.as_ref() {
            Some(relatives) if !relatives.is_empty() => {
                store.put(&file, serde_json::to_vec(relatives)?)?;
            }
            _ => store.delete(&file)?,
        }
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_shard_layout() {
        assert_eq!(shard("abcdef"), PathBuf::from("ab/cd"));
        assert_eq!(shard("abc"), PathBuf::from("ab/c"));
        assert_eq!(shard("a"), PathBuf::from("a"));
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let tmp = TempDir::new().unwrap();
        let mut store = Store::new();
        let mut link = Link::new("user_post", "abcd1234", Direction::Forth);

        assert_eq!(link.relatives(tmp.path(), &mut store).unwrap(), Vec::<String>::new());
        assert_eq!(link.first_child(tmp.path(), &mut store).unwrap(), None);
    }

    #[test]
    fn test_add_is_sorted_and_idempotent() {
        let tmp = TempDir::new().unwrap();
        let mut store = Store::new();
        let home = tmp.path();
        let mut link = Link::new("user_post", "abcd1234", Direction::Forth);

        link.add(home, &mut store, "zz").unwrap();
        link.add(home, &mut store, "aa").unwrap();
        link.add(home, &mut store, "zz").unwrap();

        assert_eq!(link.relatives(home, &mut store).unwrap(), vec!["aa", "zz"]);
    }

    #[test]
    fn test_save_reload_round_trip() {
        let tmp = TempDir::new().unwrap();
        let mut store = Store::new();
        let home = tmp.path();

        let mut link = Link::new("user_post", "abcd1234", Direction::Forth);
        link.add(home, &mut store, "p1").unwrap();
        link.save(home, &mut store).unwrap();

        let mut reread = Link::new("user_post", "abcd1234", Direction::Forth);
        assert_eq!(reread.relatives(home, &mut store).unwrap(), vec!["p1"]);
        assert!(store.has(&home.join("links/user_post/forth/ab/cd/abcd1234.json")));
    }

    #[test]
    fn test_empty_list_deletes_file() {
        let tmp = TempDir::new().unwrap();
        let mut store = Store::new();
        let home = tmp.path();
        let file = home.join("links/user_post/forth/ab/cd/abcd1234.json");

        let mut link = Link::new("user_post", "abcd1234", Direction::Forth);
        link.add(home, &mut store, "p1").unwrap();
        link.save(home, &mut store).unwrap();
        assert!(store.has(&file));

        link.remove(home, &mut store, "p1").unwrap();
        link.save(home, &mut store).unwrap();
        assert!(!store.has(&file));
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let tmp = TempDir::new().unwrap();
        let mut store = Store::new();
        let mut link = Link::new("user_post", "abcd1234", Direction::Back);

        link.remove(tmp.path(), &mut store, "ghost").unwrap();
        link.save(tmp.path(), &mut store).unwrap();
        assert_eq!(store.dirty_count(), 0);
    }
}
