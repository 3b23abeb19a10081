//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Popsync.
//
// Popsync is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Popsync is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Popsync. If not, see <http://www.gnu.org/licenses/>.

//! Local storage of message bodies and parsed headers.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;

use log::{debug, warn};
use tempfile::TempPath;

use super::header::Header;
use crate::support::error::Error;
use crate::support::file_ops::{self, IgnoreKinds};
use crate::support::safe_name::{escape_name, unescape_name};

/// Persistent storage of message bodies keyed by message identifier.
pub trait BlobCache {
    fn exists(&self, id: &str) -> bool;
    /// Open the committed entry for `id` for reading.
    fn get(&self, id: &str) -> Option<fs::File>;
    /// Open a new, writable entry for `id`. It stays invisible to `get()`
    /// and `exists()` until `commit()` is called.
    fn put(&mut self, id: &str) -> Result<fs::File, Error>;
    fn commit(&mut self, id: &str) -> Result<(), Error>;
    fn delete(&mut self, id: &str) -> Result<(), Error>;
    /// Call `keep` on every entry, deleting those for which it returns false.
    fn list(&mut self, keep: &mut dyn FnMut(&str) -> bool) -> Result<(), Error>;
}

/// Persistent storage of parsed headers keyed by message identifier.
pub trait HeaderCache {
    fn fetch(&self, id: &str) -> Option<Header>;
    fn store(&mut self, id: &str, header: &Header) -> Result<(), Error>;
    fn delete(&mut self, id: &str) -> Result<(), Error>;
    /// The entry name this cache occupies within a blob cache sharing the
    /// same directory, if any.
    fn shared_name(&self) -> Option<&str> {
        None
    }
}

const STAGING_DIR: &str = "tmp";

/// A `BlobCache` keeping one file per message in a directory.
///
/// Entries are written into `tmp/` and renamed into place on commit.
#[derive(Clone, Debug)]
pub struct DirBlobCache {
    root: PathBuf,
}

impl DirBlobCache {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        fs::create_dir_all(root.join(STAGING_DIR)).map_err(|e| {
            Error::Cache(format!("{}: {}", root.display(), e))
        })?;
        Ok(DirBlobCache { root })
    }

    fn path(&self, id: &str) -> PathBuf {
        self.root.join(escape_name(id))
    }

    fn staging_path(&self, id: &str) -> PathBuf {
        self.root.join(STAGING_DIR).join(escape_name(id))
    }

    fn cache_error(&self, id: &str, e: io::Error) -> Error {
        Error::Cache(format!("{} in {}: {}", id, self.root.display(), e))
    }
}

impl BlobCache for DirBlobCache {
    fn exists(&self, id: &str) -> bool {
        self.path(id).is_file()
    }

    fn get(&self, id: &str) -> Option<fs::File> {
        match fs::File::open(self.path(id)) {
            Ok(file) => Some(file),
            Err(e) if io::ErrorKind::NotFound == e.kind() => None,
            Err(e) => {
                warn!("{}", self.cache_error(id, e));
                None
            }
        }
    }

    fn put(&mut self, id: &str) -> Result<fs::File, Error> {
        fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.staging_path(id))
            .map_err(|e| self.cache_error(id, e))
    }

    fn commit(&mut self, id: &str) -> Result<(), Error> {
        fs::rename(self.staging_path(id), self.path(id))
            .map_err(|e| self.cache_error(id, e))
    }

    fn delete(&mut self, id: &str) -> Result<(), Error> {
        debug!("Deleting {} from message cache", id);
        fs::remove_file(self.path(id))
            .ignore_not_found()
            .map_err(|e| self.cache_error(id, e))
    }

    fn list(
        &mut self,
        keep: &mut dyn FnMut(&str) -> bool,
    ) -> Result<(), Error> {
        let entries = fs::read_dir(&self.root).map_err(|e| {
            Error::Cache(format!("{}: {}", self.root.display(), e))
        })?;

        for entry in entries {
            let entry = entry.map_err(|e| {
                Error::Cache(format!("{}: {}", self.root.display(), e))
            })?;
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(true) {
                continue;
            }

            let name = entry.file_name();
            let name = match name.to_str() {
                Some(name) => name,
                None => continue,
            };
            // Files which are not escaped identifiers are offered under
            // their own name, so a co-located header cache can be kept.
            let id = unescape_name(name).unwrap_or_else(|| name.to_owned());
            if !keep(&id) {
                debug!("Sweeping {} from message cache", id);
                fs::remove_file(entry.path())
                    .ignore_not_found()
                    .map_err(|e| self.cache_error(&id, e))?;
            }
        }

        Ok(())
    }
}

/// File name of the header cache within its directory.
pub const HCACHE_NAME: &str = "popsync.hcache";

/// A `HeaderCache` kept as a single CBOR file, rewritten on every change.
#[derive(Debug)]
pub struct DirHeaderCache {
    dir: PathBuf,
    entries: BTreeMap<String, Header>,
}

impl DirHeaderCache {
    /// Open the header cache in `dir`. An unreadable cache starts out empty.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| Error::Cache(format!("{}: {}", dir.display(), e)))?;

        let path = dir.join(HCACHE_NAME);
        let entries = match fs::read(&path).ignore_not_found() {
            Ok(data) if data.is_empty() => BTreeMap::new(),
            Ok(data) => match serde_cbor::from_slice(&data) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(
                        "Discarding corrupt header cache {}: {}",
                        path.display(),
                        e
                    );
                    BTreeMap::new()
                }
            },
            Err(e) => {
                warn!("Unable to read header cache {}: {}", path.display(), e);
                BTreeMap::new()
            }
        };

        Ok(DirHeaderCache { dir, entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn save(&self) -> Result<(), Error> {
        let data = serde_cbor::to_vec(&self.entries)?;
        file_ops::spit(&self.dir, self.dir.join(HCACHE_NAME), 0o600, &data)
            .map_err(|e| Error::Cache(format!("{}: {}", self.dir.display(), e)))
    }
}

impl HeaderCache for DirHeaderCache {
    fn fetch(&self, id: &str) -> Option<Header> {
        self.entries.get(id).cloned()
    }

    fn store(&mut self, id: &str, header: &Header) -> Result<(), Error> {
        self.entries.insert(id.to_owned(), header.clone());
        self.save()
    }

    fn delete(&mut self, id: &str) -> Result<(), Error> {
        if self.entries.remove(id).is_some() {
            self.save()
        } else {
            Ok(())
        }
    }

    fn shared_name(&self) -> Option<&str> {
        Some(HCACHE_NAME)
    }
}

#[derive(Debug)]
struct Slot {
    index: usize,
    path: TempPath,
}

/// Bodies retrieved without a blob cache, kept in a small ring of temporary
/// files keyed by message position.
///
/// Dropping a slot removes its file.
#[derive(Debug)]
pub struct FallbackCache {
    slots: Vec<Option<Slot>>,
}

impl FallbackCache {
    pub fn new(len: usize) -> Self {
        FallbackCache {
            slots: (0..len.max(1)).map(|_| None).collect(),
        }
    }

    fn slot(&mut self, index: usize) -> &mut Option<Slot> {
        let len = self.slots.len();
        &mut self.slots[index % len]
    }

    /// Open the file cached for the message at `index`.
    ///
    /// A slot holding a different message is evicted.
    pub fn lookup(&mut self, index: usize) -> Result<Option<fs::File>, Error> {
        let slot = self.slot(index);
        match *slot {
            Some(ref cached) if cached.index == index => {
                Ok(Some(fs::File::open(&cached.path)?))
            }
            Some(_) => {
                *slot = None;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Take ownership of `path` as the body of the message at `index`.
    pub fn store(&mut self, index: usize, path: TempPath) {
        *self.slot(index) = Some(Slot { index, path });
    }

    /// Remove every cached file.
    pub fn purge(&mut self) {
        debug!("Deleting cached messages");
        for slot in &mut self.slots {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::{Read, Write};

    use tempfile::{NamedTempFile, TempDir};

    use super::*;

    #[test]
    fn blob_put_commit_get() {
        let dir = TempDir::new().unwrap();
        let mut cache = DirBlobCache::new(dir.path()).unwrap();

        let mut file = cache.put("uid/1.x").unwrap();
        file.write_all(b"body").unwrap();
        assert!(!cache.exists("uid/1.x"));
        assert!(cache.get("uid/1.x").is_none());

        cache.commit("uid/1.x").unwrap();
        assert!(cache.exists("uid/1.x"));
        let mut content = String::new();
        cache
            .get("uid/1.x")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!("body", content);

        cache.delete("uid/1.x").unwrap();
        assert!(!cache.exists("uid/1.x"));
        cache.delete("uid/1.x").unwrap();
    }

    #[test]
    fn blob_list_sweeps() {
        let dir = TempDir::new().unwrap();
        let mut cache = DirBlobCache::new(dir.path()).unwrap();
        for id in &["keep", "drop", "also.drop"] {
            cache.put(id).unwrap();
            cache.commit(id).unwrap();
        }
        fs::write(dir.path().join(HCACHE_NAME), b"").unwrap();

        let mut seen = Vec::new();
        cache
            .list(&mut |id| {
                seen.push(id.to_owned());
                "keep" == id || HCACHE_NAME == id
            })
            .unwrap();
        seen.sort();
        assert_eq!(vec!["also.drop", "drop", "keep", HCACHE_NAME], seen);

        assert!(cache.exists("keep"));
        assert!(!cache.exists("drop"));
        assert!(!cache.exists("also.drop"));
        assert!(dir.path().join(HCACHE_NAME).is_file());
    }

    #[test]
    fn header_cache_persists() {
        let dir = TempDir::new().unwrap();
        let mut header = Header::default();
        header.envelope.subject = Some("hello".to_owned());
        header.length = 42;

        {
            let mut cache = DirHeaderCache::open(dir.path()).unwrap();
            assert!(cache.is_empty());
            cache.store("a", &header).unwrap();
            cache.store("b", &header).unwrap();
            cache.delete("b").unwrap();
            cache.delete("nx").unwrap();
        }

        let cache = DirHeaderCache::open(dir.path()).unwrap();
        assert_eq!(1, cache.len());
        assert_eq!(Some(header), cache.fetch("a"));
        assert_eq!(None, cache.fetch("b"));
        assert_eq!(Some(HCACHE_NAME), cache.shared_name());
    }

    #[test]
    fn corrupt_header_cache_is_discarded() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(HCACHE_NAME), b"\xff\xff garbage").unwrap();
        let cache = DirHeaderCache::open(dir.path()).unwrap();
        assert!(cache.is_empty());
    }

    fn temp_with(content: &str) -> TempPath {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.into_temp_path()
    }

    #[test]
    fn fallback_slots_rotate() {
        let mut cache = FallbackCache::new(2);
        let path = temp_with("zero");
        let file_zero = path.to_path_buf();
        cache.store(0, path);

        let mut content = String::new();
        cache
            .lookup(0)
            .unwrap()
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!("zero", content);

        assert!(cache.lookup(1).unwrap().is_none());
        // Index 2 shares the slot of index 0 and evicts it.
        assert!(cache.lookup(2).unwrap().is_none());
        assert!(!file_zero.exists());
        assert!(cache.lookup(0).unwrap().is_none());
    }

    #[test]
    fn fallback_purge_removes_files() {
        let mut cache = FallbackCache::new(0);
        let path = temp_with("x");
        let file = path.to_path_buf();
        cache.store(5, path);
        assert!(file.exists());
        cache.purge();
        assert!(!file.exists());
        assert!(cache.lookup(5).unwrap().is_none());
    }
}
