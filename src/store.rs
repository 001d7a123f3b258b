//! Memory-mapped bulletin record store.
//!
//! The backing file is a flat array of fixed-size slots.  Slot 0 is
//! permanently reserved, so the first real record has id 1 and the
//! logical length equals the highest populated slot (which is also the
//! last id handed out).  Capacity grows in fixed increments of ten slots
//! by extending the file and remapping.
//!
//! The store itself carries no lock: the node wraps it in one
//! reader-writer lock, readers take the shared side per lookup, and a
//! mutating transaction holds the exclusive side for its whole peer
//! round-trip.  Every `&mut self` method below therefore runs with the
//! exclusive lock already held by its caller.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use tracing::debug;

/// Maximum stored length of a user name, in bytes.
pub const USER_MAX: usize = 20;
/// Maximum stored length of a message, in bytes.
pub const MSG_MAX: usize = 200;

/// Initial slot capacity of a fresh store file.
const INIT_SLOTS: usize = 10;
/// Slots added per growth step.
const GROW_SLOTS: usize = 10;

// On-disk slot layout: little-endian u32 id, then NUL-padded user and
// message fields, padded to a four-byte multiple.
const ID_OFF: usize = 0;
const USER_OFF: usize = 4;
const MSG_OFF: usize = USER_OFF + USER_MAX + 1;
const RECORD_SIZE: usize = 228;

/// One bulletin entry.  `id == 0` never appears in a returned record;
/// it is the on-disk "slot unused" sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: u32,
    pub user: String,
    pub message: String,
}

/// Shadow of the most recent mutation, for single-level rollback.
///
/// Exactly one of these is retained: the next mutation overwrites it.
#[derive(Debug, Clone)]
enum Undo {
    /// Last operation was an append; revert truncates by one slot.
    Append,
    /// Pre-image of the last in-place replace; revert restores it.
    Replace(Record),
}

/// The node's persistent record collection.
pub struct BulletinStore {
    path: PathBuf,
    file: File,
    map: MmapMut,
    /// Highest populated slot index == last id handed out.
    len: usize,
    /// Allocated slots in the backing file.
    cap: usize,
    shadow: Option<Undo>,
}

impl BulletinStore {
    /// Open (creating if absent) the store file at `path` and map it.
    ///
    /// A fresh file is sized for the initial capacity.  On reopen the
    /// logical length is recomputed by scanning from the first real slot
    /// until the first unused one.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let size = file.metadata()?.len() as usize;
        let cap = (size / RECORD_SIZE).max(INIT_SLOTS);
        if size != cap * RECORD_SIZE {
            file.set_len((cap * RECORD_SIZE) as u64)?;
        }

        // Safety: the file is only touched through this mapping, and all
        // mutation happens under the node's exclusive lock.
        let map = unsafe { MmapMut::map_mut(&file)? };

        // Slot 0 is reserved, so the scan for the first unused slot
        // starts at slot 1.
        let mut len = 0;
        for slot in 1..cap {
            if slot_id(&map, slot) == 0 {
                break;
            }
            len = slot;
        }

        debug!(path = %path.display(), cap, len, "opened bulletin store");

        Ok(Self {
            path,
            file,
            map,
            len,
            cap,
            shadow: None,
        })
    }

    /// Number of committed records (also the highest id handed out).
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Allocated slot capacity, for growth inspection.
    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Look up a record by id with a linear scan, copying it out.
    ///
    /// Callers hold the shared lock; concurrent readers never block each
    /// other.  Id 0 is the unused sentinel and is never found.
    pub fn read(&self, id: u32) -> Option<Record> {
        let slot = self.find(id)?;
        Some(self.decode(slot))
    }

    /// Append a record into the next slot and return its id.
    ///
    /// Grows the backing file first when the next slot would exceed the
    /// allocated capacity.  Sets the undo shadow to "last was append".
    pub fn append(&mut self, user: &str, message: &str) -> io::Result<u32> {
        if self.len + 1 >= self.cap {
            self.grow()?;
        }

        let slot = self.len + 1;
        let id = slot as u32;
        self.encode(slot, id, user, message);
        self.len = slot;
        self.shadow = Some(Undo::Append);
        Ok(id)
    }

    /// Overwrite the user and message of an existing record in place.
    ///
    /// The pre-image is saved into the undo shadow.  Returns `None`
    /// without writing anything (shadow included) when the id is absent.
    pub fn replace(&mut self, id: u32, user: &str, message: &str) -> Option<u32> {
        let slot = self.find(id)?;
        self.shadow = Some(Undo::Replace(self.decode(slot)));
        self.encode(slot, id, user, message);
        Some(id)
    }

    /// Undo the most recent mutation via the shadow, then clear it.
    ///
    /// After an append the appended slot is zeroed and the length drops
    /// by one; after a replace the saved pre-image is written back.  A
    /// second revert in a row is a no-op.  Runs under the exclusive lock
    /// its caller already holds.
    pub fn revert(&mut self) {
        match self.shadow.take() {
            Some(Undo::Append) => {
                if self.len > 0 {
                    let slot = self.len;
                    self.slot_mut(slot).fill(0);
                    self.len -= 1;
                }
            }
            Some(Undo::Replace(rec)) => {
                if let Some(slot) = self.find(rec.id) {
                    self.encode(slot, rec.id, &rec.user, &rec.message);
                }
            }
            None => {}
        }
    }

    /// Flush dirty pages of the mapping back to the file.
    pub fn flush(&self) -> io::Result<()> {
        self.map.flush()
    }

    /// Extend the backing file by one growth increment and remap.
    ///
    /// The old mapping is dropped before the new one is created, so the
    /// file is never double-mapped.  Always runs before the slot write
    /// that needs the room, under the exclusive lock.
    fn grow(&mut self) -> io::Result<()> {
        self.map.flush()?;
        let new_cap = self.cap + GROW_SLOTS;
        self.file.set_len((new_cap * RECORD_SIZE) as u64)?;
        self.map = unsafe { MmapMut::map_mut(&self.file)? };
        self.cap = new_cap;
        debug!(path = %self.path.display(), cap = new_cap, "grew bulletin store");
        Ok(())
    }

    /// Linear scan over populated slots for a matching id.
    fn find(&self, id: u32) -> Option<usize> {
        if id == 0 {
            return None;
        }
        (1..=self.len).find(|&slot| slot_id(&self.map, slot) == id)
    }

    fn slot(&self, slot: usize) -> &[u8] {
        &self.map[slot * RECORD_SIZE..(slot + 1) * RECORD_SIZE]
    }

    fn slot_mut(&mut self, slot: usize) -> &mut [u8] {
        &mut self.map[slot * RECORD_SIZE..(slot + 1) * RECORD_SIZE]
    }

    fn decode(&self, slot: usize) -> Record {
        let buf = self.slot(slot);
        Record {
            id: u32::from_le_bytes(buf[ID_OFF..ID_OFF + 4].try_into().unwrap()),
            user: field_str(&buf[USER_OFF..USER_OFF + USER_MAX + 1]),
            message: field_str(&buf[MSG_OFF..MSG_OFF + MSG_MAX + 1]),
        }
    }

    fn encode(&mut self, slot: usize, id: u32, user: &str, message: &str) {
        let user = clip(user, USER_MAX);
        let message = clip(message, MSG_MAX);
        let buf = self.slot_mut(slot);
        buf.fill(0);
        buf[ID_OFF..ID_OFF + 4].copy_from_slice(&id.to_le_bytes());
        buf[USER_OFF..USER_OFF + user.len()].copy_from_slice(user.as_bytes());
        buf[MSG_OFF..MSG_OFF + message.len()].copy_from_slice(message.as_bytes());
    }
}

fn slot_id(map: &MmapMut, slot: usize) -> u32 {
    let off = slot * RECORD_SIZE + ID_OFF;
    u32::from_le_bytes(map[off..off + 4].try_into().unwrap())
}

fn field_str(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Clip `s` to at most `max` bytes on a character boundary.
///
/// Text beyond the bound is silently dropped; this matches the store's
/// truncate-on-write field semantics.
pub fn clip(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
