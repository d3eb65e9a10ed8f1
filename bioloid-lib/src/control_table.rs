//! Device-side register space.
//!
//! A [`ControlTable`] is a fixed block of bytes. The first `persistent_len`
//! bytes survive power cycles through a [`Storage`] backend; the rest start
//! from their defaults every time. Code interested in a register range
//! registers a [`Subscription`] and is called with exactly the part of each
//! write that overlaps it.

use crate::error::BusError;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Backing store for the persistent prefix of a control table.
pub trait Storage: Send {
    /// The previously saved blob, or `None` if there isn't one.
    fn load(&mut self) -> Option<Vec<u8>>;

    /// Replaces the saved blob.
    fn save(&mut self, bytes: &[u8]) -> io::Result<()>;
}

/// Persists the table prefix to a single file, conventionally `<name>.ctl`.
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Storage for FileStorage {
    fn load(&mut self) -> Option<Vec<u8>> {
        match fs::read(&self.path) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "No saved control table");
                None
            }
        }
    }

    fn save(&mut self, bytes: &[u8]) -> io::Result<()> {
        fs::write(&self.path, bytes)
    }
}

/// In-memory storage. Clones share the same blob, so a test can keep a
/// handle and inspect or pre-seed what the table sees.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    blob: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contents(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            blob: Arc::new(Mutex::new(Some(bytes.into()))),
        }
    }

    pub fn contents(&self) -> Option<Vec<u8>> {
        self.blob.lock().ok().and_then(|blob| blob.clone())
    }
}

impl Storage for MemoryStorage {
    fn load(&mut self) -> Option<Vec<u8>> {
        self.contents()
    }

    fn save(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut blob = self
            .blob
            .lock()
            .map_err(|_| io::Error::other("memory storage lock poisoned"))?;
        *blob = Some(bytes.to_vec());
        Ok(())
    }
}

type Callback = Box<dyn FnMut(usize, &[u8]) + Send>;

/// Calls `callback(offset, bytes)` whenever bytes in `[offset, offset + len)` change.
pub struct Subscription {
    offset: usize,
    len: usize,
    callback: Callback,
}

impl Subscription {
    pub fn new(offset: usize, len: usize, callback: impl FnMut(usize, &[u8]) + Send + 'static) -> Self {
        Self {
            offset,
            len,
            callback: Box::new(callback),
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The part of `[offset, end)` this subscription watches, if any.
    fn intersect(&self, offset: usize, end: usize) -> Option<(usize, usize)> {
        let start = self.offset.max(offset);
        let stop = (self.offset + self.len).min(end);
        (start < stop).then_some((start, stop))
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

pub struct ControlTable {
    bytes: Vec<u8>,
    defaults: Vec<u8>,
    persistent_len: usize,
    subscriptions: Vec<Subscription>,
    storage: Box<dyn Storage>,
}

impl ControlTable {
    /// Builds a table from its factory `defaults`.
    ///
    /// The persistent prefix is restored from `storage` when the saved blob
    /// has exactly `persistent_len` bytes. Otherwise the defaults are saved
    /// in its place. Every subscription is notified once over the whole
    /// table before this returns.
    pub fn new(
        defaults: impl Into<Vec<u8>>,
        persistent_len: usize,
        subscriptions: Vec<Subscription>,
        storage: impl Storage + 'static,
    ) -> Result<Self, BusError> {
        let defaults = defaults.into();
        if persistent_len > defaults.len() {
            return Err(BusError::InvalidArgument(format!(
                "persistent prefix of {persistent_len} bytes exceeds table size {}",
                defaults.len()
            )));
        }
        let mut table = Self {
            bytes: defaults.clone(),
            defaults,
            persistent_len,
            subscriptions: Vec::new(),
            storage: Box::new(storage),
        };
        for subscription in subscriptions {
            table.insert_subscription(subscription);
        }

        match table.storage.load() {
            Some(saved) if saved.len() == persistent_len => {
                table.bytes[..persistent_len].copy_from_slice(&saved);
            }
            Some(saved) => {
                warn!(
                    expected = persistent_len,
                    got = saved.len(),
                    "Saved control table has the wrong size, using defaults"
                );
                table.persist()?;
            }
            None => table.persist()?,
        }
        table.notify(0, table.bytes.len());
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn persistent_len(&self) -> usize {
        self.persistent_len
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn defaults(&self) -> &[u8] {
        &self.defaults
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    /// Adds a subscription after construction. It is not notified until the
    /// next write that touches its range.
    pub fn subscribe(&mut self, subscription: Subscription) {
        self.insert_subscription(subscription);
    }

    /// Whether `[offset, offset + len)` lies within the table.
    pub fn contains(&self, offset: usize, len: usize) -> bool {
        offset.checked_add(len).is_some_and(|end| end <= self.bytes.len())
    }

    pub fn read(&self, offset: usize, len: usize) -> Result<&[u8], BusError> {
        self.check_range(offset, len)?;
        Ok(&self.bytes[offset..offset + len])
    }

    /// Copies `data` in at `offset` and notifies the overlapping subscriptions.
    ///
    /// With `persist` set, a write starting inside the persistent prefix saves
    /// the whole prefix before returning.
    pub fn write(&mut self, offset: usize, data: &[u8], persist: bool) -> Result<(), BusError> {
        self.check_range(offset, data.len())?;
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
        self.notify(offset, data.len());
        if persist && offset < self.persistent_len {
            self.persist()?;
        }
        Ok(())
    }

    /// Restores the factory defaults, notifies everyone and saves.
    pub fn reset(&mut self) -> Result<(), BusError> {
        self.bytes.copy_from_slice(&self.defaults);
        self.notify(0, self.bytes.len());
        self.persist()
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<(), BusError> {
        if self.contains(offset, len) {
            Ok(())
        } else {
            Err(BusError::OutOfRange {
                offset,
                len,
                size: self.bytes.len(),
            })
        }
    }

    fn insert_subscription(&mut self, subscription: Subscription) {
        let idx = self
            .subscriptions
            .partition_point(|s| s.offset <= subscription.offset);
        self.subscriptions.insert(idx, subscription);
    }

    fn notify(&mut self, offset: usize, len: usize) {
        let end = offset + len;
        for subscription in &mut self.subscriptions {
            if let Some((start, stop)) = subscription.intersect(offset, end) {
                (subscription.callback)(start, &self.bytes[start..stop]);
            }
        }
    }

    fn persist(&mut self) -> Result<(), BusError> {
        self.storage.save(&self.bytes[..self.persistent_len])?;
        Ok(())
    }
}

impl fmt::Debug for ControlTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlTable")
            .field("bytes", &self.bytes)
            .field("persistent_len", &self.persistent_len)
            .field("subscriptions", &self.subscriptions)
            .finish_non_exhaustive()
    }
}
