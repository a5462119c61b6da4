/* Slot storage engine: single-writer transactional flat-file store.
 *
 * Every slot operation runs inside the one global transaction handed out by
 * `SlotStorage::start`. The transaction token remembers which storage issued
 * it, which slot is open and where the payload cursor stands; passing a token
 * from another instance is rejected. Slots are numbered densely from 0 and
 * deleting one renumbers every following slot down by one.
 *
 * Files under the root:
 *   NNN.fms       slot name + MD5 + general settings record
 *   NNN_VB.fms    per-button payloads
 *   IR_NN.fir     infrared recordings (sparse, gaps allowed)
 *   settings.json key/value namespace (no transaction) */

pub mod infrared;
pub mod kv;
pub mod slot_file;
pub mod vb_file;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::slot::{
    factory_default, validate_name, GeneralConfig, SlotError, SlotImage, PAYLOAD_MAX, SLOT_NAME_MAX,
};
use crate::vb::{VirtualButton, VB_COUNT};

pub use infrared::{IrRecording, IR_EDGE_MAX};
pub use kv::KeyValueStore;

use slot_file::SlotFileError;

/* Highest slot number (inclusive). */
pub const SLOT_MAX: u32 = 250;
/* Highest infrared recording number (inclusive). */
pub const IR_SLOT_MAX: u32 = 99;
/* Slots removed per step of `delete_all_slots` before yielding. */
pub const DELETE_BATCH: usize = 8;

static NEXT_STORAGE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("checksum mismatch in {0}")]
    Checksum(PathBuf),
    #[error("corrupt file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("no free infrared slot (0..={max})", max = IR_SLOT_MAX)]
    Full,
    #[error("transaction not acquired by '{caller}' within {timeout:?}")]
    Timeout { caller: String, timeout: Duration },
    #[error("transaction token was issued by another storage instance")]
    ForeignTransaction,
    #[error("no slot is open in this transaction")]
    NoSlotOpen,
    #[error(transparent)]
    Slot(#[from] SlotError),
}

impl StorageError {
    pub fn io(path: &Path, source: io::Error) -> Self {
        StorageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/* How `load_general` picks a slot. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotTarget {
    Number(u32),
    Name(String),
}

/* Result of `load_general`. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedSlot {
    pub number: u32,
    pub name: String,
    pub config: GeneralConfig,
}

/// Exclusive access token for the storage. Consumed by [`SlotStorage::finish`].
pub struct Transaction {
    storage_id: u64,
    caller: String,
    open: Option<u32>,
    cursor: vb_file::Cursor,
    _guard: OwnedMutexGuard<()>,
}

pub struct SlotStorage {
    id: u64,
    root: PathBuf,
    lock: Arc<Mutex<()>>,
    kv: KeyValueStore,
}

fn slot_path(root: &Path, n: u32) -> PathBuf {
    root.join(format!("{n:03}.fms"))
}

fn payload_path(root: &Path, n: u32) -> PathBuf {
    root.join(format!("{n:03}_VB.fms"))
}

fn ir_path(root: &Path, n: u32) -> PathBuf {
    root.join(format!("IR_{n:02}.fir"))
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StorageError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::io(path, e)),
    }
}

async fn remove_optional(path: &Path) -> Result<bool, StorageError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StorageError::io(path, e)),
    }
}

async fn exists(path: &Path) -> Result<bool, StorageError> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| StorageError::io(path, e))
}

async fn rename(from: &Path, to: &Path) -> Result<(), StorageError> {
    tokio::fs::rename(from, to)
        .await
        .map_err(|e| StorageError::io(from, e))
}

fn file_error(path: &Path, err: SlotFileError) -> StorageError {
    match err {
        SlotFileError::Checksum => StorageError::Checksum(path.to_path_buf()),
        SlotFileError::Corrupt(reason) => StorageError::Corrupt {
            path: path.to_path_buf(),
            reason,
        },
    }
}

impl SlotStorage {
    /* Open the store rooted at `root`, creating the directory if needed. */
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| StorageError::io(&root, e))?;
        info!("Slot storage mounted at {}", root.display());
        Ok(Self {
            id: NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed),
            kv: KeyValueStore::new(&root),
            root,
            lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn kv(&self) -> &KeyValueStore {
        &self.kv
    }

    /* ------------------------------------------------------------------ */
    /* Transaction                                                          */
    /* ------------------------------------------------------------------ */

    pub async fn start(&self, caller: &str, timeout: Duration) -> Result<Transaction, StorageError> {
        let guard = tokio::time::timeout(timeout, self.lock.clone().lock_owned())
            .await
            .map_err(|_| StorageError::Timeout {
                caller: caller.to_string(),
                timeout,
            })?;
        debug!("Storage transaction started by {}", caller);
        Ok(Transaction {
            storage_id: self.id,
            caller: caller.to_string(),
            open: None,
            cursor: vb_file::Cursor::default(),
            _guard: guard,
        })
    }

    pub fn finish(&self, tx: Transaction) -> Result<(), StorageError> {
        self.check(&tx)?;
        debug!("Storage transaction finished by {}", tx.caller);
        Ok(())
    }

    fn check(&self, tx: &Transaction) -> Result<(), StorageError> {
        if tx.storage_id != self.id {
            return Err(StorageError::ForeignTransaction);
        }
        Ok(())
    }

    /* ------------------------------------------------------------------ */
    /* Slots                                                                */
    /* ------------------------------------------------------------------ */

    pub async fn slot_count(&self, tx: &Transaction) -> Result<u32, StorageError> {
        self.check(tx)?;
        let mut n = 0;
        while n <= SLOT_MAX && exists(&slot_path(&self.root, n)).await? {
            n += 1;
        }
        Ok(n)
    }

    pub async fn slot_name(&self, tx: &Transaction, n: u32) -> Result<String, StorageError> {
        self.check(tx)?;
        let path = slot_path(&self.root, n);
        let bytes = read_optional(&path)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("slot {n}")))?;
        slot_file::decode_name(&bytes).map_err(|e| file_error(&path, e))
    }

    pub async fn list_slots(&self, tx: &Transaction) -> Result<Vec<(u32, String)>, StorageError> {
        let count = self.slot_count(tx).await?;
        let mut slots = Vec::with_capacity(count as usize);
        for n in 0..count {
            slots.push((n, self.slot_name(tx, n).await?));
        }
        Ok(slots)
    }

    pub async fn find_slot(&self, tx: &Transaction, name: &str) -> Result<Option<u32>, StorageError> {
        Ok(self
            .list_slots(tx)
            .await?
            .into_iter()
            .find(|(_, n)| n == name)
            .map(|(number, _)| number))
    }

    /* Load the settings of a slot, verify its checksum and open it for payload reads. */
    pub async fn load_general(&self, tx: &mut Transaction, target: &SlotTarget) -> Result<LoadedSlot, StorageError> {
        self.check(tx)?;
        let number = match target {
            SlotTarget::Number(n) => *n,
            SlotTarget::Name(name) => self
                .find_slot(tx, name)
                .await?
                .ok_or_else(|| StorageError::NotFound(format!("slot '{name}'")))?,
        };
        if number > SLOT_MAX {
            return Err(StorageError::InvalidArgument(format!("slot {number} > {SLOT_MAX}")));
        }

        let path = slot_path(&self.root, number);
        let bytes = read_optional(&path)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("slot {number}")))?;
        let (name, config) = slot_file::decode(&bytes).map_err(|e| file_error(&path, e))?;

        tx.open = Some(number);
        tx.cursor = vb_file::Cursor::default();
        debug!("Loaded slot {} '{}'", number, name);
        Ok(LoadedSlot { number, name, config })
    }

    /* Read the payload of `vb` from the slot opened by the last `load_general`. */
    pub async fn load_vb_payload(&self, tx: &mut Transaction, vb: VirtualButton) -> Result<Vec<u8>, StorageError> {
        self.check(tx)?;
        let number = tx.open.ok_or(StorageError::NoSlotOpen)?;
        let path = payload_path(&self.root, number);
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| StorageError::io(&path, e))?;

        let payload = vb_file::read_entry(&mut file, &mut tx.cursor, vb.index() as u32)
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => StorageError::Corrupt {
                    path: path.clone(),
                    reason: e.to_string(),
                },
                _ => StorageError::io(&path, e),
            })?
            .ok_or_else(|| StorageError::NotFound(format!("payload of {vb} in slot {number}")))?;
        if payload.len() > PAYLOAD_MAX {
            return Err(StorageError::Slot(SlotError::PayloadTooLarge(payload.len())));
        }
        Ok(payload)
    }

    fn validate_image(image: &SlotImage) -> Result<(), StorageError> {
        validate_name(&image.name).map_err(|_| {
            StorageError::InvalidArgument(format!("slot name must be 1..={SLOT_NAME_MAX} bytes"))
        })?;
        if image.payloads.len() != VB_COUNT {
            return Err(StorageError::InvalidArgument(format!(
                "{} payloads for {VB_COUNT} buttons",
                image.payloads.len()
            )));
        }
        for vb in VirtualButton::all() {
            let payload = &image.payloads[vb.index()];
            if payload.len() > PAYLOAD_MAX {
                return Err(StorageError::InvalidArgument(format!("{vb}: payload too large")));
            }
            if usize::from(image.config.vb_payload_len[vb.index()]) != payload.len() {
                return Err(StorageError::InvalidArgument(format!(
                    "{vb}: payload length does not match settings record"
                )));
            }
        }
        Ok(())
    }

    async fn write_slot(&self, number: u32, image: &SlotImage) -> Result<(), StorageError> {
        let header = slot_path(&self.root, number);
        let payloads = payload_path(&self.root, number);
        tokio::fs::write(&payloads, vb_file::encode(&image.payloads))
            .await
            .map_err(|e| StorageError::io(&payloads, e))?;
        tokio::fs::write(&header, slot_file::encode(&image.name, &image.config))
            .await
            .map_err(|e| StorageError::io(&header, e))
    }

    /* Store under the image's name: overwrite a slot of the same name, else append. */
    pub async fn store_slot(&self, tx: &mut Transaction, image: &SlotImage) -> Result<u32, StorageError> {
        self.check(tx)?;
        Self::validate_image(image)?;

        let number = match self.find_slot(tx, &image.name).await? {
            Some(n) => n,
            None => self.slot_count(tx).await?,
        };
        if number > SLOT_MAX {
            return Err(StorageError::InvalidArgument(format!("slot {number} > {SLOT_MAX}")));
        }
        self.write_slot(number, image).await?;
        if tx.open == Some(number) {
            tx.cursor = vb_file::Cursor::default();
        }
        info!("Stored slot {} '{}'", number, image.name);
        Ok(number)
    }

    /* Force-write the factory default as slot 0. */
    pub async fn store_default_slot(&self, tx: &mut Transaction) -> Result<SlotImage, StorageError> {
        self.check(tx)?;
        let image = factory_default()?;
        self.write_slot(0, &image).await?;
        if tx.open == Some(0) {
            tx.cursor = vb_file::Cursor::default();
        }
        info!("Stored factory default slot '{}'", image.name);
        Ok(image)
    }

    /* Delete slot `n` and renumber every following slot down by one. */
    pub async fn delete_slot(&self, tx: &mut Transaction, n: u32) -> Result<(), StorageError> {
        self.check(tx)?;
        let count = self.slot_count(tx).await?;
        if n >= count {
            return Err(StorageError::NotFound(format!("slot {n}")));
        }

        remove_optional(&slot_path(&self.root, n)).await?;
        remove_optional(&payload_path(&self.root, n)).await?;
        for k in n + 1..count {
            rename(&slot_path(&self.root, k), &slot_path(&self.root, k - 1)).await?;
            let from = payload_path(&self.root, k);
            if exists(&from).await? {
                rename(&from, &payload_path(&self.root, k - 1)).await?;
            }
        }

        tx.open = match tx.open {
            Some(open) if open == n => None,
            Some(open) if open > n => Some(open - 1),
            other => other,
        };
        tx.cursor = vb_file::Cursor::default();
        info!("Deleted slot {} ({} slots remain)", n, count - 1);
        Ok(())
    }

    /* Remove every slot, a bounded batch at a time. Returns how many were removed. */
    pub async fn delete_all_slots(&self, tx: &mut Transaction) -> Result<u32, StorageError> {
        self.check(tx)?;
        let count = self.slot_count(tx).await?;
        let numbers: Vec<u32> = (0..count).collect();
        for batch in numbers.chunks(DELETE_BATCH) {
            for &n in batch {
                remove_optional(&slot_path(&self.root, n)).await?;
                remove_optional(&payload_path(&self.root, n)).await?;
            }
            tokio::task::yield_now().await;
        }
        tx.open = None;
        tx.cursor = vb_file::Cursor::default();
        info!("Deleted all {} slots", count);
        Ok(count)
    }

    /* ------------------------------------------------------------------ */
    /* Infrared                                                             */
    /* ------------------------------------------------------------------ */

    async fn read_ir(&self, n: u32) -> Result<Option<IrRecording>, StorageError> {
        let path = ir_path(&self.root, n);
        let Some(bytes) = read_optional(&path).await? else {
            return Ok(None);
        };
        IrRecording::decode(&bytes)
            .map(Some)
            .map_err(|reason| StorageError::Corrupt { path, reason })
    }

    pub async fn list_ir(&self, tx: &Transaction) -> Result<Vec<(u32, String)>, StorageError> {
        self.check(tx)?;
        let mut out = Vec::new();
        for n in 0..=IR_SLOT_MAX {
            match self.read_ir(n).await {
                Ok(Some(rec)) => out.push((n, rec.name)),
                Ok(None) => {}
                Err(e) => warn!("Skipping infrared slot {}: {}", n, e),
            }
        }
        Ok(out)
    }

    pub async fn ir_count(&self, tx: &Transaction) -> Result<usize, StorageError> {
        Ok(self.list_ir(tx).await?.len())
    }

    async fn find_ir(&self, tx: &Transaction, name: &str) -> Result<Option<u32>, StorageError> {
        Ok(self
            .list_ir(tx)
            .await?
            .into_iter()
            .find(|(_, n)| n == name)
            .map(|(number, _)| number))
    }

    /* Store a recording under its name: overwrite by name, else take the lowest free number. */
    pub async fn store_ir(&self, tx: &Transaction, rec: &IrRecording) -> Result<u32, StorageError> {
        self.check(tx)?;
        validate_name(&rec.name)
            .map_err(|_| StorageError::InvalidArgument(format!("infrared name '{}'", rec.name)))?;
        if rec.items.len() > IR_EDGE_MAX {
            return Err(StorageError::InvalidArgument(format!(
                "{} edges exceed {IR_EDGE_MAX}",
                rec.items.len()
            )));
        }

        let number = match self.find_ir(tx, &rec.name).await? {
            Some(n) => n,
            None => {
                let mut free = None;
                for n in 0..=IR_SLOT_MAX {
                    if !exists(&ir_path(&self.root, n)).await? {
                        free = Some(n);
                        break;
                    }
                }
                free.ok_or(StorageError::Full)?
            }
        };

        let path = ir_path(&self.root, number);
        tokio::fs::write(&path, rec.encode())
            .await
            .map_err(|e| StorageError::io(&path, e))?;
        info!("Stored infrared recording {} '{}' ({} edges)", number, rec.name, rec.items.len());
        Ok(number)
    }

    pub async fn load_ir(&self, tx: &Transaction, name: &str) -> Result<IrRecording, StorageError> {
        let number = self
            .find_ir(tx, name)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("infrared recording '{name}'")))?;
        self.read_ir(number)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("infrared recording '{name}'")))
    }

    /* Delete by name. Leaves a gap; other recordings keep their numbers. */
    pub async fn delete_ir(&self, tx: &Transaction, name: &str) -> Result<bool, StorageError> {
        match self.find_ir(tx, name).await? {
            Some(n) => remove_optional(&ir_path(&self.root, n)).await,
            None => Ok(false),
        }
    }
}
