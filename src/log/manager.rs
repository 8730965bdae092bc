#![forbid(unsafe_code)]

//! Owning context for open logs.
//!
//! A manager owns the redrive thread shared by its logs and the table of
//! external logs, which several filesystems may mount at once.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use super::driver::Redriver;
use super::format::{RecordKind, SUPERBLOCK_PAGE};
use super::options::LogOptions;
use super::txn::LogRecord;
use super::{Log, LogCore};
use crate::primitives::io::FileIo;
use crate::types::{LogError, Result};

/// A filesystem using a log.
pub trait LogClient: Send + Sync {
    /// Identity recorded in the superblock's active table.
    fn id(&self) -> Uuid;

    /// Writes logged metadata home. Called from checkpoints and drains with
    /// the append path held: implementations may call
    /// [`Log::unit_written`] but must not append.
    fn flush_metadata(&self, log: &Log, hard: bool) -> Result<()>;
}

/// Identity of the device an external log lives on.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DeviceKey(pub String);

impl From<&str> for DeviceKey {
    fn from(value: &str) -> Self {
        DeviceKey(value.to_owned())
    }
}

impl From<&Path> for DeviceKey {
    fn from(value: &Path) -> Self {
        DeviceKey(value.display().to_string())
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opens logs and tracks the external ones shared between filesystems.
pub struct LogManager {
    redriver: Arc<Redriver>,
    shared: Mutex<HashMap<DeviceKey, Log>>,
}

impl LogManager {
    /// Starts the redrive thread.
    pub fn new() -> Result<Self> {
        Ok(Self {
            redriver: Redriver::spawn()?,
            shared: Mutex::new(HashMap::new()),
        })
    }

    /// Opens a formatted log without registering a filesystem.
    pub fn open(&self, io: Arc<dyn FileIo>, options: LogOptions) -> Result<Log> {
        let core = LogCore::open(io, options, Arc::clone(&self.redriver))?;
        Ok(Log { core })
    }

    /// Opens the log for `client`, reusing an external log already open on
    /// `device`, and records the client in the superblock.
    pub fn mount(
        &self,
        device: DeviceKey,
        io: Arc<dyn FileIo>,
        options: LogOptions,
        client: Arc<dyn LogClient>,
    ) -> Result<Log> {
        let (log, opened) = if options.is_external() {
            let mut shared = self.shared.lock();
            match shared.get(&device) {
                Some(log) => (log.clone(), false),
                None => {
                    let log = self.open(io, options)?;
                    shared.insert(device.clone(), log.clone());
                    (log, true)
                }
            }
        } else {
            (self.open(io, options)?, true)
        };
        if let Err(err) = log.core.attach_client(client.as_ref()) {
            if opened {
                self.forget(&log);
                if let Err(cleanup) = log.shutdown() {
                    warn!(device = %device, error = %cleanup, "log.mount.cleanup_failed");
                }
            }
            return Err(err);
        }
        let id = client.id();
        log.core.clients.lock().push(client);
        info!(device = %device, client = %id, shared = !opened, "log.mount");
        Ok(log)
    }

    /// Drains the log for `client` and removes it from the superblock. The
    /// last client out shuts the log down.
    pub fn unmount(&self, log: &Log, client: Uuid) -> Result<()> {
        log.flush(super::FlushLevel::Drain)?;
        let remaining = log.core.detach_client(client)?;
        info!(client = %client, remaining, "log.unmount");
        if remaining == 0 {
            self.forget(log);
            log.shutdown()?;
        }
        Ok(())
    }

    /// External log already open on `device`.
    pub fn shared_log(&self, device: &DeviceKey) -> Option<Log> {
        self.shared.lock().get(device).cloned()
    }

    fn forget(&self, log: &Log) {
        self.shared
            .lock()
            .retain(|_, open| !Arc::ptr_eq(&open.core, &log.core));
    }
}

impl LogCore {
    /// Adds `client` to the active table and logs its mount.
    fn attach_client(&self, client: &dyn LogClient) -> Result<()> {
        let id = client.id();
        {
            let mut sb = self.superblock.lock();
            sb.add_active(id)?;
            self.direct_write(SUPERBLOCK_PAGE, &sb.encode())?;
        }
        let (hi, lo) = id.as_u64_pair();
        let record = LogRecord::new(RecordKind::Mount).with_arg(hi ^ lo);
        self.append(None, record, None)?;
        Ok(())
    }

    /// Removes a client and returns how many remain.
    fn detach_client(&self, id: Uuid) -> Result<usize> {
        let remaining = {
            let mut clients = self.clients.lock();
            let before = clients.len();
            clients.retain(|client| client.id() != id);
            if clients.len() == before {
                return Err(LogError::NotFound);
            }
            clients.len()
        };
        let mut sb = self.superblock.lock();
        sb.remove_active(id);
        self.direct_write(SUPERBLOCK_PAGE, &sb.encode())?;
        Ok(remaining)
    }
}
