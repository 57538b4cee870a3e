//! Local state store
//!
//! Two JSON files under the node's state directory:
//! `port_forwards.json` (decoy listeners to re-bind on start) and
//! `tasks.json` (commands that have started but not yet answered).

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use decoynet_core::{CmdType, PortForwardSpec};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::Result;

const PORT_FORWARDS_FILE: &str = "port_forwards.json";
const TASKS_FILE: &str = "tasks.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub cmd_type: CmdType,
    /// Unix seconds
    pub started_at: u64,
}

impl TaskRecord {
    pub fn new(task_id: impl Into<String>, cmd_type: CmdType) -> Self {
        Self {
            task_id: task_id.into(),
            cmd_type,
            started_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }
}

pub struct NodeStore {
    dir: PathBuf,
    // Serialises read-modify-write cycles on both files
    lock: Mutex<()>,
}

impl NodeStore {
    /// Open (creating if needed) the store in `dir`
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        debug!("State store at {:?}", dir);
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read<T: DeserializeOwned + Default>(&self, name: &str) -> Result<T> {
        let path = self.dir.join(name);
        if !path.exists() {
            return Ok(T::default());
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn write<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.dir.join(name);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(value)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn port_forwards(&self) -> Result<Vec<PortForwardSpec>> {
        let _guard = self.lock.lock();
        self.read(PORT_FORWARDS_FILE)
    }

    /// Persist a forward, replacing any existing one on the same local address
    pub fn add_port_forward(&self, spec: PortForwardSpec) -> Result<()> {
        let _guard = self.lock.lock();
        let mut forwards: Vec<PortForwardSpec> = self.read(PORT_FORWARDS_FILE)?;
        forwards.retain(|f| f.local_addr != spec.local_addr);
        forwards.push(spec);
        self.write(PORT_FORWARDS_FILE, &forwards)
    }

    /// Drop every forward whose local address starts with `prefix`
    pub fn remove_port_forwards_with_prefix(&self, prefix: &str) -> Result<usize> {
        let _guard = self.lock.lock();
        let mut forwards: Vec<PortForwardSpec> = self.read(PORT_FORWARDS_FILE)?;
        let before = forwards.len();
        forwards.retain(|f| !f.local_addr.starts_with(prefix));
        let removed = before - forwards.len();
        if removed > 0 {
            self.write(PORT_FORWARDS_FILE, &forwards)?;
        }
        Ok(removed)
    }

    pub fn tasks(&self) -> Result<Vec<TaskRecord>> {
        let _guard = self.lock.lock();
        self.read(TASKS_FILE)
    }

    pub fn add_task(&self, record: TaskRecord) -> Result<()> {
        let _guard = self.lock.lock();
        let mut tasks: Vec<TaskRecord> = self.read(TASKS_FILE)?;
        tasks.retain(|t| t.task_id != record.task_id);
        tasks.push(record);
        self.write(TASKS_FILE, &tasks)
    }

    pub fn remove_task(&self, task_id: &str) -> Result<()> {
        let _guard = self.lock.lock();
        let mut tasks: Vec<TaskRecord> = self.read(TASKS_FILE)?;
        let before = tasks.len();
        tasks.retain(|t| t.task_id != task_id);
        if tasks.len() != before {
            self.write(TASKS_FILE, &tasks)?;
        }
        Ok(())
    }

    /// Delete all persisted state
    pub fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock();
        for name in [PORT_FORWARDS_FILE, TASKS_FILE] {
            let path = self.dir.join(name);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!("Cleared node state in {:?}", self.dir);
        Ok(())
    }
}
