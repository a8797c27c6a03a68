//! Purpose: The in-process application core a command executes against.
//! Exports: `Node`.
//! Role: Owns the record store handle and the node identity for one process.
//! Invariants: Exactly one `Node` exists per invocation; the daemon flag is
//! fixed at construction and decides whether the node may read stdin.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;

use crate::core::config::Config;
use crate::core::error::{Error, ErrorKind};
use crate::core::store::{Record, Store, StoreStat};

pub struct Node {
    config: Config,
    config_root: PathBuf,
    store: Mutex<Store>,
    daemon: bool,
}

impl Node {
    /// Opens the core against a configuration root. `daemon` marks a
    /// long-lived daemon instantiation; a foreground (CLI) node passes
    /// false and skips everything tied to serving.
    pub fn open(config_root: &Path, config: Config, daemon: bool) -> Result<Self, Error> {
        let store = Store::open(config_root)?;
        Ok(Self {
            config,
            config_root: config_root.to_path_buf(),
            store: Mutex::new(store),
            daemon,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_root(&self) -> &Path {
        &self.config_root
    }

    pub fn is_daemon(&self) -> bool {
        self.daemon
    }

    pub fn peer_id(&self) -> &str {
        &self.config.identity.peer_id
    }

    pub fn agent_version() -> String {
        format!("keel/{}", env!("CARGO_PKG_VERSION"))
    }

    pub fn append(&self, data: Value, tags: Vec<String>) -> Result<Record, Error> {
        self.store_lock()?.append(data, tags)
    }

    pub fn get(&self, seq: u64) -> Result<Record, Error> {
        self.store_lock()?.get(seq)
    }

    pub fn stat(&self) -> Result<StoreStat, Error> {
        self.store_lock()?.stat()
    }

    /// Flushes the store. Safe to call more than once; `Drop` repeats it as
    /// a backstop for panic unwinds.
    pub fn close(&self) -> Result<(), Error> {
        self.store_lock()?.sync()
    }

    fn store_lock(&self) -> Result<MutexGuard<'_, Store>, Error> {
        self.store
            .lock()
            .map_err(|_| Error::new(ErrorKind::Internal).with_message("record store lock is poisoned"))
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::Node;
    use crate::core::config::{Config, init};
    use serde_json::json;
    use std::path::Path;

    fn test_config(root: &Path) -> Config {
        init(root, None).expect("init")
    }

    #[test]
    fn node_appends_and_fetches_records() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = test_config(temp.path());
        let node = Node::open(temp.path(), config, false).expect("open");
        let record = node.append(json!({"k": "v"}), vec![]).expect("append");
        let fetched = node.get(record.seq).expect("get");
        assert_eq!(fetched.data, json!({"k": "v"}));
        assert!(!node.is_daemon());
    }

    #[test]
    fn close_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = test_config(temp.path());
        let node = Node::open(temp.path(), config, true).expect("open");
        node.close().expect("close");
        node.close().expect("close again");
        assert!(node.is_daemon());
    }
}
