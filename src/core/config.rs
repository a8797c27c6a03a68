//! Purpose: Configuration-root resolution and `config.json` load/init.
//! Exports: `Config`, `default_config_root`, `config_filename`, `load`, `init`.
//! Role: The only reader/writer of the node's on-disk configuration.
//! Invariants: The default configuration root remains `~/.keel` (`KEEL_PATH` wins).
//! Invariants: `load` never invents defaults; a missing file is a `NotFound` error.

use std::path::{Path, PathBuf};

use getrandom::fill as fill_random;
use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind};

pub const CONFIG_FILE: &str = "config.json";
pub const DEFAULT_API_ADDR: &str = "/ip4/127.0.0.1/tcp/5201";

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    pub identity: Identity,
    pub addresses: Addresses,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Identity {
    pub peer_id: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Addresses {
    pub api: String,
}

pub fn default_config_root() -> PathBuf {
    if let Some(root) = std::env::var_os("KEEL_PATH") {
        return PathBuf::from(root);
    }
    let home = std::env::var_os("HOME").unwrap_or_default();
    PathBuf::from(home).join(".keel")
}

pub fn config_filename(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn load(root: &Path) -> Result<Config, Error> {
    let path = config_filename(root);
    let raw = std::fs::read_to_string(&path).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            Error::new(ErrorKind::NotFound)
                .with_message("no keel configuration found")
                .with_path(&path)
                .with_hint("Run 'keel init' to create one.")
        } else {
            Error::new(ErrorKind::Io)
                .with_message("failed to read configuration")
                .with_path(&path)
                .with_source(err)
        }
    })?;
    serde_json::from_str(&raw).map_err(|err| {
        Error::new(ErrorKind::Config)
            .with_message("failed to parse configuration")
            .with_path(&path)
            .with_source(err)
    })
}

/// Creates the configuration root and writes a fresh `config.json` with a
/// generated peer id. Refuses to overwrite an existing configuration.
pub fn init(root: &Path, api: Option<String>) -> Result<Config, Error> {
    let path = config_filename(root);
    if path.exists() {
        return Err(Error::new(ErrorKind::AlreadyExists)
            .with_message("keel is already initialized")
            .with_path(&path)
            .with_hint("Remove the configuration root to start over."));
    }
    std::fs::create_dir_all(root).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to create configuration root")
            .with_path(root)
            .with_source(err)
    })?;

    let config = Config {
        identity: Identity {
            peer_id: generate_peer_id()?,
        },
        addresses: Addresses {
            api: api.unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
        },
    };
    let body = serde_json::to_string_pretty(&config).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode configuration")
            .with_source(err)
    })?;
    std::fs::write(&path, format!("{body}\n")).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to write configuration")
            .with_path(&path)
            .with_source(err)
    })?;
    Ok(config)
}

fn generate_peer_id() -> Result<String, Error> {
    let mut raw = [0u8; 20];
    fill_random(&mut raw).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to gather entropy for peer id")
            .with_source(err)
    })?;
    let mut id = String::with_capacity(raw.len() * 2);
    for byte in raw {
        id.push_str(&format!("{byte:02x}"));
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::{DEFAULT_API_ADDR, init, load};
    use crate::core::error::ErrorKind;

    #[test]
    fn init_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("keel");
        let written = init(&root, None).expect("init");
        let loaded = load(&root).expect("load");
        assert_eq!(loaded.identity.peer_id, written.identity.peer_id);
        assert_eq!(loaded.addresses.api, DEFAULT_API_ADDR);
        assert_eq!(written.identity.peer_id.len(), 40);
    }

    #[test]
    fn init_honors_api_override() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("keel");
        let config = init(&root, Some("/ip4/127.0.0.1/tcp/9999".to_string())).expect("init");
        assert_eq!(config.addresses.api, "/ip4/127.0.0.1/tcp/9999");
    }

    #[test]
    fn load_missing_config_is_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = load(temp.path()).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.hint().is_some());
    }

    #[test]
    fn load_malformed_config_is_config_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("config.json"), "{not json").expect("write");
        let err = load(temp.path()).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn init_refuses_to_overwrite() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("keel");
        init(&root, None).expect("init");
        let err = init(&root, None).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }
}
