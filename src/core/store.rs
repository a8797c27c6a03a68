// Append-only JSONL record log. Appends are serialized across processes with
// an exclusive file lock; sequence numbers are recomputed under the lock so
// concurrent writers never collide.
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;

use crate::core::error::{Error, ErrorKind};

pub const STORE_FILE: &str = "records.log";

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Record {
    pub seq: u64,
    pub id: String,
    pub time: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub data: Value,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StoreStat {
    pub records: u64,
    pub log_bytes: u64,
}

pub struct Store {
    path: PathBuf,
    file: File,
}

impl Store {
    pub fn open(root: &Path) -> Result<Self, Error> {
        let path = root.join(STORE_FILE);
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|err| {
                Error::new(map_io_error_kind(&err))
                    .with_message("failed to open record log")
                    .with_path(&path)
                    .with_source(err)
            })?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, data: Value, tags: Vec<String>) -> Result<Record, Error> {
        self.file.lock_exclusive().map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to lock record log")
                .with_path(&self.path)
                .with_source(err)
        })?;
        let outcome = self.append_locked(data, tags);
        let _ = fs2::FileExt::unlock(&self.file);
        outcome
    }

    fn append_locked(&mut self, data: Value, tags: Vec<String>) -> Result<Record, Error> {
        let seq = self.last_seq()? + 1;
        let record = Record {
            seq,
            id: record_id(&data),
            time: now_rfc3339()?,
            tags,
            data,
        };
        let mut line = serde_json::to_string(&record).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode record")
                .with_source(err)
        })?;
        line.push('\n');
        self.file.write_all(line.as_bytes()).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to append record")
                .with_path(&self.path)
                .with_source(err)
        })?;
        self.file.flush().map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to flush record log")
                .with_path(&self.path)
                .with_source(err)
        })?;
        Ok(record)
    }

    pub fn get(&mut self, seq: u64) -> Result<Record, Error> {
        for record in self.scan()? {
            let record = record?;
            if record.seq == seq {
                return Ok(record);
            }
        }
        Err(Error::new(ErrorKind::NotFound)
            .with_message(format!("no record with seq {seq}"))
            .with_path(&self.path))
    }

    pub fn stat(&mut self) -> Result<StoreStat, Error> {
        let mut records = 0u64;
        for record in self.scan()? {
            record?;
            records += 1;
        }
        let log_bytes = self
            .file
            .metadata()
            .map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to stat record log")
                    .with_path(&self.path)
                    .with_source(err)
            })?
            .len();
        Ok(StoreStat { records, log_bytes })
    }

    pub fn sync(&self) -> Result<(), Error> {
        self.file.sync_all().map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to sync record log")
                .with_path(&self.path)
                .with_source(err)
        })
    }

    fn last_seq(&mut self) -> Result<u64, Error> {
        let mut last = 0u64;
        for record in self.scan()? {
            last = record?.seq;
        }
        Ok(last)
    }

    fn scan(&mut self) -> Result<impl Iterator<Item = Result<Record, Error>>, Error> {
        self.file.seek(SeekFrom::Start(0)).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to rewind record log")
                .with_path(&self.path)
                .with_source(err)
        })?;
        let path = self.path.clone();
        let reader = BufReader::new(&self.file);
        Ok(reader.lines().map(move |line| {
            let line = line.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to read record log")
                    .with_path(&path)
                    .with_source(err)
            })?;
            serde_json::from_str(&line).map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("record log is corrupt")
                    .with_path(&path)
                    .with_source(err)
            })
        }))
    }
}

fn map_io_error_kind(err: &std::io::Error) -> ErrorKind {
    match err.kind() {
        std::io::ErrorKind::NotFound => ErrorKind::NotFound,
        _ => ErrorKind::Io,
    }
}

fn record_id(data: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.to_string().as_bytes());
    let digest = hasher.finalize();
    let mut id = String::with_capacity(digest.len() * 2);
    for byte in digest {
        id.push_str(&format!("{byte:02x}"));
    }
    id
}

fn now_rfc3339() -> Result<String, Error> {
    let duration = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("system clock is before the unix epoch")
                .with_source(err)
        })?;
    let ts = time::OffsetDateTime::from_unix_timestamp_nanos(duration.as_nanos() as i128)
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to build timestamp")
                .with_source(err)
        })?;
    ts.format(&Rfc3339).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to format timestamp")
            .with_source(err)
    })
}
