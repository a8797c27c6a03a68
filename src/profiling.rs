// CPU and heap profile capture for debug invocations.
//
// The CPU profile file is created eagerly at start so a bad working directory
// aborts the invocation up front instead of losing the profile at the end.
// Stopping flushes the CPU profile and then snapshots process memory, once,
// on every path that started profiling (the guard runs on drop).
use std::fs::File;
use std::path::{Path, PathBuf};

use serde_json::json;
use tracing::warn;

use crate::core::error::{Error, ErrorKind};

pub const CPU_PROFILE_FILE: &str = "keel.cpuprof";
pub const HEAP_PROFILE_FILE: &str = "keel.memprof";

const SAMPLE_FREQUENCY_HZ: i32 = 100;

pub struct Profiler {
    cpu_file: Option<File>,
    guard: Option<pprof::ProfilerGuard<'static>>,
    heap_path: PathBuf,
    finished: bool,
}

impl std::fmt::Debug for Profiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Profiler")
            .field("cpu_file", &self.cpu_file)
            .field("heap_path", &self.heap_path)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl Profiler {
    /// Begins CPU profiling with output rooted in `dir`. Failure to create
    /// the profile file is fatal to the invocation.
    pub fn start(dir: &Path) -> Result<Self, Error> {
        let cpu_path = dir.join(CPU_PROFILE_FILE);
        let cpu_file = File::create(&cpu_path).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to create cpu profile")
                .with_path(&cpu_path)
                .with_source(err)
        })?;
        let guard = pprof::ProfilerGuardBuilder::default()
            .frequency(SAMPLE_FREQUENCY_HZ)
            .build()
            .map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to start cpu profiler")
                    .with_source(err)
            })?;
        Ok(Self {
            cpu_file: Some(cpu_file),
            guard: Some(guard),
            heap_path: dir.join(HEAP_PROFILE_FILE),
            finished: false,
        })
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        if let (Some(guard), Some(mut file)) = (self.guard.take(), self.cpu_file.take()) {
            match guard.report().build() {
                Ok(report) => {
                    if let Err(err) = report.flamegraph(&mut file) {
                        warn!("failed to write cpu profile: {err}");
                    }
                }
                Err(err) => warn!("failed to build cpu profile report: {err}"),
            }
        }

        // Cleanup-phase failure: logged, never fatal, and never retried.
        if let Err(err) = write_heap_profile(&self.heap_path) {
            warn!("failed to write heap profile: {err}");
        }
    }
}

impl Drop for Profiler {
    fn drop(&mut self) {
        self.finish();
    }
}

fn write_heap_profile(path: &Path) -> Result<(), Error> {
    use sysinfo::{PidExt, ProcessExt, System, SystemExt};

    let pid = sysinfo::get_current_pid().map_err(|err| {
        Error::new(ErrorKind::Internal).with_message(format!("failed to resolve current pid: {err}"))
    })?;
    let mut sys = System::new();
    sys.refresh_process(pid);
    let process = sys.process(pid).ok_or_else(|| {
        Error::new(ErrorKind::Internal)
            .with_message("current process is missing from the process table")
    })?;
    let snapshot = json!({
        "pid": pid.as_u32(),
        "rss_bytes": process.memory(),
        "virtual_bytes": process.virtual_memory(),
    });
    std::fs::write(path, format!("{snapshot:#}\n")).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to write heap profile")
            .with_path(path)
            .with_source(err)
    })
}

#[cfg(test)]
mod tests {
    use super::{CPU_PROFILE_FILE, HEAP_PROFILE_FILE, Profiler};
    use crate::core::error::ErrorKind;

    #[test]
    fn stop_writes_both_profiles() {
        let temp = tempfile::tempdir().expect("tempdir");
        let profiler = Profiler::start(temp.path()).expect("start");
        drop(profiler);

        assert!(temp.path().join(CPU_PROFILE_FILE).exists());
        let heap = std::fs::read_to_string(temp.path().join(HEAP_PROFILE_FILE)).expect("heap");
        let value: serde_json::Value = serde_json::from_str(&heap).expect("json");
        assert!(value.get("rss_bytes").is_some());
    }

    #[test]
    fn unwritable_profile_path_is_fatal_at_start() {
        let temp = tempfile::tempdir().expect("tempdir");
        let missing = temp.path().join("no-such-dir");
        let err = Profiler::start(&missing).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
