//! CPU/memory/trace profiling probes, treated as collaborators with a
//! `Start`/`Stop` lifecycle the runner composes alongside the lock and
//! signal handlers. Absent flags make every probe a no-op.

use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
};

use crate::error::{AgentError, AgentResult, TeardownErrors};

pub struct ProfilingHandles {
    cpu_guard: Option<pprof::ProfilerGuard<'static>>,
    cpu_path: Option<PathBuf>,
    trace_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

impl ProfilingHandles {
    /// Starts whichever probes have a configured output path. `None`
    /// everywhere yields an all-no-op instance.
    pub fn start(cpu_path: Option<PathBuf>, memory_path: Option<PathBuf>, trace_path: Option<PathBuf>) -> AgentResult<Self> {
        let cpu_guard = match &cpu_path {
            Some(_) => Some(
                pprof::ProfilerGuardBuilder::default()
                    .frequency(1000)
                    .build()
                    .map_err(|error| AgentError::Setup(format!("starting cpu profiler: {error}")))?,
            ),
            None => None,
        };

        let trace_guard = trace_path.as_ref().map(|path| {
            let directory = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
            let file_name = path.file_name().unwrap_or_else(|| OsStr::new("trace.log"));
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (_writer, guard) = tracing_appender::non_blocking(appender);
            guard
        });

        if memory_path.is_some() {
            tracing::warn!("memory profiling requested but no allocator-level profiler is wired in this build; skipping");
        }

        Ok(Self { cpu_guard, cpu_path, trace_guard })
    }

    /// Flushes every enabled probe. Every probe is attempted regardless
    /// of earlier failures.
    pub fn stop(&mut self) -> AgentResult<()> {
        let mut errors = TeardownErrors::default();

        if let (Some(guard), Some(path)) = (self.cpu_guard.take(), self.cpu_path.as_ref()) {
            if let Err(error) = write_cpu_profile(&guard, path) {
                errors.push(error);
            }
        }

        // Dropping the non-blocking writer's guard flushes it.
        self.trace_guard.take();

        errors.into_result().map_err(AgentError::from)
    }
}

fn write_cpu_profile(guard: &pprof::ProfilerGuard<'_>, path: &Path) -> Result<(), String> {
    use pprof::protos::Message;

    let report = guard.report().build().map_err(|error| error.to_string())?;
    let profile = report.pprof().map_err(|error| error.to_string())?;
    let bytes = profile.write_to_bytes().map_err(|error| error.to_string())?;
    std::fs::write(path, bytes).map_err(|error| error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_absent_paths_yields_a_no_op_that_stops_cleanly() {
        let mut handles = ProfilingHandles::start(None, None, None).unwrap();
        handles.stop().unwrap();
    }

    #[test]
    fn trace_path_produces_a_flushable_guard() {
        let dir = tempfile::tempdir().unwrap();
        let mut handles = ProfilingHandles::start(None, None, Some(dir.path().join("trace.log"))).unwrap();
        handles.stop().unwrap();
    }
}
