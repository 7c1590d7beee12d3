use std::sync::Arc;

use anyhow::Result;
use remoteprocess::{Pid, ProcessMemory};
use serde_derive::Serialize;

use crate::frame_walker;
use crate::string_cache::StringCache;
use crate::version_table::VersionDescriptor;

/// Call stack for a single python thread.
#[derive(Debug, Clone, Serialize)]
pub struct StackTrace {
    /// The process id that generated this stack trace.
    pub pid: Pid,
    /// The python thread id for this stack trace.
    pub thread_id: u64,
    /// The python thread name for this stack trace.
    pub thread_name: Option<String>,
    /// The OS thread id for this stack trace.
    pub os_thread_id: Option<u64>,
    /// Whether the thread had a live, non-garbage frame chain.
    pub active: bool,
    /// Whether the thread held the GIL at sample time.
    pub owns_gil: bool,
    pub frames: Vec<Frame>,
    /// Process commandline / parent process info.
    pub process_info: Option<Arc<ProcessInfo>>,
}

/// Information about a single function call in a stack trace.
#[derive(Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Clone, Serialize)]
pub struct Frame {
    /// A composite identity stable for the life of this code object + bytecode offset,
    /// used to intern frames in the binary emitter.
    pub key: u64,
    /// The function name (qualname where available).
    pub name: String,
    /// The full filename of the file.
    pub filename: String,
    /// The module/shared library the frame belongs to, if known.
    pub module: Option<String>,
    /// A short, more readable, representation of the filename.
    pub short_filename: Option<String>,
    /// The line number inside the file.
    pub line: i32,
    /// The line the statement/expression ends on (PEP 626); equal to `line` pre-3.11.
    pub line_end: i32,
    /// The column the statement/expression starts on, or 0 if unavailable.
    pub column: i32,
    /// The column the statement/expression ends on, or 0 if unavailable.
    pub column_end: i32,
    /// If this is the outermost (entry) frame of the thread's chain.
    pub is_entry: bool,
    /// Set for the CPython 3.11+ shim frame bridging a C call; filtered from user output.
    pub is_shim_entry: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub command_line: String,
    pub parent: Option<Arc<ProcessInfo>>,
}

impl ProcessInfo {
    pub fn to_frame(&self) -> Frame {
        Frame {
            key: 0,
            name: format!("process {}:\"{}\"", self.pid, self.command_line),
            filename: String::new(),
            module: None,
            short_filename: None,
            line: 0,
            line_end: 0,
            column: 0,
            column_end: 0,
            is_entry: true,
            is_shim_entry: false,
        }
    }
}

impl StackTrace {
    pub fn status_str(&self) -> &str {
        match (self.owns_gil, self.active) {
            (_, false) => "idle",
            (true, true) => "active+gil",
            (false, true) => "active",
        }
    }

    pub fn format_threadid(&self) -> String {
        #[cfg(target_os = "macos")]
        return format!("{:#X}", self.thread_id);

        #[cfg(not(target_os = "macos"))]
        match self.os_thread_id {
            Some(tid) => format!("{}", tid),
            None => format!("{:#X}", self.thread_id),
        }
    }
}

/// Walks every thread hanging off `interp_addr` and decodes its call stack, interning
/// filenames/scopes through `cache` and identifying which thread (if any) owns the GIL.
pub fn get_stack_traces<P: ProcessMemory>(
    process: &P,
    descriptor: &VersionDescriptor,
    interp_addr: usize,
    pid: Pid,
    cache: &mut StringCache,
    gil_thread_id: Option<u64>,
) -> Result<Vec<StackTrace>> {
    let threads = frame_walker::walk_interpreter(process, descriptor, interp_addr, cache)?;

    let mut traces = Vec::with_capacity(threads.len());
    for thread in threads {
        let frame_count = thread
            .frames
            .iter()
            .filter(|f| f.scope != "<shim>" && !f.is_shim_entry)
            .count();
        let mut visible = 0usize;

        let frames: Vec<Frame> = thread
            .frames
            .into_iter()
            .filter(|f| f.scope != "<shim>")
            .map(|f| {
                let is_entry = !f.is_shim_entry && {
                    visible += 1;
                    visible == frame_count
                };
                Frame {
                    key: f.key,
                    name: f.scope,
                    filename: f.filename,
                    module: None,
                    short_filename: None,
                    line: f.line,
                    line_end: f.line_end,
                    column: f.column,
                    column_end: f.column_end,
                    is_entry,
                    is_shim_entry: f.is_shim_entry,
                }
            })
            .collect();

        traces.push(StackTrace {
            pid,
            thread_id: thread.thread_id,
            thread_name: None,
            os_thread_id: None,
            active: !thread.invalid,
            owns_gil: gil_thread_id == Some(thread.thread_id),
            frames,
            process_info: None,
        });
    }

    Ok(traces)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_trace() -> StackTrace {
        StackTrace {
            pid: 1,
            thread_id: 42,
            thread_name: None,
            os_thread_id: None,
            active: true,
            owns_gil: false,
            frames: Vec::new(),
            process_info: None,
        }
    }

    #[test]
    fn test_status_str_idle_overrides_gil() {
        let mut trace = sample_trace();
        trace.active = false;
        trace.owns_gil = true;
        assert_eq!(trace.status_str(), "idle");
    }

    #[test]
    fn test_status_str_active_with_gil() {
        let mut trace = sample_trace();
        trace.owns_gil = true;
        assert_eq!(trace.status_str(), "active+gil");
    }

    #[cfg(not(target_os = "macos"))]
    #[test]
    fn test_format_threadid_prefers_os_thread_id() {
        let mut trace = sample_trace();
        assert_eq!(trace.format_threadid(), "0x2A");
        trace.os_thread_id = Some(7);
        assert_eq!(trace.format_threadid(), "7");
    }
}
