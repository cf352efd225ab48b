//! Guest file access: `guest-file-open/read/write/flush/close`.
//!
//! Open files live in a handle table keyed by ids from
//! [`AgentState::get_fd_handle`], so a handle is never reused within the
//! process lifetime. Payloads travel base64-encoded in `buf-b64`.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;
use serde_json::value::RawValue;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::HandlerError;
use crate::protocol::parse_arguments;
use crate::registry::CommandDescriptor;
use crate::state::AgentState;

/// Bytes read when `count` is omitted.
pub const DEFAULT_READ_COUNT: usize = 4096;

/// Largest single read.
pub const MAX_READ_COUNT: usize = 48 * 1024 * 1024;

type FileOp = fn(&FileTable, Option<&RawValue>) -> Result<Value, HandlerError>;

/// Open guest files by handle.
#[derive(Debug)]
pub struct FileTable {
    state: Arc<AgentState>,
    files: Mutex<HashMap<i64, File>>,
}

#[derive(Debug, Deserialize)]
struct OpenArgs {
    path: String,
    #[serde(default)]
    mode: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HandleArgs {
    handle: i64,
}

#[derive(Debug, Deserialize)]
struct ReadArgs {
    handle: i64,
    #[serde(default)]
    count: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct WriteArgs {
    handle: i64,
    #[serde(rename = "buf-b64")]
    buf_b64: String,
    #[serde(default)]
    count: Option<usize>,
}

pub fn descriptors(files: &Arc<FileTable>) -> Vec<CommandDescriptor> {
    let bind = |name: &str, op: FileOp| {
        let files = Arc::clone(files);
        CommandDescriptor::new(name, move |args| op(&files, args))
    };
    vec![
        bind("guest-file-open", FileTable::open),
        bind("guest-file-read", FileTable::read),
        bind("guest-file-write", FileTable::write),
        bind("guest-file-flush", FileTable::flush),
        bind("guest-file-close", FileTable::close),
    ]
}

/// `fopen`-style mode string to open options. A `b` anywhere is ignored.
fn open_options(mode: &str) -> Option<OpenOptions> {
    let mut options = OpenOptions::new();
    match mode.replace('b', "").as_str() {
        "r" => options.read(true),
        "r+" => options.read(true).write(true),
        "w" => options.write(true).create(true).truncate(true),
        "w+" => options.read(true).write(true).create(true).truncate(true),
        "a" => options.append(true).create(true),
        "a+" => options.read(true).append(true).create(true),
        _ => return None,
    };
    Some(options)
}

fn handle_not_found(handle: i64) -> HandlerError {
    HandlerError::failed(format!("handle '{handle}' has not been found"))
}

impl FileTable {
    pub fn new(state: Arc<AgentState>) -> Self {
        Self {
            state,
            files: Mutex::new(HashMap::new()),
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<i64, File>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_file<T>(
        &self,
        handle: i64,
        op: impl FnOnce(&mut File) -> Result<T, HandlerError>,
    ) -> Result<T, HandlerError> {
        let mut table = self.table();
        let file = table.get_mut(&handle).ok_or_else(|| handle_not_found(handle))?;
        op(file)
    }

    pub fn open_count(&self) -> usize {
        self.table().len()
    }

    fn open(&self, args: Option<&RawValue>) -> Result<Value, HandlerError> {
        let args: OpenArgs = parse_arguments(args)?;
        let mode = args.mode.as_deref().unwrap_or("r");
        let options = open_options(mode)
            .ok_or_else(|| HandlerError::failed(format!("invalid file open mode '{mode}'")))?;
        let file = options
            .open(&args.path)
            .map_err(|e| HandlerError::io(format!("failed to open file '{}'", args.path), e))?;

        let handle = self.state.get_fd_handle();
        self.table().insert(handle, file);
        info!(path = %args.path, mode, handle, "Opened guest file");
        Ok(json!(handle))
    }

    fn read(&self, args: Option<&RawValue>) -> Result<Value, HandlerError> {
        let args: ReadArgs = parse_arguments(args)?;
        let count = args.count.unwrap_or(DEFAULT_READ_COUNT);
        if count > MAX_READ_COUNT {
            return Err(HandlerError::failed(format!(
                "value '{count}' is invalid for argument count, at most {MAX_READ_COUNT} allowed"
            )));
        }

        let (buf, eof) = self.with_file(args.handle, |file| {
            read_up_to(file, count).map_err(|e| HandlerError::io("failed to read file", e))
        })?;
        debug!(handle = args.handle, bytes = buf.len(), eof, "Read guest file");
        Ok(json!({
            "count": buf.len(),
            "buf-b64": BASE64.encode(&buf),
            "eof": eof,
        }))
    }

    fn write(&self, args: Option<&RawValue>) -> Result<Value, HandlerError> {
        let args: WriteArgs = parse_arguments(args)?;
        let buf = BASE64
            .decode(args.buf_b64.as_bytes())
            .map_err(|e| HandlerError::failed(format!("invalid base64 in buf-b64: {e}")))?;
        let count = args.count.unwrap_or(buf.len());
        if count > buf.len() {
            return Err(HandlerError::failed(format!(
                "value '{count}' is invalid for argument count, buffer holds {} bytes",
                buf.len()
            )));
        }

        self.with_file(args.handle, |file| {
            file.write_all(&buf[..count])
                .map_err(|e| HandlerError::io("failed to write file", e))
        })?;
        debug!(handle = args.handle, bytes = count, "Wrote guest file");
        Ok(json!({ "count": count, "eof": false }))
    }

    fn flush(&self, args: Option<&RawValue>) -> Result<Value, HandlerError> {
        let args: HandleArgs = parse_arguments(args)?;
        self.with_file(args.handle, |file| {
            file.flush()
                .map_err(|e| HandlerError::io("failed to flush file", e))
        })?;
        Ok(json!({}))
    }

    fn close(&self, args: Option<&RawValue>) -> Result<Value, HandlerError> {
        let args: HandleArgs = parse_arguments(args)?;
        let file = self
            .table()
            .remove(&args.handle)
            .ok_or_else(|| handle_not_found(args.handle))?;
        drop(file);
        info!(handle = args.handle, "Closed guest file");
        Ok(json!({}))
    }
}

/// Read until `count` bytes or end of file. `eof` is set when the file ran out.
fn read_up_to(file: &mut File, count: usize) -> io::Result<(Vec<u8>, bool)> {
    let mut buf = vec![0_u8; count];
    let mut filled = 0;
    while filled < count {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    buf.truncate(filled);
    Ok((buf, filled < count))
}
