//! Duplex I/O protocol with the in-container code runner
//!
//! The agent talks to every kernel over two framed byte channels: an input
//! channel carrying command messages and an output channel carrying run
//! output. Each message is a command tag plus one payload frame. Output is
//! demultiplexed into per-run bounded queues; completion and service replies
//! travel on dedicated side channels.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::json;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::system::Flag;
use crate::types::KernelId;

/// Payloads beyond this size are truncated on receipt.
pub const MAX_RECORD_SIZE: usize = 10 * 1024 * 1024;

/// Upper bound accepted from the wire before truncation applies.
const MAX_FRAME_SIZE: usize = 32 * 1024 * 1024;

const OUTPUT_QUEUE_CAPACITY: usize = 4096;
const SIDE_QUEUE_CAPACITY: usize = 128;
const SERVICE_REPLY_TIMEOUT: Duration = Duration::from_secs(10);
const STATUS_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Message kinds forwarded to the API client; control tags become the
/// result status instead.
const VISIBLE_MSG_TYPES: &[&str] = &["stdout", "stderr", "media", "html", "log", "completion"];

/// Capabilities advertised by the API client for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientFeature {
    Input,
    Continuation,
}

/// Execution mode of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Query,
    Batch,
    Input,
    Continue,
}

impl RunMode {
    pub fn from_str(mode: &str) -> Option<Self> {
        match mode {
            "query" => Some(RunMode::Query),
            "batch" => Some(RunMode::Batch),
            "input" => Some(RunMode::Input),
            "continue" => Some(RunMode::Continue),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("no runner attached to the kernel")]
    NotAttached,

    #[error("no active run to read results from")]
    NoActiveRun,

    #[error("runner transport closed")]
    Closed,

    #[error("runner status request timed out")]
    StatusTimeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One decoded output record
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRecord {
    pub msg_type: String,
    pub data: String,
}

impl ResultRecord {
    fn new(msg_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            msg_type: msg_type.into(),
            data: data.into(),
        }
    }
}

/// Terminal (or intermediate) status of one `get_next_result` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Continued,
    Finished,
    CleanFinished,
    BuildFinished,
    ExecTimeout,
    WaitingInput,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Continued => "continued",
            RunStatus::Finished => "finished",
            RunStatus::CleanFinished => "clean-finished",
            RunStatus::BuildFinished => "build-finished",
            RunStatus::ExecTimeout => "exec-timeout",
            RunStatus::WaitingInput => "waiting-input",
        }
    }
}

/// Aggregated result of one `get_next_result` call
#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: Option<String>,
    pub status: RunStatus,
    pub exit_code: Option<i64>,
    pub options: Option<serde_json::Value>,
    console: serde_json::Map<String, serde_json::Value>,
}

impl RunResult {
    pub fn to_json(&self) -> serde_json::Value {
        let mut result = serde_json::Map::new();
        result.insert("runId".into(), json!(self.run_id));
        result.insert("status".into(), json!(self.status.as_str()));
        result.insert("exitCode".into(), json!(self.exit_code));
        result.insert("options".into(), self.options.clone().unwrap_or(json!(null)));
        for (key, value) in &self.console {
            result.insert(key.clone(), value.clone());
        }
        serde_json::Value::Object(result)
    }
}

/// Options for a batch-mode run
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct BatchOpts {
    #[serde(default)]
    pub clean: Option<String>,
    #[serde(default)]
    pub build: Option<String>,
    #[serde(default)]
    pub exec: Option<String>,
}

fn encode_message(tag: &str, payload: &[u8]) -> Bytes {
    debug_assert!(tag.len() <= u8::MAX as usize && tag.is_ascii());
    let mut buf = BytesMut::with_capacity(1 + tag.len() + payload.len());
    buf.put_u8(tag.len() as u8);
    buf.put_slice(tag.as_bytes());
    buf.put_slice(payload);
    buf.freeze()
}

fn decode_message(frame: &mut BytesMut) -> Option<(String, BytesMut)> {
    if frame.is_empty() {
        return None;
    }
    let tag_len = frame[0] as usize;
    if frame.len() < 1 + tag_len {
        return None;
    }
    let tag = String::from_utf8(frame[1..1 + tag_len].to_vec()).ok()?;
    let payload = frame.split_off(1 + tag_len);
    Some((tag, payload))
}

fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_codec()
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

struct RunQueue {
    tx: mpsc::Sender<ResultRecord>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<ResultRecord>>>,
    activated: Flag,
}

impl RunQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(OUTPUT_QUEUE_CAPACITY);
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            activated: Flag::new(),
        }
    }
}

/// Pending runs in insertion order plus the active/current pointers.
///
/// `active` names the run whose queue receives incoming frames; `current`
/// names the run an API request is serving. They coincide except in the
/// window between activation and the next `attach_output_queue`.
#[derive(Default)]
struct OutputQueues {
    pending: IndexMap<String, RunQueue>,
    active: Option<String>,
    current: Option<String>,
}

struct RunnerShared {
    kernel_id: KernelId,
    queues: Mutex<OutputQueues>,
    completion_tx: mpsc::Sender<BytesMut>,
    service_tx: mpsc::Sender<BytesMut>,
    status_tx: mpsc::Sender<BytesMut>,
}

impl RunnerShared {
    /// Route a record to the active run queue; drop it when no queue is
    /// active or the queue is full.
    fn push_record(&self, record: ResultRecord) {
        let queues = self.queues.lock();
        let Some(active) = queues.active.as_ref() else {
            return;
        };
        let Some(queue) = queues.pending.get(active) else {
            return;
        };
        if queue.tx.try_send(record).is_err() {
            debug!(kernel_id = %self.kernel_id, "output queue overflow, dropping record");
        }
    }

    /// Move the current run back to the head so the same run continues.
    fn resume_output_queue(&self) {
        let mut queues = self.queues.lock();
        if let Some(current) = queues.current.clone() {
            if let Some(index) = queues.pending.get_index_of(&current) {
                queues.pending.move_index(index, 0);
            }
        }
    }

    /// Conclude the current run and hand the head pending queue, if any, to
    /// its waiter.
    fn next_output_queue(&self) {
        let mut queues = self.queues.lock();
        if let Some(current) = queues.current.take() {
            queues.pending.shift_remove(&current);
        }
        match queues.pending.first() {
            Some((run_id, queue)) => {
                let run_id = run_id.clone();
                queue.activated.set();
                queues.active = Some(run_id);
            }
            None => {
                queues.active = None;
            }
        }
    }
}

/// The agent-side endpoint of one kernel's runner protocol.
pub struct KernelRunner {
    kernel_id: KernelId,
    exec_timeout: Duration,
    client_features: HashSet<ClientFeature>,
    input: tokio::sync::Mutex<FramedWrite<BoxedWriter, LengthDelimitedCodec>>,
    shared: Arc<RunnerShared>,
    read_task: Mutex<Option<JoinHandle<()>>>,
    watchdog_task: Mutex<Option<JoinHandle<()>>>,
    completion_rx: tokio::sync::Mutex<mpsc::Receiver<BytesMut>>,
    service_rx: tokio::sync::Mutex<mpsc::Receiver<BytesMut>>,
    status_rx: tokio::sync::Mutex<mpsc::Receiver<BytesMut>>,
}

impl KernelRunner {
    /// Connect to the kernel's REPL ports.
    pub async fn connect(
        kernel_id: KernelId,
        host: &str,
        repl_in_port: u16,
        repl_out_port: u16,
        exec_timeout: Duration,
        client_features: HashSet<ClientFeature>,
    ) -> Result<Self, RunnerError> {
        let input = TcpStream::connect((host, repl_in_port)).await?;
        let output = TcpStream::connect((host, repl_out_port)).await?;
        input.set_nodelay(true)?;
        let (_, input_writer) = tokio::io::split(input);
        let (output_reader, _) = tokio::io::split(output);
        Ok(Self::from_streams(
            kernel_id,
            Box::new(input_writer),
            Box::new(output_reader),
            exec_timeout,
            client_features,
        ))
    }

    /// Build a runner over arbitrary byte streams (used with in-memory
    /// duplex pipes in tests).
    pub fn from_streams(
        kernel_id: KernelId,
        input: BoxedWriter,
        output: BoxedReader,
        exec_timeout: Duration,
        client_features: HashSet<ClientFeature>,
    ) -> Self {
        let (completion_tx, completion_rx) = mpsc::channel(SIDE_QUEUE_CAPACITY);
        let (service_tx, service_rx) = mpsc::channel(SIDE_QUEUE_CAPACITY);
        let (status_tx, status_rx) = mpsc::channel(SIDE_QUEUE_CAPACITY);
        let shared = Arc::new(RunnerShared {
            kernel_id: kernel_id.clone(),
            queues: Mutex::new(OutputQueues::default()),
            completion_tx,
            service_tx,
            status_tx,
        });

        let reader = FramedRead::new(output, frame_codec());
        let read_task = tokio::spawn(read_output(reader, shared.clone()));

        Self {
            kernel_id,
            exec_timeout,
            client_features,
            input: tokio::sync::Mutex::new(FramedWrite::new(input, frame_codec())),
            shared,
            read_task: Mutex::new(Some(read_task)),
            watchdog_task: Mutex::new(None),
            completion_rx: tokio::sync::Mutex::new(completion_rx),
            service_rx: tokio::sync::Mutex::new(service_rx),
            status_rx: tokio::sync::Mutex::new(status_rx),
        }
    }

    pub fn kernel_id(&self) -> &KernelId {
        &self.kernel_id
    }

    /// Close the transports and stop the background tasks. Safe to call on
    /// every exit path; later calls are no-ops.
    pub async fn close(&self) {
        if let Some(watchdog) = self.watchdog_task.lock().take() {
            watchdog.abort();
        }
        {
            let mut input = self.input.lock().await;
            let _ = input.close().await;
        }
        let read_task = self.read_task.lock().take();
        if let Some(read_task) = read_task {
            read_task.abort();
            let _ = read_task.await;
        }
    }

    async fn feed(&self, tag: &str, payload: &[u8]) -> Result<(), RunnerError> {
        let mut input = self.input.lock().await;
        input
            .send(encode_message(tag, payload))
            .await
            .map_err(RunnerError::Io)
    }

    pub async fn feed_batch(&self, opts: &BatchOpts) -> Result<(), RunnerError> {
        self.feed("clean", opts.clean.as_deref().unwrap_or("").as_bytes())
            .await?;
        self.feed("build", opts.build.as_deref().unwrap_or("").as_bytes())
            .await?;
        self.feed("exec", opts.exec.as_deref().unwrap_or("").as_bytes())
            .await
    }

    pub async fn feed_code(&self, text: &str) -> Result<(), RunnerError> {
        self.feed("code", text.as_bytes()).await
    }

    pub async fn feed_input(&self, text: &str) -> Result<(), RunnerError> {
        self.feed("input", text.as_bytes()).await
    }

    pub async fn feed_interrupt(&self) -> Result<(), RunnerError> {
        self.feed("interrupt", b"").await
    }

    /// Request code completion; the reply arrives on the dedicated side
    /// channel independent of run output.
    pub async fn feed_and_get_completion(
        &self,
        code: &str,
        opts: &serde_json::Value,
    ) -> Result<serde_json::Value, RunnerError> {
        let mut payload = json!({ "code": code });
        if let (Some(target), Some(extra)) = (payload.as_object_mut(), opts.as_object()) {
            for (key, value) in extra {
                target.insert(key.clone(), value.clone());
            }
        }
        self.feed("complete", payload.to_string().as_bytes()).await?;
        match self.completion_rx.lock().await.recv().await {
            Some(reply) => Ok(serde_json::from_slice(&reply).unwrap_or(json!([]))),
            None => Ok(json!([])),
        }
    }

    /// Ask the runner to start an in-container service app.
    pub async fn feed_start_service(
        &self,
        service_info: &serde_json::Value,
    ) -> Result<serde_json::Value, RunnerError> {
        self.feed("start-service", service_info.to_string().as_bytes())
            .await?;
        let mut service_rx = self.service_rx.lock().await;
        match tokio::time::timeout(SERVICE_REPLY_TIMEOUT, service_rx.recv()).await {
            Ok(Some(reply)) => {
                Ok(serde_json::from_slice(&reply)
                    .unwrap_or(json!({"status": "failed", "error": "malformed reply"})))
            }
            Ok(None) => Ok(json!({"status": "failed", "error": "cancelled"})),
            Err(_) => Ok(json!({"status": "failed", "error": "timeout"})),
        }
    }

    pub async fn feed_shutdown_service(&self, service: &str) -> Result<(), RunnerError> {
        self.feed("shutdown-service", json!({ "name": service }).to_string().as_bytes())
            .await
    }

    /// Ping the runner; resolves once the in-container bootstrap completed.
    pub async fn check_status(&self) -> Result<serde_json::Value, RunnerError> {
        self.feed("status", b"").await?;
        let mut status_rx = self.status_rx.lock().await;
        match tokio::time::timeout(STATUS_REPLY_TIMEOUT, status_rx.recv()).await {
            Ok(Some(reply)) => {
                Ok(rmp_serde::from_slice(&reply).unwrap_or(serde_json::Value::Null))
            }
            Ok(None) => Err(RunnerError::Closed),
            Err(_) => Err(RunnerError::StatusTimeout),
        }
    }

    /// Fetch the live service-app descriptors known to the runner.
    pub async fn get_service_apps(&self) -> Result<serde_json::Value, RunnerError> {
        self.feed("get-apps", b"").await?;
        let mut service_rx = self.service_rx.lock().await;
        match tokio::time::timeout(SERVICE_REPLY_TIMEOUT, service_rx.recv()).await {
            Ok(Some(reply)) => Ok(serde_json::from_slice(&reply)
                .unwrap_or(json!({"status": "failed", "data": []}))),
            Ok(None) => Ok(json!({"status": "failed", "data": []})),
            Err(_) => Ok(json!({"status": "failed", "data": []})),
        }
    }

    /// Attach (or re-attach) the output queue of a run. When another run is
    /// mid-stream the call parks until that run finishes and this queue is
    /// activated. Returns the effective run id.
    pub async fn attach_output_queue(&self, run_id: Option<String>) -> String {
        let run_id =
            run_id.unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        let wait_for = {
            let mut queues = self.shared.queues.lock();
            if !queues.pending.contains_key(&run_id) {
                queues.pending.insert(run_id.clone(), RunQueue::new());
            }
            if queues.active.is_none() {
                queues.active = Some(run_id.clone());
                None
            } else if queues.active.as_deref() == Some(run_id.as_str())
                || queues.current.as_deref() == Some(run_id.as_str())
            {
                // Continuing the ongoing run; no need to wait.
                None
            } else {
                Some(queues.pending[&run_id].activated.clone())
            }
        };
        if let Some(activated) = wait_for {
            activated.wait().await;
            activated.clear();
        }
        self.shared.queues.lock().current = Some(run_id.clone());
        run_id
    }

    /// Arm the execution watchdog for a fresh run. A zero timeout disables
    /// it.
    pub fn start_watchdog(&self) {
        if self.exec_timeout.is_zero() {
            return;
        }
        let shared = self.shared.clone();
        let timeout = self.exec_timeout;
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            shared.push_record(ResultRecord::new("exec-timeout", ""));
        });
        if let Some(old) = self.watchdog_task.lock().replace(task) {
            old.abort();
        }
    }

    /// Drain the current run's output queue into one aggregated result.
    ///
    /// The flush timeout only applies when the client advertises the
    /// continuation feature; without it the call blocks until a control
    /// record arrives.
    pub async fn get_next_result(
        &self,
        api_version: u32,
        flush_timeout: Option<Duration>,
    ) -> Result<RunResult, RunnerError> {
        let (run_id, rx) = {
            let queues = self.shared.queues.lock();
            let run_id = queues.current.clone().ok_or(RunnerError::NoActiveRun)?;
            let rx = queues
                .pending
                .get(&run_id)
                .ok_or(RunnerError::NoActiveRun)?
                .rx
                .clone();
            (run_id, rx)
        };

        let has_continuation = self.client_features.contains(&ClientFeature::Continuation);
        let deadline = flush_timeout
            .filter(|_| has_continuation)
            .map(|t| tokio::time::Instant::now() + t);

        // If the caller is cancelled mid-drain, put the run back at the head
        // so another waiter can pick it up.
        let cancel_guard = scopeguard::guard(self.shared.clone(), |shared| {
            shared.resume_output_queue();
        });

        let mut records: Vec<ResultRecord> = Vec::new();
        let mut rx = rx.lock().await;
        let outcome = loop {
            let received = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(received) => received,
                    Err(_) => break (RunStatus::Continued, None, None),
                },
                None => rx.recv().await,
            };
            let Some(record) = received else {
                // Queue dropped underneath us: the runner was closed.
                let _ = scopeguard::ScopeGuard::into_inner(cancel_guard);
                return Err(RunnerError::Closed);
            };
            if VISIBLE_MSG_TYPES.contains(&record.msg_type.as_str()) {
                records.push(record);
                continue;
            }
            let payload: serde_json::Value =
                serde_json::from_str(record_payload(&record)).unwrap_or(json!({}));
            match record.msg_type.as_str() {
                "finished" => {
                    break (
                        RunStatus::Finished,
                        payload.get("exitCode").and_then(|v| v.as_i64()),
                        None,
                    )
                }
                "clean-finished" => {
                    break (
                        RunStatus::CleanFinished,
                        payload.get("exitCode").and_then(|v| v.as_i64()),
                        None,
                    )
                }
                "build-finished" => {
                    break (
                        RunStatus::BuildFinished,
                        payload.get("exitCode").and_then(|v| v.as_i64()),
                        None,
                    )
                }
                "waiting-input" => break (RunStatus::WaitingInput, None, Some(payload)),
                "exec-timeout" => {
                    warn!(kernel_id = %self.kernel_id, "execution timeout detected");
                    break (RunStatus::ExecTimeout, None, None);
                }
                other => {
                    debug!(kernel_id = %self.kernel_id, msg_type = other, "ignoring unknown record");
                }
            }
        };
        drop(rx);

        let shared = scopeguard::ScopeGuard::into_inner(cancel_guard);
        let (status, exit_code, options) = outcome;
        match status {
            RunStatus::Finished | RunStatus::ExecTimeout => shared.next_output_queue(),
            _ => shared.resume_output_queue(),
        }

        Ok(RunResult {
            run_id: Some(run_id),
            status,
            exit_code,
            options,
            console: aggregate_console(&records, api_version),
        })
    }

    /// Run one execution round: attach the run queue, feed the request, arm
    /// the watchdog for fresh runs, and collect the next result.
    pub async fn execute(
        &self,
        run_id: Option<String>,
        mode: RunMode,
        text: &str,
        opts: &serde_json::Value,
        api_version: u32,
        flush_timeout: Option<Duration>,
    ) -> Result<RunResult, RunnerError> {
        self.attach_output_queue(run_id).await;
        match mode {
            RunMode::Batch => {
                let batch_opts: BatchOpts =
                    serde_json::from_value(opts.clone()).unwrap_or_default();
                self.feed_batch(&batch_opts).await?;
                self.start_watchdog();
            }
            RunMode::Query => {
                self.feed_code(text).await?;
                self.start_watchdog();
            }
            RunMode::Input => {
                self.feed_input(text).await?;
            }
            RunMode::Continue => {}
        }
        self.get_next_result(api_version, flush_timeout).await
    }
}

fn record_payload(record: &ResultRecord) -> &str {
    if record.data.is_empty() {
        "{}"
    } else {
        &record.data
    }
}

/// Incremental UTF-8 decode with replacement, preserving state across
/// fragment boundaries (kernels may split multi-byte sequences).
fn decode_fragment(decoder: &mut encoding_rs::Decoder, input: &[u8], last: bool) -> String {
    let capacity = decoder
        .max_utf8_buffer_length(input.len())
        .unwrap_or(input.len() * 3 + 4);
    let mut out = String::with_capacity(capacity);
    let _ = decoder.decode_to_string(input, &mut out, last);
    out
}

async fn read_output(
    mut reader: FramedRead<BoxedReader, LengthDelimitedCodec>,
    shared: Arc<RunnerShared>,
) {
    // Independent decoders: stdout and stderr fragments interleave but each
    // stream must decode as its own byte sequence.
    let mut stdout_decoder = encoding_rs::UTF_8.new_decoder_without_bom_handling();
    let mut stderr_decoder = encoding_rs::UTF_8.new_decoder_without_bom_handling();

    while let Some(frame) = reader.next().await {
        let mut frame = match frame {
            Ok(frame) => frame,
            Err(error) => {
                warn!(kernel_id = %shared.kernel_id, %error, "runner output channel error");
                break;
            }
        };
        let Some((tag, mut data)) = decode_message(&mut frame) else {
            warn!(kernel_id = %shared.kernel_id, "malformed runner frame");
            continue;
        };
        if data.len() > MAX_RECORD_SIZE {
            data.truncate(MAX_RECORD_SIZE);
        }
        match tag.as_str() {
            "status" => {
                let _ = shared.status_tx.try_send(data);
            }
            "completion" => {
                // Completion replies bypass the run queues; they answer an
                // asynchronous side request.
                let _ = shared.completion_tx.try_send(data);
            }
            "service-result" => {
                let _ = shared.service_tx.try_send(data);
            }
            "stdout" => {
                let text = decode_fragment(&mut stdout_decoder, &data, false);
                shared.push_record(ResultRecord::new("stdout", text));
            }
            "stderr" => {
                let text = decode_fragment(&mut stderr_decoder, &data, false);
                shared.push_record(ResultRecord::new("stderr", text));
            }
            other => {
                let text = String::from_utf8_lossy(&data).into_owned();
                shared.push_record(ResultRecord::new(other, text));
            }
        }
        if tag == "finished" || tag == "build-finished" {
            // Finalize the decoders; a dangling partial sequence dies with
            // the run.
            decode_fragment(&mut stdout_decoder, b"", true);
            decode_fragment(&mut stderr_decoder, b"", true);
            stdout_decoder = encoding_rs::UTF_8.new_decoder_without_bom_handling();
            stderr_decoder = encoding_rs::UTF_8.new_decoder_without_bom_handling();
        }
    }
}

/// Merge raw records into the per-API-version console representation.
fn aggregate_console(
    records: &[ResultRecord],
    api_version: u32,
) -> serde_json::Map<String, serde_json::Value> {
    let mut result = serde_json::Map::new();
    if api_version == 1 {
        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut media: Vec<serde_json::Value> = Vec::new();
        let mut html: Vec<serde_json::Value> = Vec::new();
        for record in records {
            match record.msg_type.as_str() {
                "stdout" => stdout.push_str(&record.data),
                "stderr" => stderr.push_str(&record.data),
                "media" => {
                    if let Ok(obj) = serde_json::from_str::<serde_json::Value>(&record.data) {
                        media.push(json!([obj["type"], obj["data"]]));
                    }
                }
                "html" => html.push(json!(record.data)),
                _ => {}
            }
        }
        result.insert("stdout".into(), json!(stdout));
        result.insert("stderr".into(), json!(stderr));
        result.insert("media".into(), json!(media));
        result.insert("html".into(), json!(html));
    } else {
        // v2/v3: one ordered console with consecutive stdout/stderr
        // fragments coalesced.
        let mut console: Vec<serde_json::Value> = Vec::new();
        let mut last_stdout = String::new();
        let mut last_stderr = String::new();
        for record in records {
            if !last_stdout.is_empty() && record.msg_type != "stdout" {
                console.push(json!(["stdout", std::mem::take(&mut last_stdout)]));
            }
            if !last_stderr.is_empty() && record.msg_type != "stderr" {
                console.push(json!(["stderr", std::mem::take(&mut last_stderr)]));
            }
            match record.msg_type.as_str() {
                "stdout" => last_stdout.push_str(&record.data),
                "stderr" => last_stderr.push_str(&record.data),
                "media" => {
                    if let Ok(obj) = serde_json::from_str::<serde_json::Value>(&record.data) {
                        console.push(json!(["media", [obj["type"], obj["data"]]]));
                    }
                }
                other if VISIBLE_MSG_TYPES.contains(&other) => {
                    console.push(json!([other, record.data]));
                }
                _ => {}
            }
        }
        if !last_stdout.is_empty() {
            console.push(json!(["stdout", last_stdout]));
        }
        if !last_stderr.is_empty() {
            console.push(json!(["stderr", last_stderr]));
        }
        result.insert("console".into(), json!(console));
    }
    result
}
