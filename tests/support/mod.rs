//! Fakes shared by the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;

use flashhub_lib::manifest::{FetchResponse, ManifestFetcher};
use flashhub_lib::serial::{PortOpenKind, SerialBackend, SerialDeviceInfo, SerialError, SerialLink};
use flashhub_lib::tool::{StreamingRun, ToolError, ToolInvocation, ToolOutput, ToolRunner};

/// Ordered record of side effects with the moment they happened
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<(String, Instant)>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push((entry.into(), Instant::now()));
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().iter().map(|(e, _)| e.clone()).collect()
    }

    pub fn first(&self, entry: &str) -> Option<Instant> {
        self.0.lock().unwrap().iter().find(|(e, _)| e == entry).map(|(_, at)| *at)
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|(e, _)| e == entry).count()
    }
}

pub fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("flashhub_it_{}_{}", tag, uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

// ---------------------------------------------------------------- serial

#[derive(Default)]
struct LinkControl {
    incoming: VecDeque<Vec<u8>>,
    fail_reads: bool,
    writes: Vec<Vec<u8>>,
}

pub struct FakeBackend {
    ports: Mutex<Vec<SerialDeviceInfo>>,
    busy: Mutex<HashSet<String>>,
    control: Arc<Mutex<LinkControl>>,
    pub journal: Journal,
    close_delay: Duration,
    opens: AtomicUsize,
}

impl FakeBackend {
    pub fn new(ports: &[&str]) -> Self {
        Self {
            ports: Mutex::new(ports.iter().map(|p| SerialDeviceInfo::plain(*p)).collect()),
            busy: Mutex::new(HashSet::new()),
            control: Arc::new(Mutex::new(LinkControl::default())),
            journal: Journal::default(),
            close_delay: Duration::ZERO,
            opens: AtomicUsize::new(0),
        }
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = journal;
        self
    }

    pub fn with_close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = delay;
        self
    }

    /// Simulate a device being plugged in
    pub fn plug(&self, port: &str, vid: u16, pid: u16) {
        let mut info = SerialDeviceInfo::plain(port);
        info.vid = Some(vid);
        info.pid = Some(pid);
        self.ports.lock().unwrap().push(info);
    }

    pub fn mark_busy(&self, port: &str) {
        self.busy.lock().unwrap().insert(port.to_string());
    }

    pub fn push_incoming(&self, bytes: &[u8]) {
        self.control.lock().unwrap().incoming.push_back(bytes.to_vec());
    }

    pub fn fail_reads(&self) {
        self.control.lock().unwrap().fail_reads = true;
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.control.lock().unwrap().writes.clone()
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SerialBackend for FakeBackend {
    fn available_ports(&self) -> flashhub_lib::serial::Result<Vec<SerialDeviceInfo>> {
        Ok(self.ports.lock().unwrap().clone())
    }

    async fn open(&self, port_name: &str, _baud_rate: u32) -> flashhub_lib::serial::Result<Box<dyn SerialLink>> {
        if self.busy.lock().unwrap().contains(port_name) {
            return Err(SerialError::PortOpen {
                port: port_name.to_string(),
                kind: PortOpenKind::Busy,
                reason: "Resource busy".to_string(),
            });
        }
        let known = self.ports.lock().unwrap().iter().any(|p| p.port_name == port_name);
        if !known {
            return Err(SerialError::PortNotFound(port_name.to_string()));
        }

        self.opens.fetch_add(1, Ordering::SeqCst);
        self.journal.record(format!("open:{}", port_name));
        Ok(Box::new(FakeLink {
            port: port_name.to_string(),
            control: self.control.clone(),
            journal: self.journal.clone(),
            close_delay: self.close_delay,
        }))
    }
}

struct FakeLink {
    port: String,
    control: Arc<Mutex<LinkControl>>,
    journal: Journal,
    close_delay: Duration,
}

#[async_trait]
impl SerialLink for FakeLink {
    async fn send_data(&mut self, data: &[u8]) -> flashhub_lib::serial::Result<usize> {
        self.control.lock().unwrap().writes.push(data.to_vec());
        Ok(data.len())
    }

    async fn read_data(&mut self, buffer: &mut [u8], timeout_ms: u64) -> flashhub_lib::serial::Result<usize> {
        let next = {
            let mut control = self.control.lock().unwrap();
            if control.fail_reads {
                return Err(SerialError::Disconnected(self.port.clone()));
            }
            control.incoming.pop_front()
        };

        match next {
            Some(mut chunk) => {
                let n = chunk.len().min(buffer.len());
                buffer[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    let rest = chunk.split_off(n);
                    self.control.lock().unwrap().incoming.push_front(rest);
                }
                Ok(n)
            }
            None => {
                tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                Err(SerialError::Timeout)
            }
        }
    }

    async fn close(&mut self) -> flashhub_lib::serial::Result<()> {
        if !self.close_delay.is_zero() {
            tokio::time::sleep(self.close_delay).await;
        }
        self.journal.record(format!("close:{}", self.port));
        Ok(())
    }
}

// ---------------------------------------------------------------- tool

/// What a fake tool run prints and returns
#[derive(Clone, Debug, Default)]
pub struct Scripted {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub exit_code: Option<i32>,
}

impl Scripted {
    pub fn ok(stdout: &[&str]) -> Self {
        Self {
            stdout: stdout.iter().map(|s| s.to_string()).collect(),
            stderr: Vec::new(),
            exit_code: Some(0),
        }
    }

    pub fn failing(code: i32, stderr: &[&str]) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: stderr.iter().map(|s| s.to_string()).collect(),
            exit_code: Some(code),
        }
    }
}

/// One observed call: arguments, and whether the last argument existed on disk
#[derive(Clone, Debug)]
pub struct ToolCall {
    pub args: Vec<String>,
    pub target_existed: bool,
}

pub struct FakeRunner {
    pub journal: Journal,
    calls: Mutex<Vec<ToolCall>>,
    buffered: Mutex<VecDeque<Scripted>>,
    streaming: Mutex<VecDeque<Scripted>>,
    missing: bool,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self {
            journal: Journal::default(),
            calls: Mutex::new(Vec::new()),
            buffered: Mutex::new(VecDeque::new()),
            streaming: Mutex::new(VecDeque::new()),
            missing: false,
        }
    }

    /// Every call fails as if the executable were absent
    pub fn missing() -> Self {
        Self {
            missing: true,
            ..Self::new()
        }
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = journal;
        self
    }

    pub fn queue_run(&self, scripted: Scripted) {
        self.buffered.lock().unwrap().push_back(scripted);
    }

    pub fn queue_streaming(&self, scripted: Scripted) {
        self.streaming.lock().unwrap().push_back(scripted);
    }

    pub fn calls(&self) -> Vec<ToolCall> {
        self.calls.lock().unwrap().clone()
    }

    fn observe(&self, program: &Path, args: &[String]) -> Result<(), ToolError> {
        if self.missing {
            return Err(ToolError::Unavailable {
                path: program.to_path_buf(),
                reason: "No such file or directory".to_string(),
            });
        }
        let target_existed = args.last().map(|a| Path::new(a).exists()).unwrap_or(false);
        self.calls.lock().unwrap().push(ToolCall {
            args: args.to_vec(),
            target_existed,
        });
        Ok(())
    }

    fn invocation(program: &Path, args: &[String], scripted: &Scripted) -> ToolInvocation {
        let mut invocation = ToolInvocation::new(program, args);
        invocation.stdout = scripted.stdout.join("\n");
        invocation.stderr = scripted.stderr.join("\n");
        invocation.exit_code = scripted.exit_code;
        invocation
    }
}

#[async_trait]
impl ToolRunner for FakeRunner {
    async fn run(&self, program: &Path, args: &[String]) -> flashhub_lib::tool::Result<ToolInvocation> {
        self.observe(program, args)?;
        self.journal.record("run");
        let scripted = self.buffered.lock().unwrap().pop_front().unwrap_or_else(|| Scripted::failing(2, &[]));
        Ok(Self::invocation(program, args, &scripted))
    }

    async fn run_streaming(
        &self,
        program: &Path,
        args: &[String],
        sink: mpsc::UnboundedSender<ToolOutput>,
    ) -> flashhub_lib::tool::Result<StreamingRun> {
        self.observe(program, args)?;
        self.journal.record("spawn");
        let scripted = self.streaming.lock().unwrap().pop_front().unwrap_or_else(|| Scripted::ok(&[]));

        // Dump runs write their output file like the real tool does
        if scripted.exit_code == Some(0) && args.iter().any(|a| a == "read_flash") {
            if let Some(out) = args.last() {
                std::fs::write(out, b"dumped").unwrap();
            }
        }

        for line in &scripted.stdout {
            let _ = sink.send(ToolOutput::Stdout(line.clone()));
        }
        for line in &scripted.stderr {
            let _ = sink.send(ToolOutput::Stderr(line.clone()));
        }
        let _ = sink.send(ToolOutput::Exited(scripted.exit_code));

        let invocation = Self::invocation(program, args, &scripted);
        Ok(StreamingRun::from_handle(tokio::spawn(async move { Ok(invocation) })))
    }
}

// ---------------------------------------------------------------- manifest

/// Scripted HTTP responses per URL. The last response for a URL repeats.
#[derive(Default)]
pub struct FakeFetcher {
    routes: Mutex<HashMap<String, VecDeque<FetchResponse>>>,
    calls: Mutex<Vec<String>>,
    delays: Mutex<HashMap<String, Duration>>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, url: &str, status: u16, body: &str) {
        self.routes
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(FetchResponse {
                status,
                body: body.to_string(),
            });
    }

    /// Every request to `url` waits `delay` before answering
    pub fn stall(&self, url: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(url.to_string(), delay);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|u| *u == url).count()
    }
}

#[async_trait]
impl ManifestFetcher for FakeFetcher {
    async fn get(&self, url: &str) -> flashhub_lib::manifest::Result<FetchResponse> {
        self.calls.lock().unwrap().push(url.to_string());
        let delay = self.delays.lock().unwrap().get(url).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut routes = self.routes.lock().unwrap();
        let response = match routes.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        Ok(response.unwrap_or(FetchResponse {
            status: 404,
            body: String::new(),
        }))
    }
}
