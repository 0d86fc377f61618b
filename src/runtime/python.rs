//! Python kernel: a persistent interpreter process speaking line-delimited JSON.

use std::{
    process::Stdio,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout, Command},
    sync::Mutex,
};

use super::{Interpreter, RuntimeProvider};
use crate::{
    config::Config,
    error::LoadError,
    execution::{Capture, OutputSinks},
};

/// Runs inside the child. Each request line `{"id", "code"}` is executed in one persistent
/// namespace with stdout/stderr redirected into `{"id", "stream", "text"}` replies, followed
/// by `{"id", "done": true}`. Guest code sees an empty stdin; the real one carries requests.
const BOOTSTRAP: &str = r#"
import io, sys, json, traceback
_in = sys.stdin
_out = sys.stdout
_ns = {"__name__": "__main__"}

def _reply(msg):
    _out.write(json.dumps(msg) + "\n")
    _out.flush()

class _Stream:
    def __init__(self, rid, name):
        self.rid = rid
        self.name = name
    def write(self, text):
        if text:
            _reply({"id": self.rid, "stream": self.name, "text": text})
        return len(text)
    def flush(self):
        pass

for line in _in:
    try:
        req = json.loads(line)
    except ValueError:
        continue
    rid = req.get("id", 0)
    sys.stdin = io.StringIO()
    sys.stdout = _Stream(rid, "stdout")
    sys.stderr = _Stream(rid, "stderr")
    try:
        exec(compile(req.get("code", ""), "<sandbox>", "exec"), _ns)
    except BaseException:
        traceback.print_exc()
    finally:
        sys.stdin = _in
        sys.stdout = _out
        sys.stderr = sys.__stderr__
    _reply({"id": rid, "done": True})
"#;

#[derive(Debug, Serialize)]
struct KernelRequest<'a> {
    id: u64,
    code: &'a str,
}

#[derive(Debug, Deserialize)]
struct KernelReply {
    id: u64,
    #[serde(default)]
    stream: Option<String>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    done: bool,
}

/// Provides a [`PythonKernel`] started from a configured interpreter program.
#[derive(Debug, Clone)]
pub struct PythonProvider {
    program: String,
    prelude: Option<String>,
    fetch_timeout: Duration,
}

impl PythonProvider {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into(), prelude: None, fetch_timeout: Duration::from_secs(60) }
    }

    pub fn from_config(cfg: &Config) -> Self {
        let program = cfg.get("CODEBOX_INTERPRETER").unwrap_or_else(|| "python3".into());
        let mut provider = Self::new(program);
        if let Some(location) = cfg.get("CODEBOX_PRELUDE").filter(|s| !s.trim().is_empty()) {
            provider = provider.with_prelude(location);
        }
        if let Some(timeout) = cfg.get_secs("CODEBOX_FETCH_TIMEOUT") {
            provider = provider.with_fetch_timeout(timeout);
        }
        provider
    }

    /// Location of a script evaluated once at load: an `http(s)://` URL or a file path.
    pub fn with_prelude(mut self, location: impl Into<String>) -> Self {
        self.prelude = Some(location.into());
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    async fn fetch_prelude(&self) -> Result<String, LoadError> {
        let Some(location) = &self.prelude else {
            return Ok(String::new());
        };
        fetch_artifact(location, self.fetch_timeout).await.map_err(|e| LoadError::Fetch {
            location: location.clone(),
            message: format!("{:#}", e),
        })
    }
}

#[async_trait]
impl RuntimeProvider for PythonProvider {
    fn name(&self) -> &str {
        &self.program
    }

    async fn load(&self) -> Result<Arc<dyn Interpreter>, LoadError> {
        let prelude = self.fetch_prelude().await?;
        let kernel = PythonKernel::start(&self.program).map_err(|e| LoadError::Spawn {
            program: self.program.clone(),
            message: format!("{:#}", e),
        })?;

        // Always run the prelude, even when empty, so a dead or foreign program fails here.
        let capture = Capture::new(OutputSinks::default());
        kernel.evaluate(&prelude, &capture).await.map_err(|e| LoadError::Spawn {
            program: self.program.clone(),
            message: format!("{:#}", e),
        })?;
        let captured = capture.seal();
        if !captured.stderr.is_empty() {
            kernel.shutdown().await;
            return Err(LoadError::Prelude(captured.stderr));
        }
        log::debug!("Python kernel '{}' started", self.program);
        Ok(Arc::new(kernel))
    }
}

async fn fetch_artifact(location: &str, timeout: Duration) -> Result<String> {
    if location.starts_with("http://") || location.starts_with("https://") {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let resp = http.get(location).send().await.context("failed to send request")?;
        if !resp.status().is_success() {
            bail!("HTTP {}", resp.status());
        }
        Ok(resp.text().await.context("failed to read response body")?)
    } else {
        tokio::fs::read_to_string(location).await.with_context(|| format!("failed to read {}", location))
    }
}

struct KernelIo {
    stdin: ChildStdin,
    replies: Lines<BufReader<ChildStdout>>,
    torn_write: bool,
}

/// A running Python process. Evaluations are serialized on its pipes.
pub struct PythonKernel {
    io: Mutex<KernelIo>,
    child: Mutex<Child>,
    next_id: AtomicU64,
}

impl PythonKernel {
    fn start(program: &str) -> Result<Self> {
        let mut cmd = Command::new(program);
        cmd.arg("-u") // unbuffered
            .arg("-c")
            .arg(BOOTSTRAP)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child: Child = cmd.spawn()?;
        let stdin = child.stdin.take().ok_or_else(|| anyhow::anyhow!("no stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow::anyhow!("no stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::debug!("kernel stderr: {}", line);
                }
            });
        }

        Ok(Self {
            io: Mutex::new(KernelIo { stdin, replies: BufReader::new(stdout).lines(), torn_write: false }),
            child: Mutex::new(child),
            next_id: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl Interpreter for PythonKernel {
    async fn evaluate(&self, source: &str, capture: &Capture) -> Result<()> {
        let mut io = self.io.lock().await;
        if io.torn_write {
            bail!("request stream is corrupted by an interrupted write");
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;

        let mut line = serde_json::to_string(&KernelRequest { id, code: source })?;
        line.push('\n');
        // Stays set if this future is dropped mid-write.
        io.torn_write = true;
        io.stdin.write_all(line.as_bytes()).await.context("failed to write to kernel")?;
        io.stdin.flush().await?;
        io.torn_write = false;

        loop {
            let Some(line) = io.replies.next_line().await.context("failed to read from kernel")? else {
                bail!("kernel exited");
            };
            let reply: KernelReply = match serde_json::from_str(&line) {
                Ok(reply) => reply,
                Err(err) => {
                    log::warn!("kernel sent invalid json: {} (line: {})", err, line);
                    continue;
                }
            };
            // Leftovers from an evaluation that was abandoned mid-flight.
            if reply.id != id {
                continue;
            }
            if reply.done {
                return Ok(());
            }
            match reply.stream.as_deref() {
                Some("stdout") => capture.stdout(&reply.text),
                Some("stderr") => capture.stderr(&reply.text),
                other => log::warn!("kernel reply with unknown stream {:?}", other),
            }
        }
    }

    async fn shutdown(&self) {
        let mut child = self.child.lock().await;
        if let Err(err) = child.kill().await {
            log::warn!("failed to stop kernel: {}", err);
        }
    }
}
