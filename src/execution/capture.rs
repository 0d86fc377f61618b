//! Per-call output capture.
//!
//! A [`Capture`] is created for exactly one evaluation. Interpreters push chunks into it; it
//! buffers them and forwards each one synchronously to the caller's sinks. Once the call
//! reaches a terminal state the capture is sealed and further chunks are dropped, so an
//! evaluation abandoned after a timeout can never write into a later call.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

/// Callback receiving streamed output chunks.
pub type ChunkSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Optional caller-supplied callbacks for streamed stdout and stderr.
#[derive(Clone, Default)]
pub struct OutputSinks {
    pub stdout: Option<ChunkSink>,
    pub stderr: Option<ChunkSink>,
}

impl OutputSinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_stdout(mut self, sink: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.stdout = Some(Arc::new(sink));
        self
    }

    pub fn on_stderr(mut self, sink: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.stderr = Some(Arc::new(sink));
        self
    }
}

impl fmt::Debug for OutputSinks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputSinks")
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

#[derive(Debug, Default)]
struct Buffers {
    stdout: String,
    stderr: String,
    sealed: bool,
}

/// Everything a call captured up to its terminal event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Clone)]
pub struct Capture {
    buffers: Arc<Mutex<Buffers>>,
    sinks: OutputSinks,
}

impl Capture {
    pub fn new(sinks: OutputSinks) -> Self {
        Self { buffers: Arc::new(Mutex::new(Buffers::default())), sinks }
    }

    pub fn stdout(&self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        let mut buffers = self.lock();
        if buffers.sealed {
            log::trace!("dropping {} bytes of stdout after seal", chunk.len());
            return;
        }
        buffers.stdout.push_str(chunk);
        // Forwarded under the lock so a concurrent seal cannot slip in between.
        if let Some(sink) = &self.sinks.stdout {
            sink(chunk);
        }
    }

    pub fn stderr(&self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        let mut buffers = self.lock();
        if buffers.sealed {
            log::trace!("dropping {} bytes of stderr after seal", chunk.len());
            return;
        }
        buffers.stderr.push_str(chunk);
        if let Some(sink) = &self.sinks.stderr {
            sink(chunk);
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.lock().sealed
    }

    /// Stop accepting chunks and hand back what was captured so far.
    pub fn seal(&self) -> Captured {
        let mut buffers = self.lock();
        buffers.sealed = true;
        Captured {
            stdout: std::mem::take(&mut buffers.stdout),
            stderr: std::mem::take(&mut buffers.stderr),
        }
    }

    // A panicking sink must not wedge the capture for the rest of the call.
    fn lock(&self) -> MutexGuard<'_, Buffers> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Capture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capture")
            .field("sealed", &self.is_sealed())
            .field("sinks", &self.sinks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwards_chunks_and_buffers_them() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let capture = Capture::new(
            OutputSinks::new().on_stdout(move |c| sink_seen.lock().unwrap().push(c.to_string())),
        );

        capture.stdout("a");
        capture.stdout("b");
        capture.stderr("oops");

        assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);
        let captured = capture.seal();
        assert_eq!(captured.stdout, "ab");
        assert_eq!(captured.stderr, "oops");
    }

    #[test]
    fn drops_chunks_after_seal() {
        let count = Arc::new(Mutex::new(0usize));
        let sink_count = Arc::clone(&count);
        let capture = Capture::new(OutputSinks::new().on_stderr(move |_| *sink_count.lock().unwrap() += 1));

        capture.stderr("early");
        let first = capture.seal();
        capture.stderr("late");
        capture.stdout("late");

        assert_eq!(first.stderr, "early");
        assert_eq!(*count.lock().unwrap(), 1);
        assert!(capture.is_sealed());
        assert_eq!(capture.seal(), Captured::default());
    }
}
