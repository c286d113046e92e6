//! Scripted Model Runtime
//!
//! Deterministic stand-in for a real model. Used by the test suites and by
//! the daemon's `--runtime scripted` mode, where it echoes the last prompt
//! line back word by word.
//!
//! The runtime records how many calls are in flight at once, which the
//! admission tests use to prove the concurrency ceiling holds.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::{
    Emission, EmissionSink, GenerationParams, LoadError, ModelLoader, ModelRuntime, RuntimeError,
};

/// One step of a scripted generation
#[derive(Clone, Debug)]
pub enum ScriptStep {
    /// Emit a text delta
    Text(String),
    /// Emit a phase marker
    Phase(String),
    /// Block the worker thread for a while
    Sleep(Duration),
    /// Block until [`ScriptedRuntime::release`] is called
    Block,
    /// Fail the call
    Fail(RuntimeError),
}

#[derive(Clone, Debug)]
enum Mode {
    Script(Vec<ScriptStep>),
    Echo { delay: Duration },
}

#[derive(Default)]
struct Latch {
    released: Mutex<bool>,
    cv: Condvar,
}

impl Latch {
    fn wait(&self) {
        let mut released = self.released.lock();
        while !*released {
            self.cv.wait(&mut released);
        }
    }

    fn release(&self) {
        *self.released.lock() = true;
        self.cv.notify_all();
    }
}

/// Runtime replaying a fixed script (or echoing the prompt)
pub struct ScriptedRuntime {
    mode: Mode,
    latch: Latch,
    active: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
    stopped_early: AtomicBool,
}

impl ScriptedRuntime {
    /// Runtime that replays `steps` on every call
    #[must_use]
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self::with_mode(Mode::Script(steps))
    }

    /// Runtime emitting each fragment in order
    #[must_use]
    pub fn fragments(fragments: &[&str]) -> Self {
        Self::new(
            fragments
                .iter()
                .map(|f| ScriptStep::Text((*f).to_string()))
                .collect(),
        )
    }

    /// Runtime that answers with the last prompt line, one word per fragment
    #[must_use]
    pub fn echo(delay: Duration) -> Self {
        Self::with_mode(Mode::Echo { delay })
    }

    fn with_mode(mode: Mode) -> Self {
        Self {
            mode,
            latch: Latch::default(),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            stopped_early: AtomicBool::new(false),
        }
    }

    /// Unblock every call waiting on a [`ScriptStep::Block`]
    pub fn release(&self) {
        self.latch.release();
    }

    /// Calls currently inside `generate`
    #[must_use]
    pub fn active_calls(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous calls observed
    #[must_use]
    pub fn peak_calls(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Total calls started
    #[must_use]
    pub fn total_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Whether any call stopped because the sink asked it to
    #[must_use]
    pub fn stopped_early(&self) -> bool {
        self.stopped_early.load(Ordering::SeqCst)
    }

    fn steps_for(&self, params: &GenerationParams) -> Vec<ScriptStep> {
        match &self.mode {
            Mode::Script(steps) => steps.clone(),
            Mode::Echo { delay } => {
                let last = params.prompt.lines().last().unwrap_or_default();
                let last = last.split_once(": ").map_or(last, |(_, text)| text);
                let mut steps = Vec::new();
                for (i, word) in last.split_whitespace().enumerate() {
                    if !delay.is_zero() {
                        steps.push(ScriptStep::Sleep(*delay));
                    }
                    let text = if i == 0 {
                        word.to_string()
                    } else {
                        format!(" {word}")
                    };
                    steps.push(ScriptStep::Text(text));
                }
                steps
            }
        }
    }

    fn run(
        &self,
        params: &GenerationParams,
        sink: EmissionSink<'_>,
    ) -> Result<String, RuntimeError> {
        let mut full = String::new();
        for step in self.steps_for(params) {
            let flow = match step {
                ScriptStep::Text(text) => {
                    full.push_str(&text);
                    if params.stream {
                        sink(Emission::Text(text))
                    } else {
                        ControlFlow::Continue(())
                    }
                }
                ScriptStep::Phase(name) => sink(Emission::Phase(name)),
                ScriptStep::Sleep(duration) => {
                    std::thread::sleep(duration);
                    ControlFlow::Continue(())
                }
                ScriptStep::Block => {
                    self.latch.wait();
                    ControlFlow::Continue(())
                }
                ScriptStep::Fail(error) => return Err(error),
            };

            if flow.is_break() {
                self.stopped_early.store(true, Ordering::SeqCst);
                break;
            }
        }
        Ok(full)
    }
}

impl ModelRuntime for ScriptedRuntime {
    fn name(&self) -> &str {
        match self.mode {
            Mode::Script(_) => "scripted",
            Mode::Echo { .. } => "echo",
        }
    }

    fn generate(
        &self,
        params: &GenerationParams,
        sink: EmissionSink<'_>,
    ) -> Result<String, RuntimeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let result = self.run(params, sink);

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Loader handing out a shared [`ScriptedRuntime`]
pub struct ScriptedLoader {
    runtime: Arc<ScriptedRuntime>,
    delay: Duration,
    failures: Mutex<Vec<LoadError>>,
    loads: AtomicUsize,
}

impl ScriptedLoader {
    /// Loader that always succeeds with `runtime`
    #[must_use]
    pub fn new(runtime: Arc<ScriptedRuntime>) -> Self {
        Self {
            runtime,
            delay: Duration::ZERO,
            failures: Mutex::new(Vec::new()),
            loads: AtomicUsize::new(0),
        }
    }

    /// Make every load block for `delay`
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the next load attempts with these errors, in order
    #[must_use]
    pub fn failing_with(self, errors: Vec<LoadError>) -> Self {
        {
            let mut failures = self.failures.lock();
            failures.extend(errors);
            failures.reverse();
        }
        self
    }

    /// Number of load attempts performed
    #[must_use]
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl ModelLoader for ScriptedLoader {
    fn load(&self) -> Result<Arc<dyn ModelRuntime>, LoadError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if let Some(error) = self.failures.lock().pop() {
            return Err(error);
        }
        Ok(self.runtime.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(runtime: &ScriptedRuntime, params: &GenerationParams) -> (Vec<Emission>, String) {
        let mut seen = Vec::new();
        let full = runtime
            .generate(params, &mut |e| {
                seen.push(e);
                ControlFlow::Continue(())
            })
            .unwrap();
        (seen, full)
    }

    #[test]
    fn test_fragments_in_order() {
        let runtime = ScriptedRuntime::fragments(&["Hello", " world", "!"]);
        let (seen, full) = collect(&runtime, &GenerationParams::new("hi"));

        assert_eq!(
            seen,
            vec![
                Emission::Text("Hello".into()),
                Emission::Text(" world".into()),
                Emission::Text("!".into()),
            ]
        );
        assert_eq!(full, "Hello world!");
        assert_eq!(runtime.total_calls(), 1);
        assert_eq!(runtime.active_calls(), 0);
    }

    #[test]
    fn test_non_streaming_returns_full_text_only() {
        let runtime = ScriptedRuntime::fragments(&["a", "b"]);
        let (seen, full) = collect(&runtime, &GenerationParams::new("hi").with_stream(false));
        assert!(seen.is_empty());
        assert_eq!(full, "ab");
    }

    #[test]
    fn test_echo_uses_last_line() {
        let runtime = ScriptedRuntime::echo(Duration::ZERO);
        let (seen, full) = collect(
            &runtime,
            &GenerationParams::new("system: be nice\nuser: tell me more"),
        );
        assert_eq!(full, "tell me more");
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_break_stops_script() {
        let runtime = ScriptedRuntime::fragments(&["a", "b", "c"]);
        let mut seen = 0;
        let full = runtime
            .generate(&GenerationParams::new("hi"), &mut |_| {
                seen += 1;
                ControlFlow::Break(())
            })
            .unwrap();
        assert_eq!(seen, 1);
        assert_eq!(full, "a");
        assert!(runtime.stopped_early());
    }

    #[test]
    fn test_loader_fails_then_succeeds() {
        let loader = ScriptedLoader::new(Arc::new(ScriptedRuntime::fragments(&["x"])))
            .failing_with(vec![LoadError::OutOfMemory("first".into())]);

        assert!(matches!(loader.load(), Err(LoadError::OutOfMemory(_))));
        assert!(loader.load().is_ok());
        assert_eq!(loader.load_count(), 2);
    }
}
