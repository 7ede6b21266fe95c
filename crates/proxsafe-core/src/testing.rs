//! Test doubles for the capability traits
//!
//! Available to this crate's tests and, through the `testing` feature, to the
//! tests of downstream crates.

use crate::config::RestoreConfig;
use crate::deps::Deps;
use crate::error::{Error, Result};
use crate::secret::SecretString;
use crate::sys::{
    Clock, CommandOutput, CommandRunner, CommandStream, FileSystem, HostInfo, OsFs, StreamWait,
};
use crate::ui::Ui;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A sandboxed filesystem rooted in a fresh temp directory.
pub struct Sandbox {
    dir: tempfile::TempDir,
    fs: Arc<OsFs>,
}

impl Sandbox {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let dir = tempfile::TempDir::new().unwrap_or_else(|e| panic!("temp dir: {}", e));
        let fs = Arc::new(OsFs::sandboxed(dir.path()));
        Self { dir, fs }
    }

    pub fn fs(&self) -> Arc<dyn FileSystem> {
        self.fs.clone()
    }

    /// On-disk location of the logical `/`.
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Write a file (creating parents) at a logical path.
    pub fn put(&self, path: impl AsRef<Path>, data: impl AsRef<[u8]>) {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            self.fs
                .create_dir_all(parent)
                .unwrap_or_else(|e| panic!("mkdir {}: {}", parent.display(), e));
        }
        self.fs
            .write(path, data.as_ref(), 0o644)
            .unwrap_or_else(|e| panic!("write {}: {}", path.display(), e));
    }

    /// Read a logical path as UTF-8.
    pub fn get(&self, path: impl AsRef<Path>) -> String {
        let path = path.as_ref();
        self.fs
            .read_to_string(path)
            .unwrap_or_else(|e| panic!("read {}: {}", path.display(), e))
    }

    pub fn exists(&self, path: impl AsRef<Path>) -> bool {
        self.fs.exists(path.as_ref())
    }
}

/// Manually driven clock; `sleep` advances time instead of waiting.
#[derive(Debug)]
pub struct FakeClock {
    now: Mutex<DateTime<Utc>>,
}

impl FakeClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// 2024-05-01 12:00:00 UTC
    pub fn epoch() -> Self {
        let start = Utc
            .with_ymd_and_hms(2024, 5, 1, 12, 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        Self::at(start)
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
    }
}

#[async_trait]
impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

/// Configurable host identity.
#[derive(Debug)]
pub struct FakeHost {
    euid: AtomicU32,
    pid: AtomicU32,
    hostname: Mutex<String>,
    env: Mutex<HashMap<String, String>>,
    alive: Mutex<Option<HashSet<u32>>>,
}

impl FakeHost {
    /// Host running as the real effective user, pid 4242, hostname `pve1`.
    pub fn new() -> Self {
        Self {
            euid: AtomicU32::new(nix::unistd::geteuid().as_raw()),
            pid: AtomicU32::new(4242),
            hostname: Mutex::new("pve1.example.com".to_string()),
            env: Mutex::new(HashMap::new()),
            alive: Mutex::new(None),
        }
    }

    /// Host reporting euid 0.
    pub fn root() -> Self {
        let host = Self::new();
        host.set_euid(0);
        host
    }

    pub fn set_euid(&self, euid: u32) {
        self.euid.store(euid, Ordering::SeqCst);
    }

    pub fn set_pid(&self, pid: u32) {
        self.pid.store(pid, Ordering::SeqCst);
    }

    pub fn set_hostname(&self, name: &str) {
        *self.hostname.lock().unwrap_or_else(|e| e.into_inner()) = name.to_string();
    }

    pub fn set_env(&self, name: &str, value: &str) {
        self.env
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), value.to_string());
    }

    /// Only these pids are alive from now on.
    pub fn set_alive(&self, pids: &[u32]) {
        *self.alive.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(pids.iter().copied().collect());
    }
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HostInfo for FakeHost {
    fn euid(&self) -> u32 {
        self.euid.load(Ordering::SeqCst)
    }

    fn pid(&self) -> u32 {
        self.pid.load(Ordering::SeqCst)
    }

    fn hostname(&self) -> String {
        self.hostname
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn env_var(&self, name: &str) -> Option<String> {
        self.env
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .filter(|v| !v.is_empty())
            .cloned()
    }

    fn pid_alive(&self, pid: u32) -> bool {
        match &*self.alive.lock().unwrap_or_else(|e| e.into_inner()) {
            Some(set) => set.contains(&pid),
            None => pid == self.pid(),
        }
    }
}

type RunHandler = Arc<dyn Fn(&[String]) -> CommandOutput + Send + Sync>;
type StreamHandler = Arc<dyn Fn(&[String]) -> Vec<u8> + Send + Sync>;

struct Rule<H> {
    program: String,
    prefix: Vec<String>,
    once: bool,
    handler: H,
}

impl<H> Rule<H> {
    fn matches(&self, program: &str, args: &[String]) -> bool {
        self.program == program && args.starts_with(&self.prefix)
    }
}

/// One recorded invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    /// `program arg1 arg2 ...`
    pub fn line(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Scripted command runner.
///
/// Rules match on program name plus an argument prefix. One-shot rules are
/// consumed in registration order before sticky ones. Unmatched commands
/// succeed with empty output unless the program was marked missing.
#[derive(Default)]
pub struct FakeRunner {
    rules: Mutex<Vec<Rule<RunHandler>>>,
    streams: Mutex<Vec<Rule<StreamHandler>>>,
    missing: Mutex<HashSet<String>>,
    calls: Mutex<Vec<Invocation>>,
    kills: Arc<AtomicUsize>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer `program prefix...` with `output`.
    pub fn respond(&self, program: &str, prefix: &[&str], output: CommandOutput) {
        self.respond_with(program, prefix, move |_| output.clone());
    }

    /// Answer the next matching call with `output`.
    pub fn respond_once(&self, program: &str, prefix: &[&str], output: CommandOutput) {
        self.push_rule(program, prefix, true, Arc::new(move |_| output.clone()));
    }

    /// Compute the answer (and perform side effects) per call.
    pub fn respond_with<F>(&self, program: &str, prefix: &[&str], handler: F)
    where
        F: Fn(&[String]) -> CommandOutput + Send + Sync + 'static,
    {
        self.push_rule(program, prefix, false, Arc::new(handler));
    }

    /// Serve `data` as stdout of a streaming command.
    pub fn stream_bytes(&self, program: &str, prefix: &[&str], data: Vec<u8>) {
        self.stream_with(program, prefix, move |_| data.clone());
    }

    pub fn stream_with<F>(&self, program: &str, prefix: &[&str], handler: F)
    where
        F: Fn(&[String]) -> Vec<u8> + Send + Sync + 'static,
    {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Rule {
                program: program.to_string(),
                prefix: prefix.iter().map(|s| s.to_string()).collect(),
                once: false,
                handler: Arc::new(handler),
            });
    }

    /// Pretend `program` is not installed.
    pub fn set_missing(&self, program: &str) {
        self.missing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(program.to_string());
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Recorded invocations rendered as command lines.
    pub fn lines(&self) -> Vec<String> {
        self.calls().iter().map(Invocation::line).collect()
    }

    pub fn called(&self, line_prefix: &str) -> bool {
        self.lines().iter().any(|l| l.starts_with(line_prefix))
    }

    /// Streams stopped with `kill` instead of being waited on.
    pub fn killed_streams(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn push_rule(&self, program: &str, prefix: &[&str], once: bool, handler: RunHandler) {
        self.rules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Rule {
                program: program.to_string(),
                prefix: prefix.iter().map(|s| s.to_string()).collect(),
                once,
                handler,
            });
    }

    fn record(&self, program: &str, args: &[String]) -> Result<()> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Invocation {
                program: program.to_string(),
                args: args.to_vec(),
            });
        if self.is_missing(program) {
            return Err(Error::command_not_found(program));
        }
        Ok(())
    }

    fn is_missing(&self, program: &str) -> bool {
        self.missing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(program)
    }

    fn find_handler(&self, program: &str, args: &[String]) -> Option<RunHandler> {
        let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pos) = rules.iter().position(|r| r.once && r.matches(program, args)) {
            return Some(rules.remove(pos).handler);
        }
        rules
            .iter()
            .rev()
            .find(|r| !r.once && r.matches(program, args))
            .map(|r| r.handler.clone())
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(
        &self,
        cancel: &CancellationToken,
        program: &str,
        args: &[String],
    ) -> Result<CommandOutput> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.record(program, args)?;
        Ok(match self.find_handler(program, args) {
            Some(handler) => handler(args),
            None => CommandOutput::ok(""),
        })
    }

    async fn stream(
        &self,
        cancel: &CancellationToken,
        program: &str,
        args: &[String],
    ) -> Result<CommandStream> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.record(program, args)?;
        let handler = self
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .rev()
            .find(|r| r.matches(program, args))
            .map(|r| r.handler.clone());
        let data = match handler {
            Some(handler) => handler(args),
            None => Vec::new(),
        };
        Ok(CommandStream {
            stdout: Box::new(std::io::Cursor::new(data)),
            waiter: Box::new(FakeWait {
                kills: self.kills.clone(),
            }),
        })
    }

    fn look_path(&self, program: &str) -> Option<PathBuf> {
        if self.is_missing(program) {
            None
        } else {
            Some(PathBuf::from("/usr/bin").join(program))
        }
    }
}

struct FakeWait {
    kills: Arc<AtomicUsize>,
}

#[async_trait]
impl StreamWait for FakeWait {
    async fn wait(self: Box<Self>) -> Result<CommandOutput> {
        Ok(CommandOutput::ok(""))
    }

    async fn kill(self: Box<Self>) {
        self.kills.fetch_add(1, Ordering::SeqCst);
    }
}

/// One queued operator answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    Line(String),
    /// End of input
    Eof,
    /// No input before the deadline (only meaningful for timed reads)
    Timeout,
}

impl From<&str> for Answer {
    fn from(s: &str) -> Self {
        Answer::Line(s.to_string())
    }
}

/// [`Ui`] fed from a queue of answers; records prompts and output.
#[derive(Debug, Default)]
pub struct ScriptedUi {
    answers: Mutex<VecDeque<Answer>>,
    prompts: Mutex<Vec<String>>,
    output: Mutex<Vec<String>>,
}

impl ScriptedUi {
    pub fn new<I, A>(answers: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Answer>,
    {
        Self {
            answers: Mutex::new(answers.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    pub fn push(&self, answer: impl Into<Answer>) {
        self.answers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(answer.into());
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn output(&self) -> Vec<String> {
        self.output.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn remaining(&self) -> usize {
        self.answers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn next(&self, prompt: &str) -> Answer {
        self.prompts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(prompt.to_string());
        self.answers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or(Answer::Eof)
    }
}

#[async_trait]
impl Ui for ScriptedUi {
    async fn read_line(&self, cancel: &CancellationToken, prompt: &str) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match self.next(prompt) {
            Answer::Line(line) => Ok(line),
            Answer::Eof | Answer::Timeout => Err(Error::InputClosed),
        }
    }

    async fn read_secret(&self, cancel: &CancellationToken, prompt: &str) -> Result<SecretString> {
        self.read_line(cancel, prompt).await.map(SecretString::new)
    }

    async fn read_line_timeout(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
        _timeout: Duration,
    ) -> Result<Option<String>> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match self.next(prompt) {
            Answer::Line(line) => Ok(Some(line)),
            Answer::Timeout => Ok(None),
            Answer::Eof => Err(Error::InputClosed),
        }
    }

    fn println(&self, line: &str) {
        self.output
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(line.to_string());
    }
}

/// Fakes bundled into a [`Deps`], with handles kept for assertions.
pub struct TestDeps {
    pub sandbox: Sandbox,
    pub clock: Arc<FakeClock>,
    pub runner: Arc<FakeRunner>,
    pub host: Arc<FakeHost>,
    pub ui: Arc<ScriptedUi>,
    pub deps: Deps,
}

impl TestDeps {
    pub fn new() -> Self {
        Self::with_config(RestoreConfig::default())
    }

    pub fn with_config(config: RestoreConfig) -> Self {
        let sandbox = Sandbox::new();
        let clock = Arc::new(FakeClock::epoch());
        let runner = Arc::new(FakeRunner::new());
        let host = Arc::new(FakeHost::new());
        let ui = Arc::new(ScriptedUi::default());
        let deps = Deps {
            fs: sandbox.fs(),
            clock: clock.clone(),
            cmd: runner.clone(),
            host: host.clone(),
            ui: ui.clone(),
            config: Arc::new(config),
        };
        Self {
            sandbox,
            clock,
            runner,
            host,
            ui,
            deps,
        }
    }

    /// Queue operator answers.
    pub fn answers<I, A>(&self, answers: I)
    where
        I: IntoIterator<Item = A>,
        A: Into<Answer>,
    {
        for answer in answers {
            self.ui.push(answer);
        }
    }
}

impl Default for TestDeps {
    fn default() -> Self {
        Self::new()
    }
}
