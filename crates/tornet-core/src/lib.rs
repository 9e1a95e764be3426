use anyhow::{anyhow, Result};
use std::fmt;
use std::fs;
use std::io::{Read, Write};
#[cfg(unix)]
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::info;

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or_default();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Deep-copies `src` into a destination that must not exist yet, so a
/// re-run never silently merges into a previous copy.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    if dst.exists() {
        return Err(anyhow!("copy destination already exists: {}", dst.display()));
    }
    if !src.is_dir() {
        return Err(anyhow!("copy source is not a directory: {}", src.display()));
    }
    copy_tree(src, dst)
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry?;
        let path = entry.path();
        let rel = path.strip_prefix(src).unwrap_or(path);
        if rel.as_os_str().is_empty() {
            ensure_dir(dst)?;
            continue;
        }
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            ensure_dir(&target)?;
        } else if entry.file_type().is_symlink() {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            match fs::canonicalize(path) {
                Ok(real) if real.is_dir() => copy_tree(&real, &target)?,
                Ok(real) if real.is_file() => {
                    fs::copy(real, &target)?;
                }
                Ok(_) => {}
                Err(_) => {
                    // Keep broken links rather than aborting the clone.
                    let link_target = fs::read_link(path)?;
                    #[cfg(unix)]
                    {
                        symlink(&link_target, &target)?;
                    }
                }
            }
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            fs::copy(path, &target)?;
        }
    }
    Ok(())
}

/// Key/value pairs that keep first-seen order across rewrites. `set`
/// replaces an existing key's value in place and appends otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderedKv {
    entries: Vec<(String, String)>,
}

impl OrderedKv {
    pub fn new() -> Self {
        OrderedKv {
            entries: Vec::new(),
        }
    }

    /// Parses line-oriented `key value` text: the key is everything before
    /// the first space, exactly one space is consumed as separator, and a
    /// line without a space becomes a key with an empty value. Duplicate
    /// keys collapse onto the first occurrence.
    pub fn parse(text: &str) -> Self {
        let mut kv = OrderedKv::new();
        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            match line.split_once(' ') {
                Some((key, value)) => kv.set(key, value),
                None => kv.set(line, ""),
            }
        }
        kv
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key.to_string(), value));
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in self.iter() {
            out.push_str(key);
            out.push(' ');
            out.push_str(value);
            out.push('\n');
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        CommandSpec {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.display().to_string());
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", shell_quote(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", shell_quote(arg))?;
        }
        Ok(())
    }
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed while waiting on {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} did not finish within {timeout:?} and was killed")]
    TimedOut { program: String, timeout: Duration },
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub stdout: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn status_label(&self) -> String {
        self.status
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string())
    }
}

/// Blocking process seam. `run` streams the child's output through the
/// parent's stdio; `run_captured` pipes stdout for callers that parse it.
pub trait CommandRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError>;
    fn run_captured(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError>;
}

#[derive(Debug, Default)]
pub struct ProcessRunner {
    timeout: Option<Duration>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        ProcessRunner { timeout: None }
    }

    /// Kills the child and errors once it runs past `timeout`. The pipeline
    /// never sets this; it exists for callers that need a bound.
    pub fn with_timeout(timeout: Duration) -> Self {
        ProcessRunner {
            timeout: Some(timeout),
        }
    }

    fn invoke(&self, spec: &CommandSpec, capture: bool) -> Result<CommandOutput, CommandError> {
        info!("running {}", spec);
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::null());
        if capture {
            cmd.stdout(Stdio::piped());
        }
        cmd.stderr(Stdio::inherit());
        let mut child = cmd.spawn().map_err(|source| CommandError::Launch {
            program: spec.program.clone(),
            source,
        })?;
        let mut stdout = String::new();
        if let Some(mut pipe) = child.stdout.take() {
            pipe.read_to_string(&mut stdout)
                .map_err(|source| CommandError::Wait {
                    program: spec.program.clone(),
                    source,
                })?;
        }
        let status = match self.timeout {
            None => child.wait().map_err(|source| CommandError::Wait {
                program: spec.program.clone(),
                source,
            })?,
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                loop {
                    let polled = child.try_wait().map_err(|source| CommandError::Wait {
                        program: spec.program.clone(),
                        source,
                    })?;
                    match polled {
                        Some(status) => break status,
                        None if Instant::now() >= deadline => {
                            let _ = child.kill();
                            let _ = child.wait();
                            return Err(CommandError::TimedOut {
                                program: spec.program.clone(),
                                timeout,
                            });
                        }
                        None => thread::sleep(Duration::from_millis(50)),
                    }
                }
            }
        };
        Ok(CommandOutput {
            status: status.code(),
            stdout,
        })
    }
}

impl CommandRunner for ProcessRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        self.invoke(spec, false)
    }

    fn run_captured(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        self.invoke(spec, true)
    }
}
