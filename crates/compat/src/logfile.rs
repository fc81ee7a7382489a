//! Per-adapter diagnostic log with daily rotation and bounded retention.
//!
//! Every adapter owns one rolling log file. Writes are serialized by a
//! mutex; rotation closes and reopens the file under that same lock. The
//! log lock is a leaf lock and is never held across I/O to the network.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, IsTerminal, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use jiff::{ToSpan, Zoned, civil::Date};

pub(crate) const RESPONSES_LOG_ENV: &str = "AGENT_LAUNCH_COMPAT_LOG";
pub(crate) const ANTHROPIC_LOG_ENV: &str = "AGENT_LAUNCH_ANTHROPIC_COMPAT_LOG";
pub(crate) const STDERR_POLICY_ENV: &str = "AGENT_LAUNCH_COMPAT_STDERR";

const DEFAULT_KEEP_DAYS: i64 = 7;

fn timestamp() -> String {
    Zoned::now().strftime("%Y-%m-%dT%H:%M:%S%:z").to_string()
}

#[derive(Debug, Default)]
struct RollState {
    current: Option<File>,
    current_day: Option<Date>,
    current_path: PathBuf,
}

/// Appends to `<base>-YYYY-MM-DD<ext>`, switching files on the local
/// calendar day and deleting siblings older than the retention window.
#[derive(Debug)]
pub(crate) struct DailyRollingLogWriter {
    dir: PathBuf,
    base_name: String,
    ext: String,
    keep_days: i64,
    state: Mutex<RollState>,
}

impl DailyRollingLogWriter {
    pub fn new(base_path: &Path, keep_days: i64) -> io::Result<(Self, PathBuf)> {
        let keep_days = if keep_days <= 0 { DEFAULT_KEEP_DAYS } else { keep_days };
        let dir = base_path.parent().unwrap_or(Path::new(".")).to_path_buf();
        let file_name = base_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (base_name, ext) = match file_name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), format!(".{ext}")),
            _ => (file_name, String::new()),
        };

        fs::create_dir_all(&dir)?;

        let writer = Self {
            dir,
            base_name,
            ext,
            keep_days,
            state: Mutex::new(RollState::default()),
        };
        let path = {
            let mut state = writer.state.lock().expect("log lock poisoned");
            writer.rotate_locked(&mut state, Zoned::now().date())?;
            state.current_path.clone()
        };
        Ok((writer, path))
    }

    pub fn write_line(&self, line: &str) -> io::Result<()> {
        let mut state = self.state.lock().expect("log lock poisoned");
        self.rotate_locked(&mut state, Zoned::now().date())?;
        let file = state
            .current
            .as_mut()
            .ok_or_else(|| io::Error::other("log file is closed"))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")
    }

    pub fn close(&self) {
        let mut state = self.state.lock().expect("log lock poisoned");
        state.current = None;
    }

    fn day_path(&self, day: Date) -> PathBuf {
        self.dir.join(format!("{}-{day}{}", self.base_name, self.ext))
    }

    fn rotate_locked(&self, state: &mut RollState, today: Date) -> io::Result<()> {
        if state.current_day == Some(today) && state.current.is_some() {
            return Ok(());
        }
        state.current = None;
        let path = self.day_path(today);
        let file = OpenOptions::new().append(true).create(true).open(&path)?;
        state.current = Some(file);
        state.current_day = Some(today);
        state.current_path = path;
        self.cleanup_locked(today);
        Ok(())
    }

    fn cleanup_locked(&self, today: Date) {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };
        let Ok(cutoff) = today.checked_sub((self.keep_days - 1).days()) else {
            return;
        };
        let prefix = format!("{}-", self.base_name);
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(rest) = name.strip_prefix(&prefix) else {
                continue;
            };
            let Some(day_part) = rest.strip_suffix(&self.ext) else {
                continue;
            };
            let Ok(file_day) = day_part.parse::<Date>() else {
                continue;
            };
            if file_day < cutoff {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

/// Resolves the adapter's log base path: environment override, then
/// `<home>/.spark/logs/<default_file>`.
pub(crate) fn resolve_log_path(override_path: Option<&str>, default_file: &str) -> io::Result<PathBuf> {
    if let Some(path) = override_path.map(str::trim).filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir().ok_or_else(|| io::Error::other("cannot resolve home directory"))?;
    Ok(home.join(".spark").join("logs").join(default_file))
}

/// Whether adapter warnings should be kept off stderr. Explicit env override
/// wins; otherwise quiet exactly when all three std streams are terminals
/// (an interactive TUI owns the screen).
pub(crate) fn should_quiet_compat_stderr() -> bool {
    let value = std::env::var(STDERR_POLICY_ENV).unwrap_or_default();
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => false,
        "0" | "false" | "off" | "no" => true,
        _ => {
            io::stdin().is_terminal() && io::stdout().is_terminal() && io::stderr().is_terminal()
        }
    }
}

/// The per-adapter diagnostic sink: rolling file plus optional one-line
/// stderr summaries pointing at the file.
#[derive(Debug)]
pub(crate) struct CompatLogger {
    writer: DailyRollingLogWriter,
    prefix: &'static str,
    path: PathBuf,
    quiet_stderr: bool,
}

impl CompatLogger {
    pub fn open(
        env_key: &str,
        default_file: &str,
        prefix: &'static str,
        quiet_stderr: bool,
    ) -> io::Result<Self> {
        let base_path = resolve_log_path(std::env::var(env_key).ok().as_deref(), default_file)?;
        let (writer, path) = DailyRollingLogWriter::new(&base_path, DEFAULT_KEEP_DAYS)?;
        let logger = Self {
            writer,
            prefix,
            path,
            quiet_stderr,
        };
        logger.log("logger initialized");
        Ok(logger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one timestamped line to the rolling file. Write failures are
    /// swallowed: diagnostics must never take a request down.
    pub fn log(&self, message: impl AsRef<str>) {
        let line = format!("{} [{}] {}", timestamp(), self.prefix, message.as_ref());
        let _ = self.writer.write_line(&line);
    }

    /// Prints a one-line warning summary to stderr unless quieted.
    pub fn warn(&self, summary: &str) {
        if self.quiet_stderr {
            return;
        }
        eprintln!("[{}] {} (details: {})", self.prefix, summary, self.path.display());
    }

    pub fn close(&self) {
        self.writer.close();
    }
}
