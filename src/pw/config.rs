use anyhow::Context as _;
use std::path::{Path, PathBuf};

use crate::pw::command::{self, CommandLine};
use crate::pw::logger::LogLevel;
use crate::pw::program::{
    AutoRestart, ProgramDefinition, StopSignal, DEFAULT_LOGFILE_BACKUPS, DEFAULT_LOGFILE_MAXBYTES,
};

/// Control API settings from the `[server]` section.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub enabled: bool,
    pub address: String,
    pub ui_directory: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            enabled: false,
            address: "0.0.0.0:9001".to_string(),
            ui_directory: "embedded".to_string(),
        }
    }
}

/// Typed result of loading the INI configuration: manager settings plus the
/// program catalog in declaration order.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub logfile: PathBuf,
    pub logfile_maxbytes: u64,
    pub logfile_backups: usize,
    pub loglevel: LogLevel,
    pub child_log_dir: PathBuf,
    pub redirect_stderr: bool,
    pub stdout_logfile: String,
    pub stderr_logfile: String,
    pub stdout_logfile_maxbytes: u64,
    pub stderr_logfile_maxbytes: u64,
    pub stdout_logfile_backups: usize,
    pub stderr_logfile_backups: usize,
    pub server: ServerConfig,
    pub programs: Vec<ProgramDefinition>,
}

/// Load the main configuration file plus everything `[include]` pulls in.
/// Any malformed section, duplicate program name, bad byte size or invalid
/// signal symbol is an error; the supervisor refuses to start on these.
pub fn load_config(path: &Path) -> anyhow::Result<ManagerConfig> {
    let mut loader = Loader::default();
    loader.load_file(path, true)?;

    let includes = std::mem::take(&mut loader.includes);
    for pattern in includes {
        let expanded = command::expand_word(&pattern);
        let matches =
            glob::glob(&expanded).with_context(|| format!("invalid include glob {pattern:?}"))?;
        let mut matched: Vec<PathBuf> = matches.filter_map(Result::ok).collect();
        matched.sort();
        for included in matched {
            anyhow::ensure!(
                !loader.loaded.contains(&included),
                "already loaded configuration at {}",
                included.display()
            );
            loader.load_file(&included, false)?;
        }
    }

    loader.finish()
}

#[derive(Debug, Default)]
struct GlobalSettings {
    logfile: Option<PathBuf>,
    logfile_maxbytes: Option<u64>,
    logfile_backups: Option<usize>,
    loglevel: Option<LogLevel>,
    childlogdir: Option<PathBuf>,
    redirect_stderr: Option<bool>,
    stdout_logfile: Option<String>,
    stderr_logfile: Option<String>,
    stdout_logfile_maxbytes: Option<u64>,
    stderr_logfile_maxbytes: Option<u64>,
    stdout_logfile_backups: Option<usize>,
    stderr_logfile_backups: Option<usize>,
}

#[derive(Debug, Default)]
struct Loader {
    globals: GlobalSettings,
    server: ServerConfig,
    includes: Vec<String>,
    loaded: Vec<PathBuf>,
    /// (name, entries, origin file) per [program:<name>] section, in
    /// declaration order; built into definitions once globals are known.
    programs: Vec<(String, Vec<(String, String)>, String)>,
}

impl Loader {
    fn load_file(&mut self, path: &Path, is_root: bool) -> anyhow::Result<()> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        self.loaded.push(path.to_path_buf());
        let origin = path.display().to_string();

        for section in parse_ini(&text, &origin)? {
            match section.name.as_str() {
                "procwatch" | "supervisord" => self.apply_globals(&origin, &section)?,
                "server" => self.apply_server(&origin, &section)?,
                "include" => {
                    anyhow::ensure!(
                        is_root,
                        "{origin}: [include] inside an included file is not supported"
                    );
                    for (key, value) in &section.entries {
                        match key.as_str() {
                            "files" => self.includes.extend(
                                value
                                    .split(',')
                                    .map(|s| s.trim().to_string())
                                    .filter(|s| !s.is_empty()),
                            ),
                            other => {
                                anyhow::bail!("{origin}: unknown key {other:?} in [include]")
                            }
                        }
                    }
                }
                name if name.starts_with("program:") => {
                    let prog = name["program:".len()..].trim().to_string();
                    anyhow::ensure!(
                        !prog.is_empty(),
                        "{origin}: empty program name in section [{name}]"
                    );
                    anyhow::ensure!(
                        !self.programs.iter().any(|(n, _, _)| *n == prog),
                        "duplicate program name {prog:?}"
                    );
                    self.programs.push((prog, section.entries, origin.clone()));
                }
                other => anyhow::bail!("{origin}: unknown section [{other}]"),
            }
        }
        Ok(())
    }

    fn apply_globals(&mut self, origin: &str, section: &RawSection) -> anyhow::Result<()> {
        let g = &mut self.globals;
        for (key, value) in &section.entries {
            match key.as_str() {
                "logfile" => g.logfile = Some(PathBuf::from(value)),
                "logfile_maxbytes" => g.logfile_maxbytes = Some(parse_size_spec_bytes(value)?),
                "logfile_backups" => g.logfile_backups = Some(parse_count(origin, key, value)?),
                "loglevel" => g.loglevel = Some(LogLevel::parse(value)?),
                "childlogdir" => g.childlogdir = Some(PathBuf::from(value)),
                "redirect_stderr" => g.redirect_stderr = Some(parse_bool(origin, key, value)?),
                "stdout_logfile" => g.stdout_logfile = Some(value.clone()),
                "stderr_logfile" => g.stderr_logfile = Some(value.clone()),
                "stdout_logfile_maxbytes" => {
                    g.stdout_logfile_maxbytes = Some(parse_size_spec_bytes(value)?)
                }
                "stderr_logfile_maxbytes" => {
                    g.stderr_logfile_maxbytes = Some(parse_size_spec_bytes(value)?)
                }
                "stdout_logfile_backups" => {
                    g.stdout_logfile_backups = Some(parse_count(origin, key, value)?)
                }
                "stderr_logfile_backups" => {
                    g.stderr_logfile_backups = Some(parse_count(origin, key, value)?)
                }
                other => {
                    anyhow::bail!("{origin}: unknown key {other:?} in [{}]", section.name)
                }
            }
        }
        Ok(())
    }

    fn apply_server(&mut self, origin: &str, section: &RawSection) -> anyhow::Result<()> {
        for (key, value) in &section.entries {
            match key.as_str() {
                "enabled" => self.server.enabled = parse_bool(origin, key, value)?,
                "address" => self.server.address = value.clone(),
                "ui_directory" => self.server.ui_directory = value.clone(),
                other => anyhow::bail!("{origin}: unknown key {other:?} in [server]"),
            }
        }
        Ok(())
    }

    fn finish(self) -> anyhow::Result<ManagerConfig> {
        let g = self.globals;
        let child_log_dir = g.childlogdir.unwrap_or_else(default_child_log_dir);
        let logfile = g
            .logfile
            .unwrap_or_else(|| child_log_dir.join("procwatch.log"));

        let mut cfg = ManagerConfig {
            logfile,
            logfile_maxbytes: g.logfile_maxbytes.unwrap_or(DEFAULT_LOGFILE_MAXBYTES),
            logfile_backups: g.logfile_backups.unwrap_or(DEFAULT_LOGFILE_BACKUPS),
            loglevel: g.loglevel.unwrap_or(LogLevel::Info),
            child_log_dir,
            redirect_stderr: g.redirect_stderr.unwrap_or(false),
            stdout_logfile: g.stdout_logfile.unwrap_or_else(|| "AUTO".to_string()),
            stderr_logfile: g.stderr_logfile.unwrap_or_else(|| "AUTO".to_string()),
            stdout_logfile_maxbytes: g.stdout_logfile_maxbytes.unwrap_or(DEFAULT_LOGFILE_MAXBYTES),
            stderr_logfile_maxbytes: g.stderr_logfile_maxbytes.unwrap_or(DEFAULT_LOGFILE_MAXBYTES),
            stdout_logfile_backups: g.stdout_logfile_backups.unwrap_or(DEFAULT_LOGFILE_BACKUPS),
            stderr_logfile_backups: g.stderr_logfile_backups.unwrap_or(DEFAULT_LOGFILE_BACKUPS),
            server: self.server,
            programs: Vec::with_capacity(self.programs.len()),
        };

        for (name, entries, origin) in &self.programs {
            let def = build_program(name, entries, &cfg, origin)
                .with_context(|| format!("program {name:?}"))?;
            cfg.programs.push(def);
        }
        Ok(cfg)
    }
}

fn default_child_log_dir() -> PathBuf {
    if nix::unistd::geteuid().is_root() {
        PathBuf::from("/var/log/procwatch")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".cache/procwatch")
    } else {
        PathBuf::from(".procwatch")
    }
}

fn build_program(
    name: &str,
    entries: &[(String, String)],
    cfg: &ManagerConfig,
    origin: &str,
) -> anyhow::Result<ProgramDefinition> {
    let command = entries
        .iter()
        .find(|(k, _)| k == "command")
        .map(|(_, v)| v.clone())
        .ok_or_else(|| anyhow::anyhow!("{origin}: missing required key command"))?;

    let mut def = ProgramDefinition::new(name, CommandLine::Line(command));

    // Manager-level defaults apply first; per-program keys override.
    def.redirect_stderr = cfg.redirect_stderr;
    def.stdout_logfile = cfg.stdout_logfile.clone();
    def.stderr_logfile = cfg.stderr_logfile.clone();
    def.stdout_logfile_maxbytes = cfg.stdout_logfile_maxbytes;
    def.stderr_logfile_maxbytes = cfg.stderr_logfile_maxbytes;
    def.stdout_logfile_backups = cfg.stdout_logfile_backups;
    def.stderr_logfile_backups = cfg.stderr_logfile_backups;

    for (key, value) in entries {
        match key.as_str() {
            "command" => {}
            "directory" => def.directory = Some(PathBuf::from(value)),
            "user" => def.user = Some(value.clone()),
            "umask" => def.umask = Some(parse_octal(value).map_err(|e| {
                anyhow::anyhow!("{origin}: invalid umask {value:?}: {e}")
            })?),
            "priority" => def.priority = parse_count(origin, key, value)? as i32,
            "autostart" => def.auto_start = parse_bool(origin, key, value)?,
            "autorestart" => def.auto_restart = AutoRestart::parse(value)?,
            "startsecs" => def.start_seconds = parse_count(origin, key, value)? as u64,
            "startretries" => def.start_retries = parse_count(origin, key, value)? as u32,
            "exitcodes" => def.exit_codes = parse_int_list(origin, key, value)?,
            "stopsignal" => def.stop_signal = StopSignal::parse(value)?,
            "stopwaitsecs" => def.stop_wait_seconds = parse_count(origin, key, value)? as u64,
            "stopasgroup" => def.stop_as_group = parse_bool(origin, key, value)?,
            "killasgroup" => def.kill_as_group = parse_bool(origin, key, value)?,
            "redirect_stderr" => def.redirect_stderr = parse_bool(origin, key, value)?,
            "stdout_logfile" => def.stdout_logfile = value.clone(),
            "stdout_logfile_maxbytes" => def.stdout_logfile_maxbytes = parse_size_spec_bytes(value)?,
            "stdout_logfile_backups" => def.stdout_logfile_backups = parse_count(origin, key, value)?,
            "stderr_logfile" => def.stderr_logfile = value.clone(),
            "stderr_logfile_maxbytes" => def.stderr_logfile_maxbytes = parse_size_spec_bytes(value)?,
            "stderr_logfile_backups" => def.stderr_logfile_backups = parse_count(origin, key, value)?,
            "environment" => def.environment = parse_environment(origin, value)?,
            "schedule" => def.schedule = Some(value.clone()),
            other => anyhow::bail!("{origin}: unknown key {other:?} in [program:{name}]"),
        }
    }
    Ok(def)
}

#[derive(Debug)]
struct RawSection {
    name: String,
    entries: Vec<(String, String)>,
}

fn parse_ini(text: &str, origin: &str) -> anyhow::Result<Vec<RawSection>> {
    let mut sections: Vec<RawSection> = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if let Some(rest) = line.strip_prefix('[') {
            let name = rest
                .strip_suffix(']')
                .ok_or_else(|| {
                    anyhow::anyhow!("{origin}:{}: malformed section header {line:?}", idx + 1)
                })?
                .trim()
                .to_string();
            sections.push(RawSection {
                name,
                entries: Vec::new(),
            });
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| {
            anyhow::anyhow!("{origin}:{}: expected key = value, got {line:?}", idx + 1)
        })?;
        let section = sections.last_mut().ok_or_else(|| {
            anyhow::anyhow!("{origin}:{}: key outside of any section", idx + 1)
        })?;
        section.entries.push((
            key.trim().to_ascii_lowercase(),
            unquote(value.trim()).to_string(),
        ));
    }
    Ok(sections)
}

fn unquote(s: &str) -> &str {
    let b = s.as_bytes();
    if b.len() >= 2
        && ((b[0] == b'"' && b[b.len() - 1] == b'"') || (b[0] == b'\'' && b[b.len() - 1] == b'\''))
    {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

fn parse_bool(origin: &str, key: &str, value: &str) -> anyhow::Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("{origin}: {key} must be a boolean, got {value:?}"),
    }
}

fn parse_count(origin: &str, key: &str, value: &str) -> anyhow::Result<usize> {
    value
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("{origin}: {key} must be a non-negative integer, got {value:?}: {e}"))
}

fn parse_int_list(origin: &str, key: &str, value: &str) -> anyhow::Result<Vec<i32>> {
    let mut out = Vec::new();
    for part in value.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        out.push(part.parse().map_err(|e| {
            anyhow::anyhow!("{origin}: {key} entries must be integers, got {part:?}: {e}")
        })?);
    }
    Ok(out)
}

fn parse_environment(origin: &str, value: &str) -> anyhow::Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for part in value.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (k, v) = part.split_once('=').ok_or_else(|| {
            anyhow::anyhow!("{origin}: environment entries must be KEY=VALUE, got {part:?}")
        })?;
        let k = k.trim();
        anyhow::ensure!(!k.is_empty(), "{origin}: empty environment variable name");
        out.push((k.to_string(), unquote(v.trim()).to_string()));
    }
    Ok(out)
}

fn parse_octal(s: &str) -> anyhow::Result<u32> {
    let t = s.trim();
    let t = t.strip_prefix("0o").or_else(|| t.strip_prefix("0O")).unwrap_or(t);
    let t = t.trim_start_matches('0');
    if t.is_empty() {
        return Ok(0);
    }
    u32::from_str_radix(t, 8).map_err(|e| anyhow::anyhow!("{e}"))
}

/// Human byte sizes: plain bytes, decimal KB/MB/GB/TB and binary
/// KiB/MiB/GiB/TiB. A bare suffix letter ("50m") reads as the decimal unit.
pub fn parse_size_spec_bytes(s: &str) -> anyhow::Result<u64> {
    let t = s.trim();
    anyhow::ensure!(!t.is_empty(), "empty size");
    let split = t
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(t.len());
    let (num_s, unit_s) = t.split_at(split);
    anyhow::ensure!(!num_s.is_empty(), "invalid size {s:?}");
    let num: f64 = num_s
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid size {s:?}: {e}"))?;
    let mult: u64 = match unit_s.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => 1000,
        "m" | "mb" => 1000 * 1000,
        "g" | "gb" => 1000 * 1000 * 1000,
        "t" | "tb" => 1000 * 1000 * 1000 * 1000,
        "kib" => 1 << 10,
        "mib" => 1 << 20,
        "gib" => 1 << 30,
        "tib" => 1u64 << 40,
        _ => anyhow::bail!("unknown size unit {unit_s:?} in {s:?}"),
    };
    Ok((num * mult as f64).round() as u64)
}

/// Durations like "1500ms", "10s", "2m", "1h". A bare number reads as
/// seconds.
pub fn parse_duration_ms(s: &str) -> anyhow::Result<u64> {
    let t = s.trim();
    anyhow::ensure!(!t.is_empty(), "empty duration");
    let split = t
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(t.len());
    let (num_s, unit_s) = t.split_at(split);
    anyhow::ensure!(!num_s.is_empty(), "invalid duration {s:?}");
    let num: f64 = num_s
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid duration {s:?}: {e}"))?;
    anyhow::ensure!(num >= 0.0, "duration must be >= 0");
    let mult: f64 = match unit_s.trim().to_ascii_lowercase().as_str() {
        "ms" => 1.0,
        "" | "s" => 1000.0,
        "m" => 60_000.0,
        "h" => 3_600_000.0,
        other => anyhow::bail!("unknown duration unit {other:?} (use ms/s/m/h)"),
    };
    Ok((num * mult).round() as u64)
}
