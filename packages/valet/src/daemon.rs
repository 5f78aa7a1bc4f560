//! Background daemon management: PID files, health polling, and
//! start/stop/status over the server's `/health` endpoint.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command as ProcessCommand, Stdio};
use std::time::{Duration, Instant};

use reqwest::blocking::Client as HttpClient;

use crate::cli::CliError;

const DAEMON_HEALTH_TIMEOUT: Duration = Duration::from_secs(30);
const HEALTH_CHECK_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const HEALTH_CHECK_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

pub fn daemon_state_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("valet").join("daemon"))
        .unwrap_or_else(|| PathBuf::from(".").join(".valet").join("daemon"))
}

pub fn sanitize_host(host: &str) -> String {
    host.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '-' })
        .collect()
}

pub fn daemon_pid_path(host: &str, port: u16) -> PathBuf {
    let name = format!("daemon-{}-{}.pid", sanitize_host(host), port);
    daemon_state_dir().join(name)
}

pub fn daemon_log_path(host: &str, port: u16) -> PathBuf {
    let name = format!("daemon-{}-{}.log", sanitize_host(host), port);
    daemon_state_dir().join(name)
}

// ---------------------------------------------------------------------------
// PID helpers
// ---------------------------------------------------------------------------

pub fn read_pid(path: &Path) -> Option<u32> {
    let text = fs::read_to_string(path).ok()?;
    text.trim().parse::<u32>().ok()
}

pub fn write_pid(path: &Path, pid: u32) -> Result<(), CliError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, pid.to_string())?;
    Ok(())
}

pub fn remove_pid(path: &Path) -> Result<(), CliError> {
    if path.exists() {
        fs::remove_file(path)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Process helpers
// ---------------------------------------------------------------------------

#[cfg(unix)]
pub fn is_process_running(pid: u32) -> bool {
    let result = unsafe { libc::kill(pid as i32, 0) };
    if result == 0 {
        return true;
    }
    matches!(
        std::io::Error::last_os_error().raw_os_error(),
        Some(code) if code == libc::EPERM
    )
}

#[cfg(not(unix))]
pub fn is_process_running(_pid: u32) -> bool {
    false
}

// ---------------------------------------------------------------------------
// Health checks
// ---------------------------------------------------------------------------

pub fn check_health(base_url: &str) -> Result<bool, CliError> {
    let url = format!("{base_url}/health");
    let started_at = Instant::now();
    let client = HttpClient::builder()
        .connect_timeout(HEALTH_CHECK_CONNECT_TIMEOUT)
        .timeout(HEALTH_CHECK_REQUEST_TIMEOUT)
        .build()?;
    match client.get(url).send() {
        Ok(response) if response.status().is_success() => {
            tracing::info!(
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                "daemon health check succeeded"
            );
            Ok(true)
        }
        Ok(response) => {
            tracing::warn!(
                status = %response.status(),
                "daemon health check returned non-success status"
            );
            Ok(false)
        }
        Err(err) => {
            tracing::debug!(error = %err, "daemon health check request failed");
            Ok(false)
        }
    }
}

pub fn wait_for_health(
    mut server_child: Option<&mut Child>,
    base_url: &str,
    timeout: Duration,
) -> Result<(), CliError> {
    let client = HttpClient::builder()
        .connect_timeout(HEALTH_CHECK_CONNECT_TIMEOUT)
        .timeout(HEALTH_CHECK_REQUEST_TIMEOUT)
        .build()?;
    let deadline = Instant::now() + timeout;
    let url = format!("{base_url}/health");
    let mut attempts: u32 = 0;

    while Instant::now() < deadline {
        attempts += 1;
        if let Some(child) = server_child.as_mut() {
            if let Some(status) = child.try_wait()? {
                return Err(CliError::Server(format!(
                    "valet server exited before becoming healthy ({status})"
                )));
            }
        }

        match client.get(&url).send() {
            Ok(response) if response.status().is_success() => {
                tracing::info!(attempts, "daemon became healthy");
                return Ok(());
            }
            _ => std::thread::sleep(Duration::from_millis(200)),
        }
    }

    tracing::error!(
        attempts,
        timeout_ms = timeout.as_millis() as u64,
        "timed out waiting for daemon health"
    );
    Err(CliError::Server(
        "timed out waiting for valet server health".to_string(),
    ))
}

// ---------------------------------------------------------------------------
// Spawn
// ---------------------------------------------------------------------------

pub fn spawn_valet_daemon(
    host: &str,
    port: u16,
    secret: Option<&str>,
    log_path: &Path,
) -> Result<Child, CliError> {
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let log_file = fs::File::create(log_path)?;
    let log_file_err = log_file.try_clone()?;

    let exe = std::env::current_exe()?;
    let mut cmd = ProcessCommand::new(exe);
    cmd.arg("server")
        .arg("--host")
        .arg(host)
        .arg("--port")
        .arg(port.to_string())
        .env("VALET_LOG_STDOUT", "1")
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(log_file_err));

    if let Some(secret) = secret {
        cmd.arg("--secret").arg(secret);
    }

    cmd.spawn().map_err(CliError::from)
}

// ---------------------------------------------------------------------------
// DaemonStatus
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum DaemonStatus {
    Running { pid: u32, log_path: PathBuf },
    NotRunning,
}

impl std::fmt::Display for DaemonStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DaemonStatus::Running { pid, log_path } => {
                write!(f, "Daemon running (PID {pid}, logs: {})", log_path.display())
            }
            DaemonStatus::NotRunning => write!(f, "Daemon not running"),
        }
    }
}

// ---------------------------------------------------------------------------
// High-level commands
// ---------------------------------------------------------------------------

pub fn status(host: &str, port: u16) -> Result<DaemonStatus, CliError> {
    let pid_path = daemon_pid_path(host, port);
    let log_path = daemon_log_path(host, port);

    if let Some(pid) = read_pid(&pid_path) {
        if is_process_running(pid) {
            return Ok(DaemonStatus::Running { pid, log_path });
        }
        // Stale PID file
        let _ = remove_pid(&pid_path);
    }

    // The PID file may be gone while the server still runs.
    let base_url = format!("http://{host}:{port}");
    if check_health(&base_url)? {
        return Ok(DaemonStatus::Running { pid: 0, log_path });
    }

    Ok(DaemonStatus::NotRunning)
}

pub fn start(host: &str, port: u16, secret: Option<&str>) -> Result<(), CliError> {
    let base_url = format!("http://{host}:{port}");
    let pid_path = daemon_pid_path(host, port);
    let log_path = daemon_log_path(host, port);

    if check_health(&base_url)? {
        eprintln!("daemon already running at {base_url}");
        return Ok(());
    }

    if let Some(pid) = read_pid(&pid_path) {
        if is_process_running(pid) {
            eprintln!("daemon process {pid} exists; waiting for health");
            return wait_for_health(None, &base_url, DAEMON_HEALTH_TIMEOUT);
        }
        let _ = remove_pid(&pid_path);
    }

    eprintln!(
        "starting daemon at {base_url} (logs: {})",
        log_path.display()
    );

    let mut child = spawn_valet_daemon(host, port, secret, &log_path)?;
    let pid = child.id();
    write_pid(&pid_path, pid)?;

    let result = wait_for_health(Some(&mut child), &base_url, DAEMON_HEALTH_TIMEOUT);
    if result.is_err() {
        let _ = remove_pid(&pid_path);
        return result;
    }

    eprintln!("daemon started (PID {pid}, logs: {})", log_path.display());
    Ok(())
}

#[cfg(unix)]
fn stop_process(pid: u32, pid_path: &Path) -> Result<(), CliError> {
    eprintln!("stopping daemon (PID {pid})...");

    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }

    // Grace period before escalating.
    for _ in 0..50 {
        std::thread::sleep(Duration::from_millis(100));
        if !is_process_running(pid) {
            let _ = remove_pid(pid_path);
            eprintln!("daemon stopped");
            return Ok(());
        }
    }

    eprintln!("daemon did not stop gracefully, sending SIGKILL...");
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
    std::thread::sleep(Duration::from_millis(100));
    let _ = remove_pid(pid_path);
    eprintln!("daemon killed");
    Ok(())
}

#[cfg(unix)]
pub fn stop(host: &str, port: u16) -> Result<(), CliError> {
    let pid_path = daemon_pid_path(host, port);

    let pid = match read_pid(&pid_path) {
        Some(pid) => pid,
        None => {
            eprintln!("daemon is not running (no PID file)");
            return Ok(());
        }
    };

    if !is_process_running(pid) {
        eprintln!("daemon is not running (stale PID file)");
        let _ = remove_pid(&pid_path);
        return Ok(());
    }

    stop_process(pid, &pid_path)
}

#[cfg(not(unix))]
pub fn stop(_host: &str, _port: u16) -> Result<(), CliError> {
    Err(CliError::Server(
        "daemon stop is only supported on unix hosts".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_sanitization() {
        assert_eq!(sanitize_host("127.0.0.1"), "127-0-0-1");
        assert_eq!(sanitize_host("localhost"), "localhost");
    }

    #[test]
    fn pid_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("daemon.pid");
        write_pid(&path, 4242).expect("write");
        assert_eq!(read_pid(&path), Some(4242));
        remove_pid(&path).expect("remove");
        assert_eq!(read_pid(&path), None);
    }

    #[cfg(unix)]
    #[test]
    fn current_process_is_running() {
        assert!(is_process_running(std::process::id()));
    }
}
