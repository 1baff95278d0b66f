//! Dev-server process management.
//!
//! Launches one dev server per session on its own port, probes it for
//! readiness, streams its output into the logs, and terminates the whole
//! process group on stop.

pub mod ports;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::config::Settings;

pub use ports::PortAllocator;

/// Toolchains that read `PORT`/`HOST` from the environment instead of flags.
const ENV_DRIVEN_TOOLCHAINS: &[&str] = &["react-scripts"];

/// A dev server tracked by the manager.
#[derive(Debug)]
struct ProcessEntry {
    pid: u32,
    port: u16,
    #[allow(dead_code)]
    command: Vec<String>,
    #[allow(dead_code)]
    started_at: DateTime<Utc>,
    child: Child,
}

/// Manager for per-session dev-server processes. Owns the port allocator.
#[derive(Debug)]
pub struct ProcessManager {
    settings: Arc<Settings>,
    allocator: PortAllocator,
    processes: Mutex<HashMap<String, ProcessEntry>>,
}

impl ProcessManager {
    pub fn new(settings: Arc<Settings>) -> Self {
        let allocator = PortAllocator::new(settings.port_range_start, settings.port_range_end);
        Self {
            settings,
            allocator,
            processes: Mutex::new(HashMap::new()),
        }
    }

    /// Start a dev server for a session and return its port.
    ///
    /// The child is spawned in a new process group with captured output, cwd
    /// set to the workspace, and the port/host injected per the toolchain's
    /// conventions.
    pub async fn start_process(
        &self,
        session_id: &str,
        workspace_path: &Path,
        command: &[String],
        framework: Option<&str>,
    ) -> Result<u16> {
        if command.is_empty() {
            bail!("empty start command");
        }

        let Some(port) = self.allocator.allocate().await else {
            bail!("no available port");
        };

        info!(
            "Starting dev server for session {} on port {}: {:?}",
            session_id, port, command
        );

        let argv = inject_server_flags(command, port);
        let env = dev_server_env(&self.settings, workspace_path, port, session_id);

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(workspace_path)
            .envs(&env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.allocator.release(port).await;
                return Err(e).with_context(|| format!("spawning dev server {:?}", argv));
            }
        };

        let Some(pid) = child.id() else {
            self.allocator.release(port).await;
            bail!("dev server exited before a PID was assigned");
        };

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(stream_output(session_id.to_string(), "stdout", stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(stream_output(session_id.to_string(), "stderr", stderr));
        }

        let entry = ProcessEntry {
            pid,
            port,
            command: argv,
            started_at: Utc::now(),
            child,
        };

        let mut processes = self.processes.lock().await;
        processes.insert(session_id.to_string(), entry);

        info!("Dev server spawned with PID {} on port {}", pid, port);
        Ok(port)
    }

    /// Poll the dev server until it answers HTTP, the process exits, or the
    /// timeout elapses.
    ///
    /// Any response with a status below 500 counts as ready; connection
    /// refused is an expected transient while the server warms up.
    pub async fn wait_for_ready(&self, session_id: &str, timeout: Duration) -> bool {
        let Some(port) = self.get_port(session_id).await else {
            return false;
        };

        let client = match reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                warn!("Failed to build readiness HTTP client: {:?}", e);
                return false;
            }
        };

        let url = format!("http://127.0.0.1:{}/", port);
        let start = tokio::time::Instant::now();
        let mut interval = Duration::from_millis(500);
        let max_interval = Duration::from_secs(5);

        while start.elapsed() < timeout {
            {
                let mut processes = self.processes.lock().await;
                let Some(entry) = processes.get_mut(session_id) else {
                    return false;
                };
                match entry.child.try_wait() {
                    Ok(Some(status)) => {
                        warn!(
                            "Dev server for session {} exited during startup: {}",
                            session_id, status
                        );
                        return false;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Failed to poll dev server for {}: {:?}", session_id, e);
                        return false;
                    }
                }
            }

            match client.get(&url).send().await {
                Ok(response) => {
                    if response.status().as_u16() < 500 {
                        info!(
                            "Dev server ready for session {} (status {})",
                            session_id,
                            response.status()
                        );
                        return true;
                    }
                }
                Err(e) if e.is_connect() => {
                    // Not listening yet.
                }
                Err(e) => {
                    debug!("Readiness probe error for {}: {:?}", session_id, e);
                }
            }

            tokio::time::sleep(interval).await;
            interval = (interval.mul_f32(1.5)).min(max_interval);
        }

        warn!(
            "Dev server for session {} not ready within {:?}",
            session_id, timeout
        );
        false
    }

    /// Stop a session's dev server.
    ///
    /// Sends SIGTERM to the process group, waits up to `graceful_timeout`,
    /// then force-kills. The port is always released. Returns false when no
    /// process was tracked for the session.
    pub async fn stop_process(&self, session_id: &str, graceful_timeout: Duration) -> bool {
        let entry = {
            let mut processes = self.processes.lock().await;
            processes.remove(session_id)
        };

        let Some(mut entry) = entry else {
            return false;
        };

        let port = entry.port;
        let still_running = matches!(entry.child.try_wait(), Ok(None));

        if still_running {
            info!(
                "Stopping dev server for session {} (PID {})",
                session_id, entry.pid
            );
            signal_group(entry.pid, libc::SIGTERM);

            match tokio::time::timeout(graceful_timeout, entry.child.wait()).await {
                Ok(Ok(_)) => {
                    debug!("Dev server for {} terminated gracefully", session_id);
                }
                Ok(Err(e)) => {
                    warn!("Error waiting for dev server {}: {:?}", session_id, e);
                }
                Err(_) => {
                    warn!(
                        "Graceful shutdown timeout for session {}, forcing kill",
                        session_id
                    );
                    signal_group(entry.pid, libc::SIGKILL);
                    if tokio::time::timeout(Duration::from_secs(5), entry.child.wait())
                        .await
                        .is_err()
                    {
                        warn!("Failed to reap dev server for session {}", session_id);
                    }
                }
            }
        }

        self.allocator.release(port).await;
        true
    }

    /// Port of a tracked process, if any.
    pub async fn get_port(&self, session_id: &str) -> Option<u16> {
        self.processes
            .lock()
            .await
            .get(session_id)
            .map(|entry| entry.port)
    }

    /// Whether the session's dev server is still running.
    pub async fn is_process_alive(&self, session_id: &str) -> bool {
        let mut processes = self.processes.lock().await;
        match processes.get_mut(session_id) {
            Some(entry) => matches!(entry.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Stop every tracked process in parallel. Used during shutdown.
    pub async fn stop_all(&self) -> usize {
        let session_ids: Vec<String> = {
            let processes = self.processes.lock().await;
            processes.keys().cloned().collect()
        };

        let stops = session_ids
            .iter()
            .map(|id| self.stop_process(id, Duration::from_secs(5)));
        let stopped = futures::future::join_all(stops)
            .await
            .into_iter()
            .filter(|stopped| *stopped)
            .count();

        info!("Stopped {} dev server(s)", stopped);
        stopped
    }
}

/// Send a signal to the child's process group.
fn signal_group(pid: u32, signal: i32) {
    #[cfg(unix)]
    {
        // The child was spawned with process_group(0), so pgid == pid.
        unsafe {
            libc::killpg(pid as i32, signal);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, signal);
    }
}

/// Forward a child stream to the logs, line by line.
async fn stream_output(
    session_id: String,
    label: &'static str,
    stream: impl tokio::io::AsyncRead + Unpin,
) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("[{}][{}] {}", session_id, label, line);
    }
}

/// Inject `--port` and `--host` into a start command.
///
/// npm-run scripts need a `--` separator before injected flags; yarn and
/// pnpm pass extra args straight through. `react-scripts` reads PORT/HOST
/// from the environment and gets no flags at all.
pub fn inject_server_flags(command: &[String], port: u16) -> Vec<String> {
    let mut argv: Vec<String> = command.to_vec();
    if argv.is_empty() {
        return argv;
    }

    if argv
        .iter()
        .any(|arg| ENV_DRIVEN_TOOLCHAINS.iter().any(|t| arg.contains(t)))
    {
        return argv;
    }

    let has_port = argv
        .iter()
        .any(|arg| arg == "--port" || arg == "-p" || arg == "-P");
    let has_host = argv
        .iter()
        .any(|arg| arg == "--host" || arg == "-H" || arg == "--hostname");

    let mut flags: Vec<String> = Vec::new();
    if !has_port {
        flags.push("--port".to_string());
        flags.push(port.to_string());
    }
    if !has_host {
        // Bind all interfaces so the proxy can reach the server.
        flags.push("--host".to_string());
    }

    if flags.is_empty() {
        return argv;
    }

    let is_npm_script = argv[0] == "npm"
        && argv
            .get(1)
            .is_some_and(|sub| sub == "run" || sub == "start");

    if is_npm_script && !argv.iter().any(|arg| arg == "--") {
        argv.push("--".to_string());
    }
    argv.extend(flags);
    argv
}

/// Environment for a dev-server child process.
///
/// Port hints cover the common toolchains; HMR hints steer the Vite
/// websocket through the public preview URL. No `--base` flag is ever
/// injected: dev-server base-path redirects fight the proxy's prefix
/// stripping, so path-mode URL fixes happen in the proxy instead.
pub fn dev_server_env(
    settings: &Settings,
    workspace_path: &Path,
    port: u16,
    session_id: &str,
) -> HashMap<String, String> {
    let mut env = HashMap::new();

    let port_str = port.to_string();
    env.insert("PORT".to_string(), port_str.clone());
    env.insert("DEV_PORT".to_string(), port_str.clone());
    env.insert("VITE_PORT".to_string(), port_str);

    if settings.use_subdomain_routing {
        if let Some(domain) = &settings.preview_domain {
            let preview_host = format!("{}.{}", session_id, domain);
            env.insert("VITE_HMR_PROTOCOL".to_string(), "wss".to_string());
            env.insert("VITE_HMR_HOST".to_string(), preview_host);
            env.insert("VITE_HMR_PORT".to_string(), "443".to_string());
            env.insert("VITE_HMR_CLIENT_PORT".to_string(), "443".to_string());
        }
        env.insert("BASE_PATH".to_string(), "/".to_string());
        env.insert("PUBLIC_URL".to_string(), "/".to_string());
    } else {
        let base_path = format!("{}/{}/", settings.preview_path_prefix, session_id);
        env.insert("BASE_PATH".to_string(), base_path.clone());
        env.insert("PUBLIC_URL".to_string(), base_path.clone());
        env.insert("ASSET_PREFIX".to_string(), base_path);
        env.insert("VITE_HMR_PROTOCOL".to_string(), "wss".to_string());
        env.insert("VITE_HMR_HOST".to_string(), String::new());
    }

    env.insert("VITE_CJS_IGNORE_WARNING".to_string(), "true".to_string());
    env.insert("BROWSER".to_string(), "none".to_string());
    env.insert("HOST".to_string(), "0.0.0.0".to_string());
    env.insert("CI".to_string(), "true".to_string());
    env.insert("NO_UPDATE_NOTIFIER".to_string(), "1".to_string());
    env.insert(
        "NPM_CONFIG_UPDATE_NOTIFIER".to_string(),
        "false".to_string(),
    );
    env.insert(
        "NODE_OPTIONS".to_string(),
        "--max-old-space-size=3072".to_string(),
    );

    let node_bin: PathBuf = workspace_path.join("node_modules").join(".bin");
    let path = match std::env::var("PATH") {
        Ok(existing) => format!("{}:{}", node_bin.display(), existing),
        Err(_) => node_bin.display().to_string(),
    };
    env.insert("PATH".to_string(), path);

    env
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn test_settings() -> Arc<Settings> {
        Arc::new(Settings {
            port_range_start: 42200,
            port_range_end: 42300,
            ..Settings::default()
        })
    }

    #[test]
    fn npm_run_gets_separator_before_flags() {
        let argv = inject_server_flags(&cmd(&["npm", "run", "dev"]), 3001);
        assert_eq!(argv, cmd(&["npm", "run", "dev", "--", "--port", "3001", "--host"]));
    }

    #[test]
    fn npm_start_gets_separator_before_flags() {
        let argv = inject_server_flags(&cmd(&["npm", "start"]), 3001);
        assert_eq!(argv, cmd(&["npm", "start", "--", "--port", "3001", "--host"]));
    }

    #[test]
    fn yarn_and_pnpm_get_flags_directly() {
        let argv = inject_server_flags(&cmd(&["yarn", "dev"]), 3001);
        assert_eq!(argv, cmd(&["yarn", "dev", "--port", "3001", "--host"]));

        let argv = inject_server_flags(&cmd(&["pnpm", "dev"]), 3001);
        assert_eq!(argv, cmd(&["pnpm", "dev", "--port", "3001", "--host"]));
    }

    #[test]
    fn react_scripts_gets_no_flags() {
        let argv = inject_server_flags(&cmd(&["npx", "react-scripts", "start"]), 3001);
        assert_eq!(argv, cmd(&["npx", "react-scripts", "start"]));
    }

    #[test]
    fn existing_flags_are_not_duplicated() {
        let argv = inject_server_flags(&cmd(&["npx", "vite", "--port", "5173"]), 3001);
        assert_eq!(argv, cmd(&["npx", "vite", "--port", "5173", "--host"]));

        let argv = inject_server_flags(&cmd(&["npx", "vite", "--port", "5173", "--host"]), 3001);
        assert_eq!(argv, cmd(&["npx", "vite", "--port", "5173", "--host"]));
    }

    #[test]
    fn env_sets_port_hints_and_path() {
        let settings = Settings::default();
        let env = dev_server_env(&settings, Path::new("/tmp/ws"), 3005, "abc");

        assert_eq!(env.get("PORT").unwrap(), "3005");
        assert_eq!(env.get("DEV_PORT").unwrap(), "3005");
        assert_eq!(env.get("VITE_PORT").unwrap(), "3005");
        assert_eq!(env.get("HOST").unwrap(), "0.0.0.0");
        assert_eq!(env.get("BROWSER").unwrap(), "none");
        assert_eq!(env.get("CI").unwrap(), "true");
        assert!(env.get("PATH").unwrap().starts_with("/tmp/ws/node_modules/.bin"));
        assert!(env.get("NODE_OPTIONS").unwrap().contains("max-old-space-size"));
    }

    #[test]
    fn env_path_mode_sets_base_path() {
        let settings = Settings::default();
        let env = dev_server_env(&settings, Path::new("/tmp/ws"), 3005, "abc");

        assert_eq!(env.get("BASE_PATH").unwrap(), "/preview/abc/");
        assert_eq!(env.get("ASSET_PREFIX").unwrap(), "/preview/abc/");
    }

    #[test]
    fn env_subdomain_mode_points_hmr_at_public_host() {
        let settings = Settings {
            use_subdomain_routing: true,
            preview_domain: Some("preview.example".to_string()),
            ..Settings::default()
        };
        let env = dev_server_env(&settings, Path::new("/tmp/ws"), 3005, "abc");

        assert_eq!(env.get("BASE_PATH").unwrap(), "/");
        assert_eq!(env.get("VITE_HMR_HOST").unwrap(), "abc.preview.example");
        assert_eq!(env.get("VITE_HMR_PROTOCOL").unwrap(), "wss");
        assert_eq!(env.get("VITE_HMR_PORT").unwrap(), "443");
        assert!(!env.contains_key("ASSET_PREFIX"));
    }

    #[tokio::test]
    async fn exhausted_port_range_fails_with_clear_reason() {
        let settings = Arc::new(Settings {
            port_range_start: 42310,
            port_range_end: 42310,
            ..Settings::default()
        });
        let manager = ProcessManager::new(settings);

        let err = manager
            .start_process("s1", Path::new("/tmp"), &cmd(&["npm", "start"]), None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "no available port");
    }

    #[tokio::test]
    async fn stop_unknown_session_is_a_noop() {
        let manager = ProcessManager::new(test_settings());
        assert!(!manager.stop_process("nope", Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn wait_for_ready_without_process_fails_fast() {
        let manager = ProcessManager::new(test_settings());
        assert!(!manager.wait_for_ready("nope", Duration::from_secs(1)).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_kills_tracked_process_and_releases_port() {
        let manager = ProcessManager::new(test_settings());

        let mut cmd = Command::new("sleep");
        cmd.arg("60")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd.process_group(0);
        let child = cmd.spawn().unwrap();
        let pid = child.id().unwrap();

        let port = manager.allocator.allocate().await.unwrap();
        {
            let mut processes = manager.processes.lock().await;
            processes.insert(
                "s1".to_string(),
                ProcessEntry {
                    pid,
                    port,
                    command: vec!["sleep".to_string(), "60".to_string()],
                    started_at: Utc::now(),
                    child,
                },
            );
        }

        assert!(manager.is_process_alive("s1").await);
        assert_eq!(manager.get_port("s1").await, Some(port));

        assert!(manager.stop_process("s1", Duration::from_secs(5)).await);
        assert!(!manager.is_process_alive("s1").await);
        assert_eq!(manager.get_port("s1").await, None);
        assert_eq!(manager.allocator.in_use().await, 0);

        // Second stop is a no-op.
        assert!(!manager.stop_process("s1", Duration::from_secs(1)).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_all_clears_every_session() {
        let manager = ProcessManager::new(test_settings());

        for name in ["a", "b"] {
            let mut cmd = Command::new("sleep");
            cmd.arg("60")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true);
            cmd.process_group(0);
            let child = cmd.spawn().unwrap();
            let pid = child.id().unwrap();
            let port = manager.allocator.allocate().await.unwrap();

            let mut processes = manager.processes.lock().await;
            processes.insert(
                name.to_string(),
                ProcessEntry {
                    pid,
                    port,
                    command: vec!["sleep".to_string()],
                    started_at: Utc::now(),
                    child,
                },
            );
        }

        assert_eq!(manager.stop_all().await, 2);
        assert!(!manager.is_process_alive("a").await);
        assert!(!manager.is_process_alive("b").await);
    }
}
