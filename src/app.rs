//! Supervisor for the SPDK application process.
//!
//! `SpdkApp::run` starts SPDK in its own process group, waits for the
//! control socket to appear and opens up its permissions so that
//! unprivileged clients can connect. `SpdkApp::terminate` stops the whole
//! group, escalating to `SIGKILL` after a grace period.
//!
//! SPDK normally needs root. By default every privileged step (spawn,
//! signal, chmod) goes through `sudo --non-interactive`; configure a
//! different [`PrivilegeHelper`] or none at all with
//! [`AppOptions::with_privilege_helper`].
//!
//! # Example
//!
//! ```ignore
//! use spdkctrl::app::{AppOptions, SpdkApp};
//! use spdkctrl::ipc::Client;
//!
//! let app = SpdkApp::run(AppOptions::from_env().with_spdk_app("/usr/local/bin/spdk_tgt")).await?;
//! let client = Client::connect_with_retry(app.socket_path(), 5).await?;
//! // ...
//! client.close().await?;
//! let forced = app.terminate().await?;
//! ```

use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Default wait for the socket on start and for the exit on stop.
pub const SPDK_APP_TIMEOUT: Duration = Duration::from_secs(10);

/// How often to look for the control socket while SPDK starts.
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(1);

pub const ENV_SPDK_APP_BINARY: &str = "SPDK_APP_BINARY";
pub const ENV_SPDK_APP_SOCKET: &str = "SPDK_APP_SOCKET";
pub const ENV_SPDK_VHOST_SOCKET_PATH: &str = "SPDK_VHOST_SOCKET_PATH";

/// Errors from starting or stopping SPDK.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("SPDK application is not assigned")]
    BinaryNotConfigured,

    #[error("SPDK application socket is not assigned")]
    SocketNotConfigured,

    #[error("Failed to start SPDK: {0}")]
    Spawn(#[source] io::Error),

    #[error("SPDK quit unexpectedly ({0})")]
    UnexpectedQuit(ExitStatus),

    #[error("Timed out waiting for {} after {timeout:?}", path.display())]
    SocketTimeout { path: PathBuf, timeout: Duration },

    #[error("chmod {}: {detail}", path.display())]
    Permissions { path: PathBuf, detail: String },

    #[error("Failed to signal process group {pid}: {detail}")]
    Signal { pid: u32, detail: String },

    #[error("Failed to wait for SPDK: {0}")]
    Wait(#[source] io::Error),
}

/// Where SPDK's stdout and stderr go.
#[derive(Debug, Default)]
pub enum LogOutput {
    /// Discard.
    #[default]
    Null,
    /// Share this process's stdout and stderr.
    Inherit,
    /// Append both streams to a file.
    File(File),
    /// Forward each line to `tracing` under target `spdk`.
    Tracing,
}

/// Command prefix used for privileged operations, e.g. `sudo -n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivilegeHelper {
    program: OsString,
    args: Vec<OsString>,
}

impl PrivilegeHelper {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// `sudo --non-interactive`
    pub fn sudo() -> Self {
        Self::new("sudo").arg("--non-interactive")
    }

    /// A command running `program` through the helper.
    fn command(&self, program: impl AsRef<OsStr>) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).arg(program);
        cmd
    }

    fn std_command(&self, program: impl AsRef<OsStr>) -> std::process::Command {
        let mut cmd = std::process::Command::new(&self.program);
        cmd.args(&self.args).arg(program);
        cmd
    }
}

impl Default for PrivilegeHelper {
    fn default() -> Self {
        Self::sudo()
    }
}

/// Options for [`SpdkApp::run`].
///
/// [`AppOptions::from_env`] seeds the binary and socket paths from the
/// environment; the `with_*` methods override them.
#[derive(Debug)]
pub struct AppOptions {
    spdk_app: Option<PathBuf>,
    app_socket: Option<PathBuf>,
    vhost_sock_path: Option<PathBuf>,
    log_output: LogOutput,
    privilege_helper: Option<PrivilegeHelper>,
    startup_timeout: Duration,
    stop_timeout: Duration,
    extra_args: Vec<OsString>,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            spdk_app: None,
            app_socket: None,
            vhost_sock_path: None,
            log_output: LogOutput::default(),
            privilege_helper: Some(PrivilegeHelper::default()),
            startup_timeout: SPDK_APP_TIMEOUT,
            stop_timeout: SPDK_APP_TIMEOUT,
            extra_args: Vec::new(),
        }
    }
}

impl AppOptions {
    /// Defaults with no paths set; the environment is not consulted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `SPDK_APP_BINARY`, `SPDK_APP_SOCKET` and
    /// `SPDK_VHOST_SOCKET_PATH`. Empty variables count as unset.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var_os(key))
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<OsString>) -> Self {
        let path = |key: &str| lookup(key).filter(|v| !v.is_empty()).map(PathBuf::from);
        Self {
            spdk_app: path(ENV_SPDK_APP_BINARY),
            app_socket: path(ENV_SPDK_APP_SOCKET),
            vhost_sock_path: path(ENV_SPDK_VHOST_SOCKET_PATH),
            ..Self::default()
        }
    }

    /// Path of the SPDK executable.
    pub fn with_spdk_app(mut self, path: impl Into<PathBuf>) -> Self {
        self.spdk_app = Some(path.into());
        self
    }

    /// Where SPDK creates its control socket (`-r`).
    pub fn with_app_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.app_socket = Some(path.into());
        self
    }

    /// Directory for vhost controller sockets (`-S`).
    pub fn with_vhost_sock_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.vhost_sock_path = Some(path.into());
        self
    }

    pub fn with_log_output(mut self, output: LogOutput) -> Self {
        self.log_output = output;
        self
    }

    /// `None` runs SPDK and the signal and chmod steps directly.
    pub fn with_privilege_helper(mut self, helper: Option<PrivilegeHelper>) -> Self {
        self.privilege_helper = helper;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Grace period between `SIGTERM` and `SIGKILL` on terminate.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Arguments appended after the socket options.
    pub fn with_extra_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn app_socket(&self) -> Option<&Path> {
        self.app_socket.as_deref()
    }

    /// `<binary> [-r <socket>] [-S <vhost dir>] [extra args...]`
    pub fn command_line(&self) -> Result<Vec<OsString>, AppError> {
        let binary = self.spdk_app.as_ref().ok_or(AppError::BinaryNotConfigured)?;

        let mut args = vec![binary.clone().into_os_string()];
        if let Some(socket) = &self.app_socket {
            args.push("-r".into());
            args.push(socket.clone().into_os_string());
        }
        if let Some(dir) = &self.vhost_sock_path {
            args.push("-S".into());
            args.push(dir.clone().into_os_string());
        }
        args.extend(self.extra_args.iter().cloned());
        Ok(args)
    }
}

/// A running SPDK application.
///
/// Dropping it without calling [`SpdkApp::terminate`] kills the process
/// group so SPDK is never left behind.
pub struct SpdkApp {
    /// `None` once terminated.
    child: Option<Child>,
    /// Also the process group id.
    pid: u32,
    socket_path: PathBuf,
    helper: Option<PrivilegeHelper>,
    stop_timeout: Duration,
}

impl SpdkApp {
    /// Start SPDK and wait until its control socket is usable.
    ///
    /// # Errors
    ///
    /// - `AppError::BinaryNotConfigured` / `SocketNotConfigured` before
    ///   anything is started
    /// - `AppError::UnexpectedQuit` if SPDK exits before creating the socket
    /// - `AppError::SocketTimeout` if the socket does not show up in time;
    ///   the process group is killed
    /// - `AppError::Permissions` if the socket mode cannot be changed
    pub async fn run(options: AppOptions) -> Result<Self, AppError> {
        let args = options.command_line()?;
        let socket_path = options
            .app_socket
            .clone()
            .ok_or(AppError::SocketNotConfigured)?;

        info!(args = ?args, "starting SPDK");
        let mut cmd = match &options.privilege_helper {
            Some(helper) => {
                let mut cmd = helper.command(&args[0]);
                cmd.args(&args[1..]);
                cmd
            }
            None => {
                let mut cmd = Command::new(&args[0]);
                cmd.args(&args[1..]);
                cmd
            }
        };

        // Own process group, so the helper and SPDK can be signalled together.
        cmd.process_group(0).stdin(Stdio::null());
        let forward = matches!(options.log_output, LogOutput::Tracing);
        match options.log_output {
            LogOutput::Null => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
            LogOutput::Inherit => {
                cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
            LogOutput::File(file) => {
                let stderr = file.try_clone().map_err(AppError::Spawn)?;
                cmd.stdout(file).stderr(stderr);
            }
            LogOutput::Tracing => {
                cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
            }
        }

        let mut child = cmd.spawn().map_err(|e| {
            error!(error = %e, "failed to start SPDK");
            AppError::Spawn(e)
        })?;
        if forward {
            if let Some(stdout) = child.stdout.take() {
                tokio::spawn(forward_lines(stdout, "stdout"));
            }
            if let Some(stderr) = child.stderr.take() {
                tokio::spawn(forward_lines(stderr, "stderr"));
            }
        }

        let pid = child
            .id()
            .ok_or_else(|| AppError::Spawn(io::Error::other("SPDK exited during spawn")))?;

        // From here on, Drop cleans up if we bail out.
        let mut app = SpdkApp {
            child: Some(child),
            pid,
            socket_path,
            helper: options.privilege_helper,
            stop_timeout: options.stop_timeout,
        };

        if let Err(e) = app.wait_for_socket(options.startup_timeout).await {
            error!(pid, error = %e, "SPDK did not become ready");
            return Err(e);
        }
        app.relax_permissions(options.startup_timeout).await?;

        info!(pid, socket = %app.socket_path.display(), "SPDK is ready");
        Ok(app)
    }

    /// Process id of the direct child, which is also the process group id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn wait_for_socket(&mut self, timeout: Duration) -> Result<(), AppError> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(child) = self.child.as_mut() {
                if let Some(status) = child.try_wait().map_err(AppError::Wait)? {
                    return Err(AppError::UnexpectedQuit(status));
                }
            }
            if tokio::fs::try_exists(&self.socket_path).await.unwrap_or(false) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                info!(pid = self.pid, "killing SPDK");
                if let Err(e) = self.signal_group(Signal::SIGKILL).await {
                    warn!(error = %e, "failed to kill SPDK");
                }
                return Err(AppError::SocketTimeout {
                    path: self.socket_path.clone(),
                    timeout,
                });
            }
            tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
        }
    }

    /// Let every user read and write the control socket.
    async fn relax_permissions(&self, timeout: Duration) -> Result<(), AppError> {
        let path = &self.socket_path;
        let permissions_error = |detail: String| {
            error!(socket = %path.display(), detail = %detail, "chmod failed");
            AppError::Permissions {
                path: path.clone(),
                detail,
            }
        };

        match &self.helper {
            Some(helper) => {
                let mut cmd = helper.command("chmod");
                cmd.arg("a+rw").arg(path).kill_on_drop(true);
                let output = tokio::time::timeout(timeout, cmd.output())
                    .await
                    .map_err(|_| permissions_error(format!("timed out after {timeout:?}")))?
                    .map_err(|e| permissions_error(e.to_string()))?;
                if !output.status.success() {
                    return Err(permissions_error(format!(
                        "{}: {}",
                        output.status,
                        String::from_utf8_lossy(&output.stderr).trim()
                    )));
                }
            }
            None => {
                tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))
                    .await
                    .map_err(|e| permissions_error(e.to_string()))?;
            }
        }

        debug!(socket = %path.display(), "socket permissions relaxed");
        Ok(())
    }

    /// Send `sig` to the whole process group.
    async fn signal_group(&self, sig: Signal) -> Result<(), AppError> {
        match &self.helper {
            Some(helper) => {
                let mut cmd = helper.command("kill");
                cmd.args(kill_args(sig, self.pid));
                let output = cmd.output().await.map_err(|e| AppError::Signal {
                    pid: self.pid,
                    detail: e.to_string(),
                })?;
                if output.status.success() {
                    Ok(())
                } else {
                    Err(AppError::Signal {
                        pid: self.pid,
                        detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                    })
                }
            }
            None => killpg(self.pid, sig),
        }
    }

    /// Stop SPDK: `SIGTERM` to the group, then `SIGKILL` after the stop
    /// timeout.
    ///
    /// Returns `true` if the group had to be killed.
    pub async fn terminate(mut self) -> Result<bool, AppError> {
        let Some(mut child) = self.child.take() else {
            return Ok(false);
        };

        if let Some(status) = child.try_wait().map_err(AppError::Wait)? {
            info!(pid = self.pid, %status, "SPDK already exited");
            return Ok(false);
        }

        info!(pid = self.pid, "stopping SPDK");
        if let Err(e) = self.signal_group(Signal::SIGTERM).await {
            // A failed SIGTERM still gets the SIGKILL escalation below.
            warn!(error = %e, "failed to send SIGTERM");
        }

        let forced = match tokio::time::timeout(self.stop_timeout, child.wait()).await {
            Ok(status) => {
                let status = status.map_err(AppError::Wait)?;
                debug!(pid = self.pid, %status, "SPDK exited");
                false
            }
            Err(_) => {
                info!(pid = self.pid, "killing SPDK");
                if let Err(e) = self.signal_group(Signal::SIGKILL).await {
                    warn!(error = %e, "failed to kill process group");
                    let _ = child.start_kill();
                }
                child.wait().await.map_err(AppError::Wait)?;
                true
            }
        };

        info!(pid = self.pid, forced, "stopped SPDK");
        Ok(forced)
    }
}

/// Kills a leftover group on drop.
///
/// With a privilege helper inside a Tokio runtime the `kill` runs on a
/// spawned task, which also reaps the child. Outside a runtime it blocks
/// the dropping thread until the helper returns.
impl Drop for SpdkApp {
    fn drop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }

        warn!(pid = self.pid, "SPDK still running on drop, killing");
        let helper = match &self.helper {
            Some(helper) => helper,
            None => {
                if killpg(self.pid, Signal::SIGKILL).is_err() {
                    let _ = child.start_kill();
                }
                return;
            }
        };

        let args = kill_args(Signal::SIGKILL, self.pid);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let mut kill = helper.command("kill");
                kill.args(args).stdout(Stdio::null()).stderr(Stdio::null());
                let pid = self.pid;
                runtime.spawn(async move {
                    let killed = kill.status().await.is_ok_and(|status| status.success());
                    if !killed {
                        warn!(pid, "group kill failed, killing the direct child");
                        let _ = child.start_kill();
                    }
                    let _ = child.wait().await;
                });
            }
            Err(_) => {
                let killed = helper
                    .std_command("kill")
                    .args(args)
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .is_ok_and(|status| status.success());
                if !killed {
                    let _ = child.start_kill();
                }
            }
        }
    }
}

/// Arguments for `kill(1)` targeting process group `pgid`.
fn kill_args(sig: Signal, pgid: u32) -> [String; 4] {
    let name = sig.as_str().trim_start_matches("SIG");
    [
        "-s".to_string(),
        name.to_string(),
        "--".to_string(),
        format!("-{pgid}"),
    ]
}

fn killpg(pgid: u32, sig: Signal) -> Result<(), AppError> {
    let pid = i32::try_from(pgid).map_err(|_| AppError::Signal {
        pid: pgid,
        detail: "pid out of range".to_string(),
    })?;
    match signal::killpg(Pid::from_raw(pid), sig) {
        // Nothing left to signal.
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(AppError::Signal {
            pid: pgid,
            detail: errno.desc().to_string(),
        }),
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(stream: R, name: &'static str) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(target: "spdk", stream = name, "{}", line),
            Ok(None) => break,
            Err(e) => {
                debug!(target: "spdk", stream = name, error = %e, "output closed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::TempDir;

    // ==================== Mock SPDK Scripts ====================
    //
    // The supervisor only cares about the process lifecycle and the socket
    // path, so bash scripts stand in for SPDK. They parse `-r <socket>` and
    // create a plain file there.

    const PARSE_SOCKET: &str = r#"sock=""
while [ $# -gt 0 ]; do
    case "$1" in
        -r) sock="$2"; shift 2 ;;
        *) shift ;;
    esac
done
"#;

    #[derive(Debug, Clone, Copy)]
    enum MockBehavior {
        /// Creates the socket, exits on SIGTERM
        Graceful,
        /// Creates the socket, ignores SIGTERM
        IgnoreTerm,
        /// Exits with status 3 before creating the socket
        ExitEarly,
        /// Never creates the socket
        NoSocket,
    }

    fn mock_spdk(dir: &TempDir, behavior: MockBehavior) -> PathBuf {
        let body = match behavior {
            MockBehavior::Graceful => {
                r#"trap 'rm -f "$sock"; exit 0' TERM
echo "mock SPDK listening on $sock"
touch "$sock"
while true; do sleep 0.05; done
"#
            }
            MockBehavior::IgnoreTerm => {
                r#"trap '' TERM
touch "$sock"
while true; do sleep 0.05; done
"#
            }
            MockBehavior::ExitEarly => "exit 3\n",
            MockBehavior::NoSocket => "while true; do sleep 0.05; done\n",
        };

        let script_path = dir.path().join(format!("mock_spdk_{:?}.sh", behavior));
        fs::write(
            &script_path,
            format!("#!/bin/bash\n{PARSE_SOCKET}{body}"),
        )
        .expect("Failed to write mock script");

        let mut perms = fs::metadata(&script_path)
            .expect("Failed to get script metadata")
            .permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script_path, perms).expect("Failed to set script permissions");

        script_path
    }

    fn mock_options(dir: &TempDir, behavior: MockBehavior) -> AppOptions {
        AppOptions::new()
            .with_spdk_app(mock_spdk(dir, behavior))
            .with_app_socket(dir.path().join("spdk.sock"))
            .with_privilege_helper(None)
            .with_startup_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_run_and_graceful_terminate() {
        let dir = TempDir::new().unwrap();
        let app = SpdkApp::run(mock_options(&dir, MockBehavior::Graceful))
            .await
            .expect("mock SPDK should start");

        assert_eq!(app.socket_path(), dir.path().join("spdk.sock"));
        assert!(app.pid() > 0);
        let mode = fs::metadata(app.socket_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o666);

        let forced = app.terminate().await.unwrap();
        assert!(!forced);
        assert!(!dir.path().join("spdk.sock").exists());
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_sigkill() {
        let dir = TempDir::new().unwrap();
        let options = mock_options(&dir, MockBehavior::IgnoreTerm)
            .with_stop_timeout(Duration::from_millis(200));
        let app = SpdkApp::run(options).await.unwrap();

        let started = std::time::Instant::now();
        let forced = app.terminate().await.unwrap();
        assert!(forced);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_exit_before_socket() {
        let dir = TempDir::new().unwrap();
        let err = SpdkApp::run(mock_options(&dir, MockBehavior::ExitEarly))
            .await
            .err()
            .expect("run should fail");

        match err {
            AppError::UnexpectedQuit(status) => assert_eq!(status.code(), Some(3)),
            other => panic!("Expected UnexpectedQuit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_socket_timeout() {
        let dir = TempDir::new().unwrap();
        let options = mock_options(&dir, MockBehavior::NoSocket)
            .with_startup_timeout(Duration::from_millis(100));

        let started = std::time::Instant::now();
        let err = SpdkApp::run(options).await.err().expect("run should fail");

        assert!(matches!(err, AppError::SocketTimeout { .. }), "{:?}", err);
        assert!(err.to_string().starts_with("Timed out waiting for"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_log_output_to_file() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("spdk.log");
        let log = File::create(&log_path).unwrap();

        let options =
            mock_options(&dir, MockBehavior::Graceful).with_log_output(LogOutput::File(log));
        let app = SpdkApp::run(options).await.unwrap();
        app.terminate().await.unwrap();

        let logged = fs::read_to_string(&log_path).unwrap();
        assert!(logged.contains("mock SPDK listening on"), "{logged}");
    }

    #[tokio::test]
    async fn test_drop_kills_running_app() {
        let dir = TempDir::new().unwrap();
        let app = SpdkApp::run(mock_options(&dir, MockBehavior::IgnoreTerm))
            .await
            .unwrap();
        let pgid = Pid::from_raw(app.pid() as i32);
        drop(app);

        // Every member of the group gets SIGKILL; the group disappears once
        // the zombies are reaped.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let alive = signal::killpg(pgid, None::<Signal>).is_ok();
            let zombie_only = fs::read_to_string(format!("/proc/{}/stat", pgid))
                .map(|stat| stat.contains(") Z "))
                .unwrap_or(true);
            if !alive || zombie_only {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "process group still alive");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// A privilege helper that runs its command as-is, but takes a second
    /// before every `kill`.
    fn slow_kill_helper(dir: &TempDir) -> PrivilegeHelper {
        let path = dir.path().join("slow_helper.sh");
        fs::write(
            &path,
            "#!/bin/bash\nif [ \"$1\" = kill ]; then sleep 1; fi\n\"$@\"\n",
        )
        .expect("Failed to write helper script");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
            .expect("Failed to set helper permissions");
        PrivilegeHelper::new(path)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_drop_with_helper_does_not_block() {
        let dir = TempDir::new().unwrap();
        let options = mock_options(&dir, MockBehavior::IgnoreTerm)
            .with_privilege_helper(Some(slow_kill_helper(&dir)));
        let app = SpdkApp::run(options).await.unwrap();
        let pgid = Pid::from_raw(app.pid() as i32);

        let started = std::time::Instant::now();
        drop(app);
        assert!(started.elapsed() < Duration::from_millis(500));

        // The kill lands after the helper's delay, off the dropping thread.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let alive = signal::killpg(pgid, None::<Signal>).is_ok();
            let leader_gone = fs::read_to_string(format!("/proc/{}/stat", pgid))
                .map(|stat| stat.contains(") Z "))
                .unwrap_or(true);
            if !alive || leader_gone {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "process group still alive");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_binary_not_configured() {
        let err = SpdkApp::run(AppOptions::new().with_app_socket("/tmp/x.sock"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AppError::BinaryNotConfigured));
        assert_eq!(err.to_string(), "SPDK application is not assigned");
    }

    #[tokio::test]
    async fn test_socket_not_configured() {
        let err = SpdkApp::run(AppOptions::new().with_spdk_app("/bin/true"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AppError::SocketNotConfigured));
    }

    #[test]
    fn test_env_then_builder_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_SPDK_APP_BINARY, "/opt/spdk/bin/spdk_tgt"),
            (ENV_SPDK_APP_SOCKET, "/var/tmp/spdk.sock"),
            (ENV_SPDK_VHOST_SOCKET_PATH, ""),
        ]);
        let options = AppOptions::from_lookup(|key| env.get(key).map(OsString::from));

        assert_eq!(options.spdk_app, Some(PathBuf::from("/opt/spdk/bin/spdk_tgt")));
        assert_eq!(options.app_socket(), Some(Path::new("/var/tmp/spdk.sock")));
        assert_eq!(options.vhost_sock_path, None);
        assert_eq!(options.privilege_helper, Some(PrivilegeHelper::sudo()));

        let options = options
            .with_app_socket("/run/spdk/other.sock")
            .with_vhost_sock_path("/run/spdk/vhost");
        assert_eq!(options.app_socket(), Some(Path::new("/run/spdk/other.sock")));
        assert_eq!(options.vhost_sock_path, Some(PathBuf::from("/run/spdk/vhost")));
    }

    #[test]
    fn test_command_line() {
        let options = AppOptions::new()
            .with_spdk_app("/opt/spdk/bin/spdk_tgt")
            .with_app_socket("/var/tmp/spdk.sock")
            .with_vhost_sock_path("/var/tmp/vhost")
            .with_extra_args(["-m", "0x3"]);

        let args: Vec<OsString> = ["/opt/spdk/bin/spdk_tgt", "-r", "/var/tmp/spdk.sock", "-S", "/var/tmp/vhost", "-m", "0x3"]
            .into_iter()
            .map(OsString::from)
            .collect();
        assert_eq!(options.command_line().unwrap(), args);

        let bare = AppOptions::new().with_spdk_app("spdk_tgt");
        assert_eq!(bare.command_line().unwrap(), vec![OsString::from("spdk_tgt")]);
    }

    #[test]
    fn test_kill_args_target_process_group() {
        assert_eq!(
            kill_args(Signal::SIGTERM, 4242),
            ["-s", "TERM", "--", "-4242"].map(String::from)
        );
        assert_eq!(kill_args(Signal::SIGKILL, 7)[1], "KILL");
    }

    #[test]
    fn test_privilege_helper_command() {
        let helper = PrivilegeHelper::new("doas").arg("-n");
        let cmd = helper.std_command("chmod");
        assert_eq!(cmd.get_program(), "doas");
        let args: Vec<&OsStr> = cmd.get_args().collect();
        assert_eq!(args, vec![OsStr::new("-n"), OsStr::new("chmod")]);
    }
}
