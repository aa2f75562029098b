//! Launching and supervising the Node.js Baileys sidecar.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use {
    milesguard_config::WhatsAppConfig,
    tokio::{
        io::{AsyncBufRead, AsyncBufReadExt, BufReader},
        net::TcpStream,
        process::{Child, Command},
        time::{Instant, sleep},
    },
    tracing::{debug, error, info, warn},
};

use crate::error::{Context, Error, Result};

const SIDECAR_DIR_ENV: &str = "MILESGUARD_SIDECAR_DIR";
const SIDECAR_SUBDIR: &str = "sidecar/baileys";
const ENTRYPOINT: &str = "dist/index.js";
const STARTUP_TIMEOUT: Duration = Duration::from_secs(15);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// A running sidecar. Killed when dropped.
pub struct SidecarProcess {
    child: Child,
    port: u16,
}

impl SidecarProcess {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// SIGTERM, then SIGKILL if the sidecar ignores it.
    pub async fn stop(&mut self) {
        info!(port = self.port, "stopping WhatsApp sidecar");

        #[cfg(unix)]
        {
            use nix::{
                sys::signal::{Signal, kill},
                unistd::Pid,
            };
            if let Some(pid) = self.child.id()
                && let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
            {
                debug!(error = %e, pid, "SIGTERM to sidecar failed");
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = self.child.start_kill() {
                debug!(error = %e, "killing sidecar failed");
            }
        }

        match tokio::time::timeout(STOP_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => info!(?status, "WhatsApp sidecar exited"),
            Ok(Err(e)) => warn!(error = %e, "error waiting for sidecar"),
            Err(_) => {
                warn!("sidecar ignored SIGTERM, killing");
                if let Err(e) = self.child.kill().await {
                    error!(error = %e, "failed to kill sidecar");
                }
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarConfig {
    /// Directory holding the sidecar's `package.json`.
    pub sidecar_dir: PathBuf,
    pub port: u16,
    pub auth_dir: PathBuf,
}

impl SidecarConfig {
    /// Resolve the sidecar location and port from the WhatsApp settings.
    pub fn from_config(config: &WhatsAppConfig) -> Result<Self> {
        Ok(Self {
            sidecar_dir: find_sidecar_dir(config.sidecar_dir.as_deref())?,
            port: config.sidecar_port,
            auth_dir: config.session_dir.clone(),
        })
    }
}

fn has_manifest(dir: &Path) -> bool {
    dir.join("package.json").is_file()
}

/// Locate the sidecar: explicit path, `MILESGUARD_SIDECAR_DIR`, next to the
/// executable, then relative to the working directory.
pub fn find_sidecar_dir(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if has_manifest(path) {
            return Ok(path.to_path_buf());
        }
        return Err(Error::message(format!(
            "no package.json in configured sidecar directory {}",
            path.display()
        )));
    }

    if let Ok(dir) = std::env::var(SIDECAR_DIR_ENV) {
        let path = PathBuf::from(&dir);
        if has_manifest(&path) {
            return Ok(path);
        }
        warn!(path = %dir, "{SIDECAR_DIR_ENV} set but package.json not found");
    }

    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(exe_dir) = exe_dir {
        candidates.push(exe_dir.join("..").join(SIDECAR_SUBDIR));
        candidates.push(exe_dir.join("../..").join(SIDECAR_SUBDIR));
    }
    candidates.extend(
        ["", "..", "../.."]
            .into_iter()
            .map(|prefix| Path::new(prefix).join(SIDECAR_SUBDIR)),
    );

    candidates
        .into_iter()
        .find(|dir| has_manifest(dir))
        .map(|dir| dir.canonicalize().unwrap_or(dir))
        .ok_or_else(|| {
            Error::message(format!(
                "WhatsApp sidecar not found; set {SIDECAR_DIR_ENV} or create {SIDECAR_SUBDIR}"
            ))
        })
}

/// Build if needed, spawn `node dist/index.js`, and wait until the
/// WebSocket port accepts connections.
pub async fn start_sidecar(config: &SidecarConfig) -> Result<SidecarProcess> {
    let dir = &config.sidecar_dir;
    if !has_manifest(dir) {
        return Err(Error::message(format!(
            "WhatsApp sidecar not found at {}",
            dir.display()
        )));
    }
    if !dir.join(ENTRYPOINT).exists() {
        info!(path = %dir.display(), "building WhatsApp sidecar");
        if !dir.join("node_modules").exists() {
            npm(dir, &["install"]).await?;
        }
        npm(dir, &["run", "build"]).await?;
    }

    info!(path = %dir.display(), port = config.port, "starting WhatsApp sidecar");
    let mut child = Command::new("node")
        .arg(ENTRYPOINT)
        .current_dir(dir)
        .env("MILESGUARD_SIDECAR_PORT", config.port.to_string())
        .env("MILESGUARD_AUTH_DIR", &config.auth_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .context("failed to spawn sidecar process")?;

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_logs(BufReader::new(stdout)));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(target: "whatsapp_sidecar", "{line}");
            }
        });
    }

    let mut process = SidecarProcess {
        child,
        port: config.port,
    };
    wait_until_listening(&mut process).await?;
    info!(port = config.port, "WhatsApp sidecar ready");
    Ok(process)
}

async fn wait_until_listening(process: &mut SidecarProcess) -> Result<()> {
    let deadline = Instant::now() + STARTUP_TIMEOUT;
    loop {
        if let Some(status) = process.child.try_wait()? {
            return Err(Error::message(format!(
                "sidecar exited during startup with {status}"
            )));
        }
        if TcpStream::connect(("127.0.0.1", process.port)).await.is_ok() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(Error::timeout("sidecar startup", STARTUP_TIMEOUT));
        }
        sleep(Duration::from_millis(250)).await;
    }
}

async fn npm(dir: &Path, args: &[&str]) -> Result<()> {
    info!(path = %dir.display(), ?args, "running npm");
    let output = Command::new("npm")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .with_context(|| format!("failed to run npm {}", args.join(" ")))?;
    if !output.status.success() {
        return Err(Error::message(format!(
            "npm {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

/// Relay pino JSON lines at their own level; anything else at info.
async fn forward_logs(reader: impl AsyncBufRead + Unpin) {
    let mut lines = reader.lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match parse_pino(&line) {
            Some((level, msg)) => match level {
                0..=20 => debug!(target: "whatsapp_sidecar", "{msg}"),
                30 => info!(target: "whatsapp_sidecar", "{msg}"),
                40 => warn!(target: "whatsapp_sidecar", "{msg}"),
                _ => error!(target: "whatsapp_sidecar", "{msg}"),
            },
            None => info!(target: "whatsapp_sidecar", "{line}"),
        }
    }
}

fn parse_pino(line: &str) -> Option<(u64, String)> {
    if !line.starts_with('{') {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    let level = value.get("level").and_then(|v| v.as_u64()).unwrap_or(30);
    let msg = value.get("msg").and_then(|v| v.as_str()).unwrap_or(line);
    Some((level, msg.to_string()))
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pino_lines_keep_level_and_message() {
        assert_eq!(
            parse_pino(r#"{"level":40,"msg":"stream errored"}"#),
            Some((40, "stream errored".into()))
        );
        assert_eq!(
            parse_pino(r#"{"msg":"no level"}"#),
            Some((30, "no level".into()))
        );
        assert_eq!(parse_pino("plain text"), None);
        assert_eq!(parse_pino("{broken"), None);
    }

    #[test]
    fn explicit_dir_requires_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(find_sidecar_dir(Some(tmp.path())).is_err());

        std::fs::write(tmp.path().join("package.json"), "{}").unwrap();
        assert_eq!(find_sidecar_dir(Some(tmp.path())).unwrap(), tmp.path());
    }

    #[tokio::test]
    async fn start_rejects_missing_sidecar() {
        let tmp = tempfile::tempdir().unwrap();
        let config = SidecarConfig {
            sidecar_dir: tmp.path().to_path_buf(),
            port: 1,
            auth_dir: tmp.path().join("auth"),
        };
        assert!(start_sidecar(&config).await.is_err());
    }
}
