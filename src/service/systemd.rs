//! `systemd --user` adapter.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use super::{ServiceError, ServiceManager, ServiceSpec, SERVICE_NAME};

pub struct SystemdUserManager {
    unit_dir: PathBuf,
}

impl SystemdUserManager {
    pub fn new(unit_dir: impl Into<PathBuf>) -> Self {
        Self {
            unit_dir: unit_dir.into(),
        }
    }

    /// `~/.config/systemd/user`.
    pub fn for_current_user() -> Option<Self> {
        dirs::config_dir().map(|dir| Self::new(dir.join("systemd").join("user")))
    }

    fn unit_name() -> String {
        format!("{SERVICE_NAME}.service")
    }

    pub fn unit_path(&self) -> PathBuf {
        self.unit_dir.join(Self::unit_name())
    }

    async fn systemctl(&self, args: &[&str]) -> Result<(), ServiceError> {
        let binary = which::which("systemctl")
            .map_err(|_| ServiceError::Unsupported("systemctl not found in PATH".to_string()))?;

        let output = Command::new(binary)
            .arg("--user")
            .args(args)
            .output()
            .await?;

        if output.status.success() {
            tracing::debug!(?args, "systemctl succeeded");
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(ServiceError::Command(format!(
            "systemctl --user {} exited with {}: {}",
            args.join(" "),
            output.status,
            stderr.trim()
        )))
    }
}

/// systemd quoting for a single word.
fn quote(value: &Path) -> String {
    let text = value.display().to_string();
    format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
}

pub(crate) fn render_unit(spec: &ServiceSpec) -> String {
    let data_env = format!("OFFLINE_MODE_DATA_DIR={}", spec.data_dir.display());
    let config_env = format!("OFFLINE_MODE_CONFIG_DIR={}", spec.config_dir.display());
    format!(
        "[Unit]\n\
         Description=Offline Mode bookmark sync\n\
         Wants=network-online.target\n\
         After=network-online.target\n\
         \n\
         [Service]\n\
         Type=simple\n\
         ExecStart={exe} run\n\
         Environment={data}\n\
         Environment={config}\n\
         Restart=on-failure\n\
         RestartSec=30\n\
         TimeoutStopSec={timeout}\n\
         \n\
         [Install]\n\
         WantedBy=default.target\n",
        exe = quote(&spec.executable),
        data = quote(Path::new(&data_env)),
        config = quote(Path::new(&config_env)),
        timeout = spec.stop_timeout_secs,
    )
}

#[async_trait]
impl ServiceManager for SystemdUserManager {
    fn is_installed(&self) -> bool {
        self.unit_path().is_file()
    }

    async fn install(&self, spec: &ServiceSpec) -> Result<(), ServiceError> {
        tokio::fs::create_dir_all(&self.unit_dir).await?;
        let path = self.unit_path();
        tokio::fs::write(&path, render_unit(spec)).await?;
        tracing::info!(unit = %path.display(), "Wrote systemd unit");

        self.systemctl(&["daemon-reload"]).await?;
        self.systemctl(&["enable", &Self::unit_name()]).await
    }

    async fn start(&self) -> Result<(), ServiceError> {
        self.systemctl(&["start", &Self::unit_name()]).await
    }

    async fn stop(&self) -> Result<(), ServiceError> {
        self.systemctl(&["stop", &Self::unit_name()]).await
    }

    async fn uninstall(&self) -> Result<(), ServiceError> {
        let unit = Self::unit_name();
        // Already-stopped units make `stop` a no-op
        self.systemctl(&["stop", &unit]).await?;
        self.systemctl(&["disable", &unit]).await?;

        match tokio::fs::remove_file(self.unit_path()).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        self.systemctl(&["daemon-reload"]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ServiceSpec {
        ServiceSpec {
            executable: PathBuf::from("/opt/offline mode/bin/offline-mode"),
            data_dir: PathBuf::from("/home/u/.local/share/offline-mode"),
            config_dir: PathBuf::from("/home/u/.config/offline-mode"),
            stop_timeout_secs: 45,
        }
    }

    #[test]
    fn test_unit_file_contents() {
        let unit = render_unit(&spec());
        assert!(unit.contains("ExecStart=\"/opt/offline mode/bin/offline-mode\" run\n"));
        assert!(unit.contains(
            "Environment=\"OFFLINE_MODE_DATA_DIR=/home/u/.local/share/offline-mode\"\n"
        ));
        assert!(unit.contains("Environment=\"OFFLINE_MODE_CONFIG_DIR=/home/u/.config/offline-mode\"\n"));
        assert!(unit.contains("TimeoutStopSec=45\n"));
        assert!(unit.contains("WantedBy=default.target"));
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote(Path::new("a\"b")), "\"a\\\"b\"");
    }

    #[test]
    fn test_unit_path() {
        let manager = SystemdUserManager::new("/units");
        assert_eq!(manager.unit_path(), PathBuf::from("/units/offline-mode.service"));
        assert!(!manager.is_installed());
    }
}
