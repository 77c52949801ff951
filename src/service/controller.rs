//! `install | start | stop | remove` as plain commands over a
//! [`ServiceManager`] and the status file.

use chrono::Utc;

use super::{ServiceError, ServiceManager, ServiceSpec, ServiceStatus, StatusFile};

pub struct ServiceController {
    manager: Box<dyn ServiceManager>,
    status: StatusFile,
}

impl ServiceController {
    pub fn new(manager: Box<dyn ServiceManager>, status: StatusFile) -> Self {
        Self { manager, status }
    }

    /// Live status, `None` if the service is not running or its heartbeat
    /// is stale.
    pub fn live_status(&self) -> Option<ServiceStatus> {
        self.status.read().filter(|s| s.is_live(Utc::now()))
    }

    pub fn is_installed(&self) -> bool {
        self.manager.is_installed()
    }

    pub async fn install(&self, spec: &ServiceSpec) -> Result<(), ServiceError> {
        self.manager.install(spec).await?;
        tracing::info!("Service installed");
        Ok(())
    }

    pub async fn start(&self) -> Result<(), ServiceError> {
        if !self.manager.is_installed() {
            return Err(ServiceError::NotInstalled);
        }
        self.manager.start().await?;
        tracing::info!("Service started");
        Ok(())
    }

    /// Mark the stop request, then ask the manager to stop the process.
    ///
    /// Without an installed manager the flag alone stops a live daemon (for
    /// example one started with `debug`).
    pub async fn stop(&self) -> Result<(), ServiceError> {
        let flagged = self.live_status().is_some() && self.status.request_stop()?;

        if self.manager.is_installed() {
            self.manager.stop().await?;
        } else if !flagged {
            return Err(ServiceError::NotInstalled);
        }
        tracing::info!(flagged, "Service stop requested");
        Ok(())
    }

    /// Unregister the service. Refused while a cycle runs without a prior
    /// `stop`.
    pub async fn remove(&self) -> Result<(), ServiceError> {
        if let Some(status) = self.status.read() {
            if status.is_busy(Utc::now()) {
                return Err(ServiceError::Busy);
            }
        }
        if !self.manager.is_installed() {
            return Err(ServiceError::NotInstalled);
        }
        self.manager.uninstall().await?;
        tracing::info!("Service removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServiceState;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeManager {
        installed: AtomicBool,
        calls: Mutex<Vec<&'static str>>,
    }

    impl FakeManager {
        fn record(&self, call: &'static str) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl ServiceManager for Arc<FakeManager> {
        fn is_installed(&self) -> bool {
            self.installed.load(Ordering::SeqCst)
        }

        async fn install(&self, _spec: &ServiceSpec) -> Result<(), ServiceError> {
            self.record("install");
            self.installed.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn start(&self) -> Result<(), ServiceError> {
            self.record("start");
            Ok(())
        }

        async fn stop(&self) -> Result<(), ServiceError> {
            self.record("stop");
            Ok(())
        }

        async fn uninstall(&self) -> Result<(), ServiceError> {
            self.record("uninstall");
            self.installed.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        manager: Arc<FakeManager>,
        status: StatusFile,
        controller: ServiceController,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(FakeManager::default());
        let status = StatusFile::new(dir.path().join("service.json"));
        let controller = ServiceController::new(Box::new(manager.clone()), status.clone());
        Fixture {
            _dir: dir,
            manager,
            status,
            controller,
        }
    }

    fn spec() -> ServiceSpec {
        ServiceSpec {
            executable: PathBuf::from("/bin/offline-mode"),
            data_dir: PathBuf::from("/data"),
            config_dir: PathBuf::from("/config"),
            stop_timeout_secs: 40,
        }
    }

    fn publish_running(status: &StatusFile) {
        status
            .publish(std::process::id(), ServiceState::Running, Utc::now())
            .unwrap();
    }

    #[tokio::test]
    async fn test_start_requires_install() {
        let f = fixture();
        assert!(matches!(f.controller.start().await, Err(ServiceError::NotInstalled)));

        f.controller.install(&spec()).await.unwrap();
        f.controller.start().await.unwrap();
        assert_eq!(*f.manager.calls.lock().unwrap(), vec!["install", "start"]);
    }

    #[tokio::test]
    async fn test_remove_while_running_is_busy() {
        let f = fixture();
        f.controller.install(&spec()).await.unwrap();
        publish_running(&f.status);

        assert!(matches!(f.controller.remove().await, Err(ServiceError::Busy)));
        assert!(f.manager.is_installed());
    }

    #[tokio::test]
    async fn test_remove_after_stop_succeeds() {
        let f = fixture();
        f.controller.install(&spec()).await.unwrap();
        publish_running(&f.status);

        f.controller.stop().await.unwrap();
        assert!(f.status.read().unwrap().stop_requested);

        f.controller.remove().await.unwrap();
        assert!(!f.manager.is_installed());
        assert_eq!(
            *f.manager.calls.lock().unwrap(),
            vec!["install", "stop", "uninstall"]
        );
    }

    #[tokio::test]
    async fn test_remove_with_stale_running_status() {
        let f = fixture();
        f.controller.install(&spec()).await.unwrap();
        f.status
            .publish(1, ServiceState::Running, Utc::now() - chrono::Duration::minutes(10))
            .unwrap();

        f.controller.remove().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_without_install_flags_live_daemon() {
        let f = fixture();
        assert!(matches!(f.controller.stop().await, Err(ServiceError::NotInstalled)));

        publish_running(&f.status);
        f.controller.stop().await.unwrap();
        assert!(f.status.read().unwrap().stop_requested);
        assert!(f.manager.calls.lock().unwrap().is_empty());
    }
}
