//! One scheduled run: lock, eligibility, reconcile, release

use std::net::Ipv4Addr;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use pk_core::config::PortalConfig;
use pk_core::lockfile::{InstanceLock, LockAcquisition, ReleaseOutcome};
use pk_core::network::{self, Eligibility};
use pk_core::traits::PortalClient;
use pk_core::PkError;

use crate::reconciler::{Credentials, ReconcileReport, SessionReconciler, Timings};

/// How a run ended without a fault
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Another live process holds the lock
    LockHeld(u32),
    /// No local address is on the allow-list
    Ineligible,
    /// The reconciler reached a terminal state
    Reconciled(ReconcileReport),
    /// A termination signal arrived mid-run
    Interrupted,
}

/// Failures that end a run with a non-zero exit
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Core(#[from] PkError),

    /// Something panicked during the run
    #[error("Unhandled fault: {0}")]
    Fault(String),
}

/// Inputs of a run
pub struct Run<'a> {
    pub config: &'a PortalConfig,
    pub lock_path: &'a Path,
    pub owner: u32,
    pub timings: Timings,
}

impl<'a> Run<'a> {
    pub fn new(config: &'a PortalConfig, lock_path: &'a Path) -> Self {
        Self {
            config,
            lock_path,
            owner: std::process::id(),
            timings: Timings::FIXED,
        }
    }

    /// Execute the run
    ///
    /// `local_addrs` is only consulted once the lock is held, and `connect`
    /// only once the host is known to be eligible. The lock is released on
    /// every path out of this function.
    pub async fn execute<C, A, F>(
        &self,
        local_addrs: A,
        connect: F,
        shutdown: CancellationToken,
    ) -> Result<RunOutcome, RunError>
    where
        C: PortalClient + 'static,
        A: FnOnce() -> Vec<Ipv4Addr>,
        F: FnOnce(&PortalConfig) -> Result<C, pk_core::PortalError>,
    {
        let lock = match InstanceLock::acquire(self.lock_path, self.owner).map_err(PkError::from)? {
            LockAcquisition::Acquired(lock) => lock,
            LockAcquisition::AlreadyHeld(pid) => {
                tracing::info!("Another run is in progress (PID {}) -> skipping", pid);
                return Ok(RunOutcome::LockHeld(pid));
            }
        };
        tracing::debug!("Holding {}", lock.path().display());

        let outcome = self.locked(local_addrs, connect, shutdown).await;

        match lock.release() {
            Ok(ReleaseOutcome::Removed) => tracing::info!("Lock released by PID {}", self.owner),
            Ok(other) => tracing::warn!("Lock not removed on release: {:?}", other),
            Err(e) => tracing::warn!("Failed to release lock: {}", e),
        }

        outcome
    }

    async fn locked<C, A, F>(
        &self,
        local_addrs: A,
        connect: F,
        shutdown: CancellationToken,
    ) -> Result<RunOutcome, RunError>
    where
        C: PortalClient + 'static,
        A: FnOnce() -> Vec<Ipv4Addr>,
        F: FnOnce(&PortalConfig) -> Result<C, pk_core::PortalError>,
    {
        let addrs = contain(local_addrs)?;
        tracing::debug!("Local IPv4 addresses: {:?}", addrs);

        match network::evaluate(&self.config.allowed_networks, &addrs) {
            Eligibility::Eligible { address, pattern } => {
                tracing::info!("Address {} matches allowed network {}", address, pattern);
            }
            Eligibility::Ineligible { addresses } => {
                tracing::info!(
                    "Not on an allowed network ({:?} vs {}) -> exiting",
                    addresses,
                    self.config.allowed_networks_raw
                );
                return Ok(RunOutcome::Ineligible);
            }
        }

        let client = Arc::new(contain(|| connect(self.config))?.map_err(PkError::from)?);
        let reconciler = SessionReconciler::new(
            client,
            Credentials {
                username: self.config.username.clone(),
                password: self.config.password.clone(),
            },
        )
        .with_timings(self.timings);

        let mut task = tokio::spawn(async move { reconciler.run().await });

        tokio::select! {
            joined = &mut task => match joined {
                Ok(report) => Ok(RunOutcome::Reconciled(report)),
                Err(e) if e.is_panic() => Err(RunError::Fault(panic_message(e.into_panic()))),
                Err(e) => Err(RunError::Fault(e.to_string())),
            },
            _ = shutdown.cancelled() => {
                task.abort();
                tracing::info!("Termination requested, abandoning run");
                Ok(RunOutcome::Interrupted)
            }
        }
    }
}

/// Run a synchronous step, turning a panic into [`RunError::Fault`]
fn contain<T>(step: impl FnOnce() -> T) -> Result<T, RunError> {
    std::panic::catch_unwind(AssertUnwindSafe(step))
        .map_err(|payload| RunError::Fault(panic_message(payload)))
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pk_core::config::PortalSettings;
    use pk_core::traits::NavigationWatch;
    use pk_core::PortalError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::sync::watch;

    /// Portal that reports the account as logged in, or panics when asked to
    struct StaticPortal {
        panics: bool,
        fetches: Arc<AtomicUsize>,
        navigations: watch::Sender<u64>,
    }

    #[async_trait]
    impl PortalClient for StaticPortal {
        async fn fetch_page(&self, _path: &str) -> Result<String, PortalError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.panics {
                panic!("portal exploded");
            }
            Ok("Welcome alice".to_string())
        }

        async fn wait_for_fields(&self, _names: &[&str]) -> Result<(), PortalError> {
            Ok(())
        }

        async fn submit_form(&self, _fields: Vec<(String, String)>) -> Result<(), PortalError> {
            Ok(())
        }

        fn watch_navigation(&self) -> NavigationWatch {
            NavigationWatch::new(self.navigations.subscribe())
        }

        async fn page_content(&self) -> Result<String, PortalError> {
            Ok(String::new())
        }
    }

    fn config(allowed: &str) -> PortalConfig {
        PortalSettings {
            username: Some("alice".to_string()),
            password: Some("pw".to_string()),
            base_url: Some("http://portal.test".to_string()),
            allowed_networks: Some(allowed.to_string()),
            ..Default::default()
        }
        .validate()
        .unwrap()
    }

    fn portal(panics: bool, fetches: &Arc<AtomicUsize>) -> StaticPortal {
        StaticPortal {
            panics,
            fetches: Arc::clone(fetches),
            navigations: watch::channel(0).0,
        }
    }

    #[tokio::test]
    async fn test_eligible_run_reconciles_and_releases() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("run.lock");
        let config = config("10.0.0.0/24");
        let fetches = Arc::new(AtomicUsize::new(0));

        let outcome = Run::new(&config, &lock_path)
            .execute(
                || vec!["10.0.0.55".parse().unwrap()],
                |_| Ok(portal(false, &fetches)),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        match outcome {
            RunOutcome::Reconciled(report) => assert!(report.outcome.is_authenticated()),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert!(!lock_path.exists());
    }

    #[tokio::test]
    async fn test_ineligible_run_never_connects() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("run.lock");
        let config = config("10.0.0.0/24");

        let outcome = Run::new(&config, &lock_path)
            .execute(
                || vec!["10.0.1.1".parse().unwrap()],
                |_| -> Result<StaticPortal, PortalError> { panic!("must not connect") },
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::Ineligible);
        assert!(!lock_path.exists());
    }

    #[tokio::test]
    async fn test_held_lock_skips_without_touching_it() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("run.lock");
        let holder = std::process::id();
        std::fs::write(&lock_path, holder.to_string()).unwrap();
        let config = config("*");

        let mut run = Run::new(&config, &lock_path);
        run.owner = holder.wrapping_add(1);
        let outcome = run
            .execute(
                || -> Vec<Ipv4Addr> { panic!("must not inspect the network") },
                |_| -> Result<StaticPortal, PortalError> { panic!("must not connect") },
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::LockHeld(holder));
        assert_eq!(std::fs::read_to_string(&lock_path).unwrap(), holder.to_string());
    }

    #[tokio::test]
    async fn test_panic_is_fault_and_lock_released() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("run.lock");
        let config = config("10.0.0.0/8");
        let fetches = Arc::new(AtomicUsize::new(0));

        let result = Run::new(&config, &lock_path)
            .execute(
                || vec!["10.1.2.3".parse().unwrap()],
                |_| Ok(portal(true, &fetches)),
                CancellationToken::new(),
            )
            .await;

        match result {
            Err(RunError::Fault(message)) => assert!(message.contains("portal exploded")),
            other => panic!("expected fault, got {:?}", other),
        }
        assert!(!lock_path.exists());
    }

    #[tokio::test]
    async fn test_panicking_address_lookup_is_fault() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("run.lock");
        let config = config("10.0.0.0/8");

        let result = Run::new(&config, &lock_path)
            .execute(
                || -> Vec<Ipv4Addr> { panic!("no interfaces") },
                |_| -> Result<StaticPortal, PortalError> { panic!("must not connect") },
                CancellationToken::new(),
            )
            .await;

        match result {
            Err(RunError::Fault(message)) => assert_eq!(message, "no interfaces"),
            other => panic!("expected fault, got {:?}", other),
        }
        assert!(!lock_path.exists());
    }

    #[tokio::test]
    async fn test_panicking_connect_is_fault() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("run.lock");
        let config = config("10.0.0.0/8");

        let result = Run::new(&config, &lock_path)
            .execute(
                || vec!["10.1.2.3".parse().unwrap()],
                |_| -> Result<StaticPortal, PortalError> { panic!("tls backend missing") },
                CancellationToken::new(),
            )
            .await;

        match result {
            Err(RunError::Fault(message)) => assert!(message.contains("tls backend missing")),
            other => panic!("expected fault, got {:?}", other),
        }
        assert!(!lock_path.exists());
    }

    #[tokio::test]
    async fn test_cancelled_run_releases_lock() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join("run.lock");
        let config = config("10.0.0.0/8");
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        struct HangingPortal(watch::Sender<u64>);

        #[async_trait]
        impl PortalClient for HangingPortal {
            async fn fetch_page(&self, _path: &str) -> Result<String, PortalError> {
                std::future::pending().await
            }
            async fn wait_for_fields(&self, _names: &[&str]) -> Result<(), PortalError> {
                Ok(())
            }
            async fn submit_form(&self, _fields: Vec<(String, String)>) -> Result<(), PortalError> {
                Ok(())
            }
            fn watch_navigation(&self) -> NavigationWatch {
                NavigationWatch::new(self.0.subscribe())
            }
            async fn page_content(&self) -> Result<String, PortalError> {
                Ok(String::new())
            }
        }

        let outcome = Run::new(&config, &lock_path)
            .execute(
                || vec!["10.1.2.3".parse().unwrap()],
                |_| Ok(HangingPortal(watch::channel(0).0)),
                shutdown,
            )
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::Interrupted);
        assert!(!lock_path.exists());
    }
}
