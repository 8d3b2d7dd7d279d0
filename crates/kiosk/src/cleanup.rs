//! Periodic reclamation of stale terminal instances.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::instance::InstanceService;

/// Background task that sweeps the registry on a fixed interval, deleting
/// terminal instances whose last state change is older than the configured
/// age. The service's delete path does the actual work, so the scan frees
/// containers, ports, and staged payloads the same way a client delete does.
pub struct CleanupTask {
    handle: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

impl CleanupTask {
    /// Spawn the sweep loop. The first scan runs one full interval after
    /// startup, not immediately.
    pub fn spawn(service: Arc<InstanceService>, interval: Duration, max_age: ChronoDuration) -> Self {
        let (stop, mut stopped) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        debug!("running cleanup scan");
                        let deleted = service.cleanup_stale(max_age).await;
                        if deleted > 0 {
                            info!(deleted, "cleanup scan reclaimed stale instances");
                        }
                    }
                    _ = stopped.changed() => {
                        debug!("cleanup task stopping");
                        return;
                    }
                }
            }
        });

        Self { handle, stop }
    }

    /// Stop the loop and wait for the in-flight scan, if any, to finish.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{CreateInstanceRequest, InstanceError, ServiceConfig};
    use crate::ports::PortAllocator;
    use crate::runtime::{FakeRuntime, RuntimeState};
    use base64::Engine;
    use chrono::Utc;

    fn service(runtime: Arc<FakeRuntime>, data_dir: &std::path::Path) -> Arc<InstanceService> {
        Arc::new(InstanceService::new(
            runtime,
            PortAllocator::new(3390, 3394, 8081, 8085),
            ServiceConfig {
                image: "kiosk-app:latest".to_string(),
                container_prefix: "kiosk-".to_string(),
                max_instances: 4,
                data_dir: data_dir.to_path_buf(),
            },
        ))
    }

    fn request() -> CreateInstanceRequest {
        CreateInstanceRequest {
            payload: base64::engine::general_purpose::STANDARD.encode(b"bits"),
            mods: Vec::new(),
            config: Default::default(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sweeps_stale_instances_on_the_interval() {
        let runtime = Arc::new(FakeRuntime::new());
        let dir = tempfile::tempdir().unwrap();
        let service = service(runtime.clone(), dir.path());

        let instance = service.create(request()).await.unwrap();
        runtime.set_state(instance.container_ref.as_deref().unwrap(), RuntimeState::Exited);
        // Reconcile the exit, then age the record past the threshold.
        service.get(&instance.id).await.unwrap();
        service
            .registry()
            .backdate(&instance.id, Utc::now() - ChronoDuration::hours(48))
            .await;

        let task = CleanupTask::spawn(
            service.clone(),
            Duration::from_secs(60),
            ChronoDuration::hours(24),
        );

        // Paused-clock sleep drives the interval without wall time.
        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;

        assert!(matches!(
            service.get(&instance.id).await,
            Err(InstanceError::NotFound(_))
        ));
        task.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_the_loop() {
        let runtime = Arc::new(FakeRuntime::new());
        let dir = tempfile::tempdir().unwrap();
        let service = service(runtime, dir.path());

        let task = CleanupTask::spawn(
            service,
            Duration::from_secs(60),
            ChronoDuration::hours(24),
        );
        // Must return rather than hang even though no tick has fired yet.
        task.shutdown().await;
    }
}
