use crate::dispatch::JobQueue;
use crate::store::RocksStore;
use crate::waitlist::WaitlistService;
use crate::Result;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Duration;
use tracing::{error, info, warn};

/// Graceful shutdown coordinator
#[derive(Clone)]
pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
    components: Arc<Mutex<Vec<Box<dyn ShutdownComponent + Send + Sync>>>>,
    shutdown_timeout: Duration,
}

/// Trait for components that need graceful shutdown
#[async_trait::async_trait]
pub trait ShutdownComponent {
    async fn shutdown(&self) -> Result<()>;
    fn name(&self) -> &str;
}

impl ShutdownCoordinator {
    pub fn new(shutdown_timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            shutdown_tx,
            components: Arc::new(Mutex::new(Vec::new())),
            shutdown_timeout,
        }
    }

    pub fn with_default_timeout() -> Self {
        Self::new(Duration::from_secs(30))
    }

    /// Register a component for graceful shutdown
    pub async fn register_component(&self, component: Box<dyn ShutdownComponent + Send + Sync>) {
        let mut components = self.components.lock().await;
        info!("Registering component '{}' for graceful shutdown", component.name());
        components.push(component);
    }

    /// Get a shutdown signal receiver
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Trigger graceful shutdown
    pub async fn shutdown(&self) -> Result<()> {
        info!("Initiating graceful shutdown...");

        if let Err(e) = self.shutdown_tx.send(()) {
            warn!("Failed to send shutdown signal: {}", e);
        }

        let mut components = self.components.lock().await;
        let mut shutdown_tasks = Vec::new();

        for component in components.drain(..) {
            shutdown_tasks.push(tokio::spawn(async move {
                let name = component.name().to_string();
                info!("Shutting down component '{}'", name);
                match component.shutdown().await {
                    Ok(()) => info!("Component '{}' shutdown successfully", name),
                    Err(e) => error!("Component '{}' shutdown failed: {}", name, e),
                }
            }));
        }

        let drain = async {
            for task in shutdown_tasks {
                if let Err(e) = task.await {
                    error!("Shutdown task failed: {}", e);
                }
            }
        };

        match tokio::time::timeout(self.shutdown_timeout, drain).await {
            Ok(()) => {
                info!("All components shutdown successfully");
                Ok(())
            }
            Err(_) => {
                error!("Shutdown timeout exceeded, forcing exit");
                Err(crate::LobbyError::InvalidArgument(
                    "Shutdown timeout exceeded".to_string(),
                ))
            }
        }
    }

    /// Wait for shutdown signal
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        let _ = rx.recv().await;
    }
}

/// Job queue shutdown component: refuses new work and stops the workers.
pub struct JobQueueShutdown {
    name: String,
    queue: JobQueue,
}

impl JobQueueShutdown {
    pub fn new(name: &str, queue: JobQueue) -> Self {
        Self {
            name: name.to_string(),
            queue,
        }
    }
}

#[async_trait::async_trait]
impl ShutdownComponent for JobQueueShutdown {
    async fn shutdown(&self) -> Result<()> {
        let pending = self.queue.pending();
        if pending > 0 {
            warn!("closing '{}' with {} jobs still pending", self.name, pending);
        }
        self.queue.close();
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Waitlist shutdown component: stops the expiry loop.
pub struct WaitlistShutdown {
    service: Arc<WaitlistService>,
}

impl WaitlistShutdown {
    pub fn new(service: Arc<WaitlistService>) -> Self {
        Self { service }
    }
}

#[async_trait::async_trait]
impl ShutdownComponent for WaitlistShutdown {
    async fn shutdown(&self) -> Result<()> {
        self.service.stop();
        Ok(())
    }

    fn name(&self) -> &str {
        "waitlist-expiry"
    }
}

/// RocksDB store shutdown component
pub struct StoreFlushShutdown {
    store: Arc<RocksStore>,
}

impl StoreFlushShutdown {
    pub fn new(store: Arc<RocksStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl ShutdownComponent for StoreFlushShutdown {
    async fn shutdown(&self) -> Result<()> {
        info!("Flushing state store...");
        self.store.flush()?;
        info!("State store flushed successfully");
        Ok(())
    }

    fn name(&self) -> &str {
        "state-store"
    }
}

/// Signal handler for graceful shutdown
pub async fn setup_signal_handlers(coordinator: ShutdownCoordinator) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut sigterm = signal(SignalKind::terminate()).expect("Failed to setup SIGTERM handler");
            let mut sigint = signal(SignalKind::interrupt()).expect("Failed to setup SIGINT handler");

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                }
            }
        }

        #[cfg(windows)]
        {
            use tokio::signal::windows::{ctrl_break, ctrl_c};

            let mut ctrl_c = ctrl_c().expect("Failed to setup Ctrl+C handler");
            let mut ctrl_break = ctrl_break().expect("Failed to setup Ctrl+Break handler");

            tokio::select! {
                _ = ctrl_c.recv() => {
                    info!("Received Ctrl+C, initiating graceful shutdown");
                }
                _ = ctrl_break.recv() => {
                    info!("Received Ctrl+Break, initiating graceful shutdown");
                }
            }
        }

        if let Err(e) = coordinator.shutdown().await {
            error!("Graceful shutdown failed: {}", e);
        }
    });
}
