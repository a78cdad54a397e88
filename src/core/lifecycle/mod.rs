use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Running,
    Stopped,
}

#[async_trait]
pub trait LifecycleComponent {
    fn name(&self) -> &'static str;

    async fn on_start(&mut self) -> Result<()> {
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

pub type SharedComponent = Arc<Mutex<dyn LifecycleComponent + Send + Sync>>;

/// Runs process-wide components: start in attach order, stop in reverse.
/// A component that fails to start unwinds the ones already running.
pub struct LifecycleManager {
    state: LifecycleState,
    components: Vec<SharedComponent>,
    started: usize,
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self {
            state: LifecycleState::Idle,
            components: Vec::new(),
            started: 0,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn attach(&mut self, component: SharedComponent) {
        self.components.push(component);
    }

    pub async fn start(&mut self) -> Result<()> {
        for idx in 0..self.components.len() {
            let comp = self.components[idx].clone();
            let mut guard = comp.lock().await;
            let name = guard.name();
            if let Err(e) = guard.on_start().await {
                drop(guard);
                error!(component = name, "Start failed: {}", e);
                self.stop_started().await;
                self.state = LifecycleState::Stopped;
                return Err(e.context(format!("starting {name}")));
            }
            info!(component = name, "Started");
            self.started += 1;
        }
        self.state = LifecycleState::Running;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        if self.state != LifecycleState::Running {
            return Ok(());
        }
        self.stop_started().await;
        self.state = LifecycleState::Stopped;
        Ok(())
    }

    async fn stop_started(&mut self) {
        for comp in self.components[..self.started].iter().rev() {
            let mut guard = comp.lock().await;
            let name = guard.name();
            match guard.on_shutdown().await {
                Ok(()) => info!(component = name, "Stopped"),
                Err(e) => warn!(component = name, "Shutdown error: {}", e),
            }
        }
        self.started = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        name: &'static str,
        events: Arc<std::sync::Mutex<Vec<String>>>,
        fail_start: bool,
        fail_shutdown: bool,
    }

    #[async_trait]
    impl LifecycleComponent for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn on_start(&mut self) -> Result<()> {
            self.events.lock().unwrap().push(format!("start:{}", self.name));
            if self.fail_start {
                anyhow::bail!("port in use");
            }
            Ok(())
        }

        async fn on_shutdown(&mut self) -> Result<()> {
            self.events.lock().unwrap().push(format!("stop:{}", self.name));
            if self.fail_shutdown {
                anyhow::bail!("stuck");
            }
            Ok(())
        }
    }

    fn manager(
        specs: &[(&'static str, bool, bool)],
    ) -> (LifecycleManager, Arc<std::sync::Mutex<Vec<String>>>) {
        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut manager = LifecycleManager::new();
        for &(name, fail_start, fail_shutdown) in specs {
            manager.attach(Arc::new(Mutex::new(Recorder {
                name,
                events: events.clone(),
                fail_start,
                fail_shutdown,
            })));
        }
        (manager, events)
    }

    #[tokio::test]
    async fn components_stop_in_reverse_order_even_after_errors() {
        let (mut manager, events) = manager(&[("api", false, true), ("scheduler", false, false)]);

        manager.start().await.unwrap();
        assert_eq!(manager.state(), LifecycleState::Running);
        manager.shutdown().await.unwrap();
        assert_eq!(manager.state(), LifecycleState::Stopped);
        assert_eq!(
            *events.lock().unwrap(),
            vec!["start:api", "start:scheduler", "stop:scheduler", "stop:api"]
        );

        // a second shutdown is a no-op
        manager.shutdown().await.unwrap();
        assert_eq!(events.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn failed_start_unwinds_started_components() {
        let (mut manager, events) = manager(&[
            ("store", false, false),
            ("api", true, false),
            ("scheduler", false, false),
        ]);

        let err = manager.start().await.unwrap_err();
        assert!(format!("{err:#}").contains("starting api"));
        assert_eq!(manager.state(), LifecycleState::Stopped);
        assert_eq!(
            *events.lock().unwrap(),
            vec!["start:store", "start:api", "stop:store"]
        );
    }
}
