use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Carries the shutdown signal through every long-lived task: the HTTP
/// server, the pool's crash-monitor loop, and any in-flight back-off
/// timers. Cloning shares the same kill switch.
#[derive(Clone)]
pub struct AppContext {
    killed: Arc<AtomicBool>,
    kill_sender: tokio::sync::broadcast::Sender<()>,
    _kill_receiver: Arc<tokio::sync::broadcast::Receiver<()>>,
}

impl Default for AppContext {
    fn default() -> Self {
        Self::new()
    }
}

impl AppContext {
    pub fn new() -> Self {
        let (kill_sender, kill_receiver) = tokio::sync::broadcast::channel(1);
        Self {
            killed: Arc::new(AtomicBool::new(false)),
            kill_sender,
            _kill_receiver: Arc::new(kill_receiver),
        }
    }

    pub fn get_kill_receiver(&self) -> tokio::sync::broadcast::Receiver<()> {
        self.kill_sender.subscribe()
    }

    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        let _ = self.kill_sender.send(());
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}
