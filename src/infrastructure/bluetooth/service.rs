//! Bluetooth Service Module
//!
//! Application-facing handle to the link. Commands are posted to the
//! supervisor's queue; results come back as [`AppEvent`]s on the channel
//! passed to [`LinkService::spawn`].

use crate::domain::models::{AppEvent, LinkState, PeripheralIdentity};
use crate::infrastructure::bluetooth::radio::{RadioEventSink, RadioStack};
use crate::infrastructure::bluetooth::supervisor::{
    LinkCommand, LinkConfig, LinkInput, LinkSupervisor,
};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

/// The supervisor's input queue. Created first so the radio backend can be
/// handed its sink before the supervisor starts.
pub struct LinkQueue {
    tx: mpsc::UnboundedSender<LinkInput>,
    rx: mpsc::UnboundedReceiver<LinkInput>,
}

impl Default for LinkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    pub fn radio_sink(&self) -> RadioEventSink {
        RadioEventSink::new(self.tx.clone())
    }
}

pub struct LinkService {
    commands: mpsc::UnboundedSender<LinkInput>,
    state: watch::Receiver<LinkState>,
    task: JoinHandle<()>,
}

impl LinkService {
    /// Start the supervisor loop on the current tokio runtime.
    pub fn spawn(
        config: LinkConfig,
        radio: Arc<dyn RadioStack>,
        queue: LinkQueue,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        let (state_tx, state) = watch::channel(LinkState::Idle);
        let LinkQueue { tx, rx } = queue;
        let supervisor = LinkSupervisor::new(config, radio, tx.clone(), event_sender, state_tx);
        let task = tokio::spawn(supervisor.run(rx));

        Self {
            commands: tx,
            state,
            task,
        }
    }

    fn send(&self, command: LinkCommand) -> Result<()> {
        self.commands
            .send(LinkInput::Command(command))
            .map_err(|_| anyhow::anyhow!("Link supervisor is not running"))
    }

    pub fn connect(&self, identity: PeripheralIdentity) -> Result<()> {
        self.send(LinkCommand::Connect(identity))
    }

    pub fn disconnect(&self) -> Result<()> {
        self.send(LinkCommand::Disconnect)
    }

    pub fn start_scan(&self) -> Result<()> {
        self.send(LinkCommand::StartScan)
    }

    pub fn stop_scan(&self) -> Result<()> {
        self.send(LinkCommand::StopScan)
    }

    /// True only once events have been seen flowing on the link
    pub fn is_connected(&self) -> bool {
        *self.state.borrow() == LinkState::Ready
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    /// Disconnect, stop scanning and wait for the supervisor to finish.
    pub async fn shutdown(self) -> Result<()> {
        info!("Shutting down link service");
        // Already stopped if the send fails; joining is still fine
        let _ = self.send(LinkCommand::Shutdown);
        self.task.await?;
        Ok(())
    }
}
