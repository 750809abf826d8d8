//! Host bridge: a single worker drains lifecycle commands in FIFO order and posts
//! results back to the control side, which hands them to the [`Host`].

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::UpdateError;
use crate::manager::UpdateManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    CheckForUpdate,
    DownloadPatch,
    InstallPatch { restart_manually: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Checked { version: u32 },
    Progress { downloaded: u64, total: u64 },
    Downloaded { version: u32 },
    Installed { version: u32 },
    Error { message: String },
}

/// What the embedding application provides.
pub trait Host {
    fn emit(&mut self, event: HostEvent);

    /// Reload the application so the newly installed bundle takes effect.
    fn restart(&mut self);
}

/// Posted from the worker to the control side.
#[derive(Debug)]
enum Notice {
    Event(HostEvent),
    Restart,
    /// One command has finished, successfully or not.
    Done(Command),
}

pub struct UpdateService {
    commands: mpsc::UnboundedSender<Command>,
    notices: mpsc::UnboundedReceiver<Notice>,
    worker: JoinHandle<UpdateManager>,
    in_flight: usize,
}

impl UpdateService {
    /// Move `manager` onto a worker task. Must be called inside a tokio runtime.
    pub fn spawn(manager: UpdateManager) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (notice_tx, notices) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(manager, command_rx, notice_tx));
        Self {
            commands,
            notices,
            worker,
            in_flight: 0,
        }
    }

    pub fn check_for_update(&mut self) {
        self.submit(Command::CheckForUpdate);
    }

    pub fn download_patch(&mut self) {
        self.submit(Command::DownloadPatch);
    }

    pub fn install_patch(&mut self, restart_manually: bool) {
        self.submit(Command::InstallPatch { restart_manually });
    }

    /// Asks the host to reload right away; no worker involved.
    pub fn restart<H: Host>(&self, host: &mut H) {
        host.restart();
    }

    pub fn submit(&mut self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!(?command, "update worker has stopped, command dropped");
            return;
        }
        self.in_flight += 1;
    }

    /// Number of submitted commands whose completion has not been dispatched yet.
    pub fn pending(&self) -> usize {
        self.in_flight
    }

    /// Wait for the next notice from the worker and deliver it to `host`.
    /// Returns `false` once the worker is gone and nothing is left to deliver.
    pub async fn dispatch<H: Host>(&mut self, host: &mut H) -> bool {
        match self.notices.recv().await {
            Some(Notice::Event(event)) => host.emit(event),
            Some(Notice::Restart) => host.restart(),
            Some(Notice::Done(command)) => {
                debug!(?command, "command finished");
                self.in_flight = self.in_flight.saturating_sub(1);
            }
            None => return false,
        }
        true
    }

    /// Dispatch until every submitted command has completed.
    pub async fn drain<H: Host>(&mut self, host: &mut H) {
        while self.in_flight > 0 {
            if !self.dispatch(host).await {
                break;
            }
        }
    }

    /// Finish queued work, deliver what is left, and hand the manager back.
    pub async fn shutdown<H: Host>(mut self, host: &mut H) -> Option<UpdateManager> {
        self.drain(host).await;
        drop(self.commands);
        while let Some(notice) = self.notices.recv().await {
            match notice {
                Notice::Event(event) => host.emit(event),
                Notice::Restart => host.restart(),
                Notice::Done(_) => {}
            }
        }
        match self.worker.await {
            Ok(manager) => Some(manager),
            Err(e) => {
                warn!(error = %e, "update worker panicked");
                None
            }
        }
    }
}

async fn run_worker(
    mut manager: UpdateManager,
    mut commands: mpsc::UnboundedReceiver<Command>,
    notices: mpsc::UnboundedSender<Notice>,
) -> UpdateManager {
    while let Some(command) = commands.recv().await {
        debug!(?command, "running command");
        for notice in execute(&mut manager, command, &notices).await {
            let _ = notices.send(notice);
        }
        let _ = notices.send(Notice::Done(command));
    }
    manager
}

async fn execute(
    manager: &mut UpdateManager,
    command: Command,
    notices: &mpsc::UnboundedSender<Notice>,
) -> Vec<Notice> {
    match command {
        Command::CheckForUpdate => {
            let result = manager.check_for_update().await;
            vec![outcome(result, |version| HostEvent::Checked { version })]
        }
        Command::DownloadPatch => {
            let progress = notices.clone();
            let result = manager
                .download_patch(move |downloaded, total| {
                    let _ = progress.send(Notice::Event(HostEvent::Progress { downloaded, total }));
                })
                .await;
            vec![outcome(result, |version| HostEvent::Downloaded { version })]
        }
        Command::InstallPatch { restart_manually } => match manager.install_patch().await {
            Ok(version) if restart_manually => vec![Notice::Event(HostEvent::Installed { version })],
            Ok(_) => vec![Notice::Restart],
            Err(e) => vec![error_notice(&e)],
        },
    }
}

fn outcome(result: Result<u32, UpdateError>, ok: impl FnOnce(u32) -> HostEvent) -> Notice {
    match result {
        Ok(version) => Notice::Event(ok(version)),
        Err(e) => error_notice(&e),
    }
}

fn error_notice(error: &UpdateError) -> Notice {
    warn!(kind = ?error.kind(), error = %error, "update command failed");
    Notice::Event(HostEvent::Error {
        message: error.to_string(),
    })
}
