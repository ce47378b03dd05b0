//! The coordinator: a single task owning all mutable proxy state.
//!
//! Worker sessions, operators and observers never share locks; they talk
//! to the coordinator over typed channels and it arbitrates between them
//! in one `select!`. Which channels the `select!` observes depends on the
//! current state (branch guards play the role of nil channels):
//!
//! | state     | grants tickets | accepts commands | accepts releases |
//! |-----------|----------------|------------------|------------------|
//! | running   | yes            | yes              | yes              |
//! | pausing   | no             | yes              | yes              |
//! | paused    | no             | yes              | no               |
//! | reloading | no             | yes              | yes              |
//! | stopping  | no             | no               | no               |
//!
//! In `pausing` and `reloading` ticket requests are not rejected, they are
//! simply not observed — the request queue keeps its FIFO order and its
//! length stays an accurate count of waiters. Once `active_requests`
//! drains to zero the coordinator auto-transitions (`pausing` → `paused`;
//! `reloading` commits or abandons the candidate config and returns to
//! `running`).

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use super::config::{Config, ConfigLoader};
use super::raw::RawRegistry;

/// Sizing for the ticket channels. Not an enforced connection cap: it only
/// guarantees enough channel space to keep the waiting-request count
/// observable. Requests beyond it block the sender.
pub const MAX_CONNECTIONS: usize = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyState {
    Stopped,
    Starting,
    Running,
    Pausing,
    Paused,
    Reloading,
    Stopping,
}

impl ProxyState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProxyState::Stopped => "stopped",
            ProxyState::Starting => "starting",
            ProxyState::Running => "running",
            ProxyState::Pausing => "pausing",
            ProxyState::Paused => "paused",
            ProxyState::Reloading => "reloading",
            ProxyState::Stopping => "stopping",
        }
    }

    pub fn is_alive(self) -> bool {
        !matches!(
            self,
            ProxyState::Stopped | ProxyState::Starting | ProxyState::Stopping
        )
    }

    /// Listeners keep accepting in this range; they only wind down once
    /// the proxy is stopping.
    pub fn is_starting_or_alive(self) -> bool {
        !matches!(self, ProxyState::Stopped | ProxyState::Stopping)
    }
}

impl std::fmt::Display for ProxyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy is stopped")]
    Stopped,
    #[error("reload failed: {0}")]
    ReloadFailed(String),
    #[error("reload cancelled")]
    ReloadCancelled,
    #[error("reload already in progress")]
    ReloadPending,
}

/// Grant for exactly one uplink call. Carries the config current at grant
/// time so the session can detect an uplink switch.
pub struct Ticket {
    pub config: Arc<Config>,
}

/// Snapshot of coordinator state, as returned by [`ProxyHandle::info`].
#[derive(Clone, Debug)]
pub struct ProxyInfo {
    pub active_requests: usize,
    pub waiting_requests: usize,
    pub state: ProxyState,
    pub config: Arc<Config>,
    pub raw_connections: usize,
}

/// Serializable projection of [`ProxyInfo`] with passwords masked.
#[derive(Debug, Serialize)]
pub struct ProxyInfoReport {
    pub active_requests: usize,
    pub waiting_requests: usize,
    pub state: u8,
    pub state_str: &'static str,
    pub config: Config,
    pub raw_connections: usize,
}

impl ProxyInfo {
    pub fn sanitized_for_publication(&self) -> ProxyInfoReport {
        ProxyInfoReport {
            active_requests: self.active_requests,
            waiting_requests: self.waiting_requests,
            state: self.state as u8,
            state_str: self.state.as_str(),
            config: self.config.sanitized_for_publication(),
            raw_connections: self.raw_connections,
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Command {
    Pause,
    Unpause,
    Reload,
    Stop,
    TerminateRawConnections,
}

struct CommandCall {
    cmd: Command,
    reply: oneshot::Sender<Result<(), ProxyError>>,
}

/// Client side of the coordinator channels. Cheap to clone; every session,
/// listener and the admin UI hold one.
#[derive(Clone)]
pub struct ProxyHandle {
    request_tx: mpsc::Sender<oneshot::Sender<Ticket>>,
    release_tx: mpsc::Sender<()>,
    info_tx: mpsc::Sender<oneshot::Sender<ProxyInfo>>,
    command_tx: mpsc::Sender<CommandCall>,
}

impl ProxyHandle {
    /// Request a ticket for one uplink call. Blocks until the coordinator
    /// grants one; in any state but `running` that means until traffic is
    /// resumed.
    pub async fn enter_execution(&self) -> Result<Ticket, ProxyError> {
        let (tx, rx) = oneshot::channel();
        self.request_tx
            .send(tx)
            .await
            .map_err(|_| ProxyError::Stopped)?;
        rx.await.map_err(|_| ProxyError::Stopped)
    }

    /// Return a ticket after the uplink call finished (or failed). Must be
    /// called exactly once per granted ticket.
    pub async fn leave_execution(&self) {
        let _ = self.release_tx.send(()).await;
    }

    pub async fn info(&self) -> Result<ProxyInfo, ProxyError> {
        let (tx, rx) = oneshot::channel();
        self.info_tx.send(tx).await.map_err(|_| ProxyError::Stopped)?;
        rx.await.map_err(|_| ProxyError::Stopped)
    }

    /// Current state; a dead coordinator reads as `stopped`.
    pub async fn state(&self) -> ProxyState {
        match self.info().await {
            Ok(info) => info.state,
            Err(_) => ProxyState::Stopped,
        }
    }

    pub async fn pause(&self) -> Result<(), ProxyError> {
        self.command(Command::Pause).await
    }

    /// Pause and poll until all in-flight uplink calls have drained.
    pub async fn pause_and_wait(&self) -> Result<(), ProxyError> {
        self.pause().await?;
        loop {
            if self.info().await?.active_requests == 0 {
                return Ok(());
            }
            sleep(Duration::from_millis(50)).await;
        }
    }

    pub async fn unpause(&self) -> Result<(), ProxyError> {
        self.command(Command::Unpause).await
    }

    /// Ask for a config reload. Returns once the drained reload has been
    /// committed — or with the error that made the coordinator keep the
    /// old config.
    pub async fn reload(&self) -> Result<(), ProxyError> {
        self.command(Command::Reload).await
    }

    pub async fn stop(&self) -> Result<(), ProxyError> {
        self.command(Command::Stop).await
    }

    pub async fn terminate_raw_connections(&self) -> Result<(), ProxyError> {
        self.command(Command::TerminateRawConnections).await
    }

    async fn command(&self, cmd: Command) -> Result<(), ProxyError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(CommandCall { cmd, reply: tx })
            .await
            .map_err(|_| ProxyError::Stopped)?;
        rx.await.map_err(|_| ProxyError::Stopped)?
    }
}

pub struct Coordinator {
    state: ProxyState,
    active_requests: usize,
    config: Arc<Config>,
    loader: Arc<dyn ConfigLoader>,
    raw_connections: Arc<RawRegistry>,

    request_rx: mpsc::Receiver<oneshot::Sender<Ticket>>,
    release_rx: mpsc::Receiver<()>,
    info_rx: mpsc::Receiver<oneshot::Sender<ProxyInfo>>,
    command_rx: mpsc::Receiver<CommandCall>,

    /// Reply channel of the operator waiting for the current reload.
    pending_reload: Option<oneshot::Sender<Result<(), ProxyError>>>,
}

impl Coordinator {
    pub fn new(
        config: Arc<Config>,
        loader: Arc<dyn ConfigLoader>,
        raw_connections: Arc<RawRegistry>,
    ) -> (Coordinator, ProxyHandle) {
        let (request_tx, request_rx) = mpsc::channel(MAX_CONNECTIONS);
        let (release_tx, release_rx) = mpsc::channel(MAX_CONNECTIONS);
        let (info_tx, info_rx) = mpsc::channel(16);
        let (command_tx, command_rx) = mpsc::channel(16);
        let coordinator = Coordinator {
            state: ProxyState::Starting,
            active_requests: 0,
            config,
            loader,
            raw_connections,
            request_rx,
            release_rx,
            info_rx,
            command_rx,
            pending_reload: None,
        };
        let handle = ProxyHandle {
            request_tx,
            release_tx,
            info_tx,
            command_tx,
        };
        (coordinator, handle)
    }

    pub async fn run(mut self) {
        self.state = ProxyState::Running;
        debug!("coordinator running");

        loop {
            // Auto-transitions fire before anything else is observed.
            match self.state {
                ProxyState::Pausing if self.active_requests == 0 => {
                    self.state = ProxyState::Paused;
                    info!("proxy paused");
                    continue;
                }
                ProxyState::Reloading if self.active_requests == 0 => {
                    self.commit_reload().await;
                    self.state = ProxyState::Running;
                    continue;
                }
                ProxyState::Stopping => break,
                _ => {}
            }

            let grants = self.state == ProxyState::Running;
            let releases = matches!(
                self.state,
                ProxyState::Running | ProxyState::Pausing | ProxyState::Reloading
            );

            tokio::select! {
                Some(reply) = self.request_rx.recv(), if grants => {
                    // Increment before the worker can observe the grant:
                    // (active_requests, queue) stays an exact inventory.
                    self.active_requests += 1;
                    let ticket = Ticket { config: self.config.clone() };
                    if reply.send(ticket).is_err() {
                        self.active_requests -= 1;
                    }
                }
                Some(()) = self.release_rx.recv(), if releases => {
                    self.active_requests = self.active_requests.saturating_sub(1);
                }
                Some(reply) = self.info_rx.recv() => {
                    let _ = reply.send(self.info());
                }
                Some(call) = self.command_rx.recv(), if self.state != ProxyState::Stopping => {
                    self.handle_command(call);
                }
                else => break,
            }
        }

        self.state = ProxyState::Stopped;
        info!("coordinator stopped");
    }

    fn info(&self) -> ProxyInfo {
        ProxyInfo {
            active_requests: self.active_requests,
            // The request channel is drained one message at a time, so its
            // queue length is exactly the number of blocked workers.
            waiting_requests: self.request_rx.len(),
            state: self.state,
            config: self.config.clone(),
            raw_connections: self.raw_connections.len(),
        }
    }

    fn handle_command(&mut self, call: CommandCall) {
        debug!("command: {:?} (state: {})", call.cmd, self.state);
        let result = match call.cmd {
            Command::Pause => {
                self.cancel_pending_reload();
                self.state = ProxyState::Pausing;
                Ok(())
            }
            Command::Unpause => {
                // Legal from paused, pausing and reloading; in the last
                // case it cancels the reload and the old config stays.
                self.cancel_pending_reload();
                self.state = ProxyState::Running;
                Ok(())
            }
            Command::Reload => {
                if self.pending_reload.is_some() {
                    let _ = call.reply.send(Err(ProxyError::ReloadPending));
                    return;
                }
                self.pending_reload = Some(call.reply);
                self.state = ProxyState::Reloading;
                return;
            }
            Command::Stop => {
                self.cancel_pending_reload();
                self.state = ProxyState::Stopping;
                Ok(())
            }
            Command::TerminateRawConnections => {
                self.raw_connections.terminate_all();
                Ok(())
            }
        };
        let _ = call.reply.send(result);
    }

    fn cancel_pending_reload(&mut self) {
        if let Some(reply) = self.pending_reload.take() {
            info!("pending reload cancelled");
            let _ = reply.send(Err(ProxyError::ReloadCancelled));
        }
    }

    /// Runs at the drain point of `reloading`. On any failure the old
    /// config stays untouched and the error goes back to the operator.
    async fn commit_reload(&mut self) {
        let result = self.try_reload().await;
        match &result {
            Ok(()) => info!("config reloaded"),
            Err(err) => warn!("keeping old config: {}", err),
        }
        if let Some(reply) = self.pending_reload.take() {
            let _ = reply.send(result);
        }
    }

    async fn try_reload(&mut self) -> Result<(), ProxyError> {
        let new = self
            .loader
            .load()
            .map_err(|e| ProxyError::ReloadFailed(e.to_string()))?;
        new.prepare()
            .await
            .map_err(|e| ProxyError::ReloadFailed(e.to_string()))?;
        self.config
            .validate_switch_to(&new)
            .map_err(|e| ProxyError::ReloadFailed(e.to_string()))?;
        self.config = Arc::new(new);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::addr::AddrSpec;
    use crate::proxy::config::StaticConfigLoader;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    struct Fixture {
        handle: ProxyHandle,
        loader: Arc<StaticConfigLoader>,
        config: Config,
        // Keeps the uplink address connectable for reload validation.
        _uplink: TcpListener,
    }

    async fn start_coordinator() -> Fixture {
        let uplink = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = Config {
            uplink: AddrSpec {
                addr: uplink.local_addr().unwrap().to_string(),
                ..Default::default()
            },
            listen: AddrSpec {
                addr: "127.0.0.1:0".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        let loader = Arc::new(StaticConfigLoader::new(config.clone()));
        let (coordinator, handle) = Coordinator::new(
            Arc::new(config.clone()),
            loader.clone(),
            Arc::new(RawRegistry::new()),
        );
        tokio::spawn(coordinator.run());
        Fixture {
            handle,
            loader,
            config,
            _uplink: uplink,
        }
    }

    async fn assert_blocks<T>(fut: impl std::future::Future<Output = T>) {
        assert!(
            timeout(Duration::from_millis(100), fut).await.is_err(),
            "expected the future to stay blocked"
        );
    }

    #[tokio::test]
    async fn test_grants_tickets_while_running() {
        let fx = start_coordinator().await;
        let ticket = fx.handle.enter_execution().await.unwrap();
        assert_eq!(ticket.config.uplink, fx.config.uplink);
        assert_eq!(fx.handle.info().await.unwrap().active_requests, 1);
        fx.handle.leave_execution().await;
        // Release is asynchronous; poll for the decrement.
        for _ in 0..50 {
            if fx.handle.info().await.unwrap().active_requests == 0 {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("active_requests never drained");
    }

    #[tokio::test]
    async fn test_pause_drains_then_blocks_requests() {
        let fx = start_coordinator().await;
        let _t1 = fx.handle.enter_execution().await.unwrap();
        let _t2 = fx.handle.enter_execution().await.unwrap();

        fx.handle.pause().await.unwrap();
        assert_eq!(fx.handle.state().await, ProxyState::Pausing);

        // A third request must not be granted while pausing.
        assert_blocks(fx.handle.enter_execution()).await;
        let info = fx.handle.info().await.unwrap();
        assert_eq!(info.active_requests, 2);
        assert_eq!(info.waiting_requests, 1);

        // Release both in-flight calls; the coordinator auto-transitions.
        fx.handle.leave_execution().await;
        fx.handle.leave_execution().await;
        for _ in 0..50 {
            if fx.handle.state().await == ProxyState::Paused {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(fx.handle.state().await, ProxyState::Paused);
        assert_eq!(fx.handle.info().await.unwrap().active_requests, 0);

        // Still blocked while paused; unpause lets it through.
        let waiter = tokio::spawn({
            let handle = fx.handle.clone();
            async move { handle.enter_execution().await }
        });
        sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        fx.handle.unpause().await.unwrap();
        let ticket = timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(ticket.is_ok());
    }

    #[tokio::test]
    async fn test_reload_swaps_config_after_drain() {
        let fx = start_coordinator().await;
        let held = fx.handle.enter_execution().await.unwrap();

        let mut new_config = fx.config.clone();
        new_config.read_time_limit_ms = 1234;
        fx.loader.replace(new_config);

        let reloader = tokio::spawn({
            let handle = fx.handle.clone();
            async move { handle.reload().await }
        });
        sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.handle.state().await, ProxyState::Reloading);
        // Reload does not commit while a call is in flight.
        assert!(!reloader.is_finished());

        drop(held);
        fx.handle.leave_execution().await;
        timeout(Duration::from_secs(1), reloader)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let info = fx.handle.info().await.unwrap();
        assert_eq!(info.state, ProxyState::Running);
        assert_eq!(info.config.read_time_limit_ms, 1234);
    }

    #[tokio::test]
    async fn test_reload_failure_keeps_old_config() {
        let fx = start_coordinator().await;

        // Changing the listen endpoint is not allowed on reload.
        let mut new_config = fx.config.clone();
        new_config.listen.addr = "127.0.0.1:9999".into();
        fx.loader.replace(new_config);

        let err = fx.handle.reload().await.unwrap_err();
        assert!(matches!(err, ProxyError::ReloadFailed(_)));

        let info = fx.handle.info().await.unwrap();
        assert_eq!(info.state, ProxyState::Running);
        assert_eq!(*info.config, fx.config);
    }

    #[tokio::test]
    async fn test_unpause_cancels_pending_reload() {
        let fx = start_coordinator().await;
        let held = fx.handle.enter_execution().await.unwrap();

        let mut new_config = fx.config.clone();
        new_config.read_time_limit_ms = 4321;
        fx.loader.replace(new_config);

        let reloader = tokio::spawn({
            let handle = fx.handle.clone();
            async move { handle.reload().await }
        });
        sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.handle.state().await, ProxyState::Reloading);

        fx.handle.unpause().await.unwrap();
        let err = timeout(Duration::from_secs(1), reloader)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ProxyError::ReloadCancelled));

        // Old config still in force once the held ticket is returned.
        drop(held);
        fx.handle.leave_execution().await;
        let info = fx.handle.info().await.unwrap();
        assert_eq!(info.state, ProxyState::Running);
        assert_eq!(info.config.read_time_limit_ms, 0);
    }

    #[tokio::test]
    async fn test_stop_ends_coordinator() {
        let fx = start_coordinator().await;
        fx.handle.stop().await.unwrap();
        for _ in 0..50 {
            if fx.handle.state().await == ProxyState::Stopped {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(fx.handle.state().await, ProxyState::Stopped);
        assert!(matches!(
            fx.handle.enter_execution().await,
            Err(ProxyError::Stopped)
        ));
    }
}
