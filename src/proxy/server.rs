//! Proxy assembly: load config, bind listeners, spawn the tasks.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use super::acceptor::run_acceptor;
use super::admin::run_admin;
use super::config::{Config, ConfigError, ConfigLoader};
use super::coordinator::{Coordinator, ProxyHandle};
use super::raw::{run_raw_proxy, RawRegistry};

pub struct Proxy {
    config: Arc<Config>,
    handle: ProxyHandle,
    coordinator: Option<Coordinator>,
    raw_registry: Arc<RawRegistry>,

    listen_addr: Option<SocketAddr>,
    listen_raw_addr: Option<SocketAddr>,
    admin_addr: Option<SocketAddr>,

    coordinator_task: Option<JoinHandle<()>>,
    aux_tasks: Vec<JoinHandle<()>>,
}

impl Proxy {
    /// Load and validate the startup config. Validation failures here are
    /// fatal: the caller exits non-zero.
    pub async fn new(loader: Arc<dyn ConfigLoader>) -> Result<Proxy, ConfigError> {
        let config = loader.load()?;
        config.prepare().await?;
        let config = Arc::new(config);

        let raw_registry = Arc::new(RawRegistry::new());
        let (coordinator, handle) =
            Coordinator::new(config.clone(), loader, raw_registry.clone());

        Ok(Proxy {
            config,
            handle,
            coordinator: Some(coordinator),
            raw_registry,
            listen_addr: None,
            listen_raw_addr: None,
            admin_addr: None,
            coordinator_task: None,
            aux_tasks: Vec::new(),
        })
    }

    /// Bind every configured listener and spawn the coordinator, acceptor,
    /// raw proxy and admin UI. Bind failures are fatal.
    pub async fn start(&mut self) -> io::Result<()> {
        let Some(coordinator) = self.coordinator.take() else {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "proxy already started",
            ));
        };

        let listener = self.config.listen.listen().await?;
        self.listen_addr = listener.local_addr();
        info!("listening for clients on {}", listener.describe());

        let raw_listener = match self.config.listen_raw.is_configured() {
            true => {
                let raw_listener = self.config.listen_raw.listen().await?;
                self.listen_raw_addr = raw_listener.local_addr();
                info!("raw proxy listening on {}", raw_listener.describe());
                Some(raw_listener)
            }
            false => None,
        };

        let admin_listener = match self.config.admin.is_configured() {
            true => {
                let admin_listener = self.config.admin.listen().await?;
                self.admin_addr = admin_listener.local_addr();
                let proto = if self.config.admin.tls { "https" } else { "http" };
                info!("admin URL: {}://{}/", proto, admin_listener.describe());
                Some(admin_listener)
            }
            false => None,
        };

        self.coordinator_task = Some(tokio::spawn(coordinator.run()));
        self.aux_tasks.push(tokio::spawn(run_acceptor(
            listener,
            self.handle.clone(),
            self.config.clone(),
        )));
        if let Some(raw_listener) = raw_listener {
            self.aux_tasks.push(tokio::spawn(run_raw_proxy(
                raw_listener,
                self.handle.clone(),
                self.raw_registry.clone(),
            )));
        }
        if let Some(admin_listener) = admin_listener {
            self.aux_tasks
                .push(tokio::spawn(run_admin(admin_listener, self.handle.clone())));
        }
        Ok(())
    }

    pub fn handle(&self) -> ProxyHandle {
        self.handle.clone()
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    pub fn listen_raw_addr(&self) -> Option<SocketAddr> {
        self.listen_raw_addr
    }

    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin_addr
    }

    /// Wait for the coordinator to stop, then wind down the listeners.
    pub async fn join(&mut self) {
        if let Some(task) = self.coordinator_task.take() {
            let _ = task.await;
        }
        // Listener loops notice the dead coordinator within a second; no
        // need to wait for that here.
        for task in self.aux_tasks.drain(..) {
            task.abort();
        }
    }

    /// Graceful stop: ask the coordinator to exit and wait for it.
    pub async fn stop(&mut self) {
        let _ = self.handle.stop().await;
        self.join().await;
    }
}
