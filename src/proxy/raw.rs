//! Raw pass-through proxy.
//!
//! Byte-pumps a second listener straight to the uplink with no RESP
//! framing — used for replication streams, which the coordinated path
//! cannot carry. Raw sessions sit outside the ticket protocol; the only
//! control the proxy has over them is counting and terminating them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::copy_bidirectional;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::acceptor::listening;
use super::addr::Listener;
use super::coordinator::ProxyHandle;

/// Live raw handlers: a count for the info snapshot and a terminate signal
/// per connection for the `terminate-raw-connections` command.
#[derive(Default)]
pub struct RawRegistry {
    next_id: AtomicU64,
    live: Mutex<HashMap<u64, oneshot::Sender<()>>>,
}

impl RawRegistry {
    pub fn new() -> Self {
        RawRegistry::default()
    }

    pub fn len(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn terminate_all(&self) {
        let drained: Vec<_> = self.live.lock().unwrap().drain().collect();
        info!("terminating {} raw connections", drained.len());
        for (_, terminate) in drained {
            let _ = terminate.send(());
        }
    }

    fn register(&self) -> (u64, oneshot::Receiver<()>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.live.lock().unwrap().insert(id, tx);
        (id, rx)
    }

    fn unregister(&self, id: u64) {
        self.live.lock().unwrap().remove(&id);
    }
}

pub async fn run_raw_proxy(listener: Listener, handle: ProxyHandle, registry: Arc<RawRegistry>) {
    while listening(&handle).await {
        let incoming = match timeout(Duration::from_secs(1), listener.accept()).await {
            Err(_) => continue,
            Ok(Err(err)) => {
                warn!("error accepting a raw connection: {}", err);
                continue;
            }
            Ok(Ok(incoming)) => incoming,
        };

        let handle = handle.clone();
        let registry = registry.clone();
        tokio::spawn(async move {
            let (mut client, peer) = match incoming.establish().await {
                Ok(conn) => conn,
                Err(err) => {
                    info!("could not establish raw connection: {}", err);
                    return;
                }
            };

            // Raw sessions follow the uplink config current at dial time.
            let Ok(proxy_info) = handle.info().await else {
                return;
            };
            let mut uplink = match proxy_info.config.uplink.dial().await {
                Ok(uplink) => uplink,
                Err(err) => {
                    warn!("raw proxy could not dial uplink: {}", err);
                    return;
                }
            };

            let (id, terminate) = registry.register();
            info!("starting raw proxy for {}", peer);
            tokio::select! {
                result = copy_bidirectional(&mut client, &mut uplink) => {
                    if let Err(err) = result {
                        debug!("raw proxy error: {}", err);
                    }
                }
                _ = terminate => {}
            }
            registry.unregister(id);
            info!("closing raw proxy for {}", peer);
        });
    }
}
