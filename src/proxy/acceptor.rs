//! Accept loop for the RESP listener.
//!
//! There is no dedicated wake-up signal for shutdown: the loop polls with
//! a one-second accept deadline and consults coordinator state, so a stop
//! takes effect within a second.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{info, warn};

use super::addr::Listener;
use super::config::Config;
use super::coordinator::ProxyHandle;
use super::session::Session;
use crate::resp::Conn;

const ACCEPT_DEADLINE: Duration = Duration::from_secs(1);

pub(crate) async fn listening(handle: &ProxyHandle) -> bool {
    handle.state().await.is_starting_or_alive()
}

pub async fn run_acceptor(listener: Listener, handle: ProxyHandle, config: Arc<Config>) {
    while listening(&handle).await {
        let incoming = match timeout(ACCEPT_DEADLINE, listener.accept()).await {
            Err(_) => continue,
            Ok(Err(err)) => {
                warn!("error accepting a client connection: {}", err);
                continue;
            }
            Ok(Ok(incoming)) => incoming,
        };

        let handle = handle.clone();
        let config = config.clone();
        tokio::spawn(async move {
            match incoming.establish().await {
                Ok((stream, peer)) => {
                    let client = Conn::new(stream, peer, 0, config.log_messages);
                    Session::new(client, handle, config.listen.pass.clone())
                        .run()
                        .await;
                }
                Err(err) => info!("could not establish client connection: {}", err),
            }
        });
    }
}
