//! Unix signal bridge: SIGHUP reloads, SIGINT/SIGTERM stop.

use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use super::coordinator::ProxyHandle;

pub async fn watch_signals(handle: ProxyHandle) {
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(err) => {
            error!("could not install SIGHUP handler: {}", err);
            return;
        }
    };
    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(err) => {
            error!("could not install SIGINT handler: {}", err);
            return;
        }
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            error!("could not install SIGTERM handler: {}", err);
            return;
        }
    };

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!("got SIGHUP, reloading config");
                if let Err(err) = handle.reload().await {
                    warn!("reload failed: {}", err);
                }
            }
            _ = interrupt.recv() => {
                info!("got SIGINT, stopping");
                let _ = handle.stop().await;
                return;
            }
            _ = terminate.recv() => {
                info!("got SIGTERM, stopping");
                let _ = handle.stop().await;
                return;
            }
        }
    }
}
