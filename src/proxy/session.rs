//! Per-client session handler.
//!
//! One task per accepted client. Reads a RESP message, answers locally
//! where the proxy itself is the authority (AUTH handshake, parse errors),
//! and forwards everything else through a coordinator ticket to this
//! session's private uplink connection. The uplink dial is lazy and is
//! redone whenever the config's uplink spec no longer matches the one this
//! session last dialed — replaying AUTH and SELECT so the new server sees
//! the same client context.

use tracing::{debug, info, warn};

use super::addr::AddrSpec;
use super::config::Config;
use super::coordinator::ProxyHandle;
use crate::resp::{
    Conn, Msg, MsgOp, RespError, MSG_INVALID_PASS, MSG_NO_AUTH, MSG_NO_PASSWORD_SET, MSG_OK,
    MSG_PARSE_ERROR,
};

enum PreOutcome {
    /// Forward the message to the uplink.
    Forward,
    /// Answered locally; read the next request.
    Done,
    /// Session is over.
    Close,
}

pub struct Session {
    handle: ProxyHandle,
    client: Conn,
    /// Password required from clients, from the pinned listen endpoint.
    listen_pass: String,
    authenticated: bool,
    db: u64,
    uplink_spec: Option<AddrSpec>,
    uplink: Option<Conn>,
}

impl Session {
    pub fn new(client: Conn, handle: ProxyHandle, listen_pass: String) -> Self {
        Session {
            handle,
            client,
            listen_pass,
            authenticated: false,
            db: 0,
            uplink_spec: None,
            uplink: None,
        }
    }

    pub async fn run(mut self) {
        debug!("handling new client: connection from {}", self.client.peer());

        loop {
            let req = match self.client.read_msg().await {
                Ok(req) => req,
                Err(RespError::Eof) => break,
                Err(err) => {
                    info!("could not read from {}: {}", self.client.peer(), err);
                    break;
                }
            };
            if !self.handle_request(req).await {
                break;
            }
        }

        let Session { client, uplink, .. } = self;
        client.close().await;
        if let Some(uplink) = uplink {
            uplink.close().await;
        }
    }

    /// Returns false when the session should terminate.
    async fn handle_request(&mut self, req: Msg) -> bool {
        match self.preprocess(&req).await {
            PreOutcome::Forward => {}
            PreOutcome::Done => return true,
            PreOutcome::Close => return false,
        }

        let ticket = match self.handle.enter_execution().await {
            Ok(ticket) => ticket,
            Err(_) => return false,
        };
        let result = self.forward(&ticket.config, &req).await;
        // The release is unconditional: errors below must not leak the
        // ticket.
        self.handle.leave_execution().await;

        let reply = match result {
            Ok(reply) => reply,
            Err(err) => {
                warn!("uplink call for {} failed: {}", self.client.peer(), err);
                return false;
            }
        };

        // Track the selected database so a later redial can replay it.
        if req.op() == MsgOp::Select && reply.is_ok() {
            if let Some(db) = req.first_arg_int() {
                self.db = db;
            }
        }

        self.write_to_client(reply.data()).await
    }

    async fn preprocess(&mut self, req: &Msg) -> PreOutcome {
        match req.op() {
            MsgOp::Broken => {
                let _ = self.write_to_client(MSG_PARSE_ERROR).await;
                PreOutcome::Close
            }
            MsgOp::Auth => {
                // AUTH is always answered locally, never forwarded.
                let reply = if self.listen_pass.is_empty() {
                    MSG_NO_PASSWORD_SET
                } else if req.first_arg() == Some(self.listen_pass.as_str()) {
                    self.authenticated = true;
                    MSG_OK
                } else {
                    self.authenticated = false;
                    MSG_INVALID_PASS
                };
                match self.write_to_client(reply).await {
                    true => PreOutcome::Done,
                    false => PreOutcome::Close,
                }
            }
            _ if !self.listen_pass.is_empty() && !self.authenticated => {
                match self.write_to_client(MSG_NO_AUTH).await {
                    true => PreOutcome::Done,
                    false => PreOutcome::Close,
                }
            }
            _ => PreOutcome::Forward,
        }
    }

    /// One uplink round trip, inside the ticketed region.
    async fn forward(&mut self, config: &Config, req: &Msg) -> Result<Msg, RespError> {
        self.ensure_uplink(config).await?;
        let Some(uplink) = self.uplink.as_mut() else {
            return Err(RespError::UnexpectedReply("uplink not connected".into()));
        };
        uplink.write_msg(req).await?;
        uplink.read_msg().await
    }

    /// Dial (or redial) the uplink if this session's connection does not
    /// match the current config. AUTH is re-sent on every redial; SELECT
    /// only when the session left database 0.
    async fn ensure_uplink(&mut self, config: &Config) -> Result<(), RespError> {
        if self.uplink.is_some() && self.uplink_spec.as_ref() == Some(&config.uplink) {
            return Ok(());
        }

        if let Some(old) = self.uplink.take() {
            debug!("{}: uplink changed, redialing", self.client.peer());
            old.close().await;
        }

        let stream = config.uplink.dial().await?;
        let mut conn = Conn::new(
            stream,
            config.uplink.addr.clone(),
            config.read_time_limit_ms,
            config.log_messages,
        );
        if config.uplink.has_pass() {
            conn.authenticate(&config.uplink.pass).await?;
        }
        if self.db != 0 {
            conn.select(self.db).await?;
        }
        self.uplink_spec = Some(config.uplink.clone());
        self.uplink = Some(conn);
        Ok(())
    }

    async fn write_to_client(&mut self, data: &[u8]) -> bool {
        match self.client.write(data).await {
            Ok(()) => true,
            Err(err) => {
                info!("could not write to {}: {}", self.client.peer(), err);
                false
            }
        }
    }
}
