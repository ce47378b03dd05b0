//! Shared test helpers: a fake Redis server and proxy fixtures.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use redis_proxy::proxy::{AddrSpec, Config, Proxy, StaticConfigLoader};
use redis_proxy::resp::{Conn, IoStream, Msg, MsgOp};

/// Minimal Redis-like server. Replies `+OK` to AUTH and SELECT, and its
/// own name (as a bulk string) to everything else, recording every
/// request it sees.
pub struct FakeRedis {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<Msg>>>,
    task: JoinHandle<()>,
}

impl FakeRedis {
    pub async fn start(name: &'static str) -> FakeRedis {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let task = tokio::spawn({
            let requests = requests.clone();
            async move {
                loop {
                    let Ok((stream, peer)) = listener.accept().await else {
                        break;
                    };
                    let requests = requests.clone();
                    tokio::spawn(async move {
                        let stream: IoStream = Box::new(stream);
                        let mut conn = Conn::new(stream, peer.to_string(), 0, false);
                        loop {
                            let Ok(req) = conn.read_msg().await else {
                                break;
                            };
                            let reply = match req.op() {
                                MsgOp::Auth | MsgOp::Select => b"+OK\r\n".to_vec(),
                                _ => format!("${}\r\n{}\r\n", name.len(), name).into_bytes(),
                            };
                            requests.lock().unwrap().push(req);
                            if conn.write(&reply).await.is_err() {
                                break;
                            }
                        }
                    });
                }
            }
        });

        FakeRedis {
            addr,
            requests,
            task,
        }
    }

    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    pub fn req_cnt(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<Msg> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for FakeRedis {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Config pointing at the given uplink, listening on an ephemeral port.
pub fn test_config(uplink_addr: &str) -> Config {
    Config {
        uplink: AddrSpec {
            addr: uplink_addr.to_string(),
            ..Default::default()
        },
        listen: AddrSpec {
            addr: "127.0.0.1:0".into(),
            ..Default::default()
        },
        read_time_limit_ms: 2000,
        ..Default::default()
    }
}

pub async fn start_proxy(loader: Arc<StaticConfigLoader>) -> Proxy {
    let mut proxy = Proxy::new(loader).await.expect("config should be valid");
    proxy.start().await.expect("proxy should bind and start");
    proxy
}

/// Client connection to the proxy's RESP listener, with a read deadline so
/// a misbehaving proxy fails the test instead of hanging it.
pub async fn connect_client(proxy: &Proxy) -> Conn {
    let addr = proxy.listen_addr().expect("proxy should expose its address");
    let stream = TcpStream::connect(addr).await.unwrap();
    let stream: IoStream = Box::new(stream);
    Conn::new(stream, "test-client".into(), 2000, false)
}
