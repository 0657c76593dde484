use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;

/// How long the second direction may keep running after the first one closed.
const HALF_CLOSE_LINGER: Duration = Duration::from_secs(5);
const RELAY_BUFFER: usize = 64 * 1024;

/// Byte counts of a finished relay. `inbound` is client → destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayOutcome {
    pub inbound_bytes: u64,
    pub outbound_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RelayStatus {
    Listening,
    Relaying,
    Finished(RelayOutcome),
    Failed { error: String },
    TimedOut,
}

impl RelayStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RelayStatus::Listening | RelayStatus::Relaying)
    }
}

/// Single-use relay: accepts one connection on a local port and pipes it to
/// `(dest_host, dest_port)` until both sides are done.
pub struct PortForwarder {
    listener: TcpListener,
    dest_host: String,
    dest_port: u16,
}

impl PortForwarder {
    /// `port == 0` lets the OS pick.
    pub async fn bind(bind_addr: &str, port: u16, dest_host: &str, dest_port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind((bind_addr, port)).await?;
        Ok(Self {
            listener,
            dest_host: dest_host.to_string(),
            dest_port,
        })
    }

    pub fn local_port(&self) -> io::Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    pub async fn run(self, status: &watch::Sender<RelayStatus>) -> io::Result<RelayOutcome> {
        let (inbound, peer) = self.listener.accept().await?;
        // Single use: stop listening as soon as the one connection is in.
        drop(self.listener);
        tracing::info!(
            "[port-forward] accepted {} -> {}:{}",
            peer,
            self.dest_host,
            self.dest_port
        );
        let outbound = TcpStream::connect((self.dest_host.as_str(), self.dest_port)).await?;
        let _ = status.send(RelayStatus::Relaying);
        relay(inbound, outbound).await
    }
}

/// Pipes both directions. When one side reaches EOF its peer's write half is shut down,
/// and the other direction gets `HALF_CLOSE_LINGER` to drain.
pub async fn relay(inbound: TcpStream, outbound: TcpStream) -> io::Result<RelayOutcome> {
    let (mut in_read, mut in_write) = inbound.into_split();
    let (mut out_read, mut out_write) = outbound.into_split();
    let up_count = AtomicU64::new(0);
    let down_count = AtomicU64::new(0);

    let upstream = pump(&mut in_read, &mut out_write, &up_count);
    let downstream = pump(&mut out_read, &mut in_write, &down_count);
    tokio::pin!(upstream);
    tokio::pin!(downstream);

    let first = tokio::select! {
        res = &mut upstream => {
            let rest = tokio::time::timeout(HALF_CLOSE_LINGER, &mut downstream).await;
            res.and(rest.unwrap_or(Ok(())))
        }
        res = &mut downstream => {
            let rest = tokio::time::timeout(HALF_CLOSE_LINGER, &mut upstream).await;
            res.and(rest.unwrap_or(Ok(())))
        }
    };
    first?;

    Ok(RelayOutcome {
        inbound_bytes: up_count.load(Ordering::Relaxed),
        outbound_bytes: down_count.load(Ordering::Relaxed),
    })
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, counter: &AtomicU64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
    // Propagate EOF so the peer's read side completes.
    let _ = writer.shutdown().await;
    Ok(())
}

/// Caller's view of a spawned relay.
#[derive(Debug, Clone)]
pub struct ForwardHandle {
    pub id: u64,
    pub port: u16,
    status: watch::Receiver<RelayStatus>,
}

impl ForwardHandle {
    pub fn status(&self) -> RelayStatus {
        self.status.borrow().clone()
    }

    /// Resolves once the relay reached a terminal status.
    pub async fn wait(&mut self) -> RelayStatus {
        loop {
            let current = self.status.borrow_and_update().clone();
            if current.is_terminal() {
                return current;
            }
            if self.status.changed().await.is_err() {
                // Sender dropped without a terminal status: the task was aborted.
                return RelayStatus::Failed {
                    error: "relay task ended without reporting".to_string(),
                };
            }
        }
    }
}

/// Owns every live relay. Each one runs as a task in a `JoinSet` with a bounded lifetime.
pub struct ForwardSupervisor {
    bind_addr: String,
    lifetime: Duration,
    next_id: AtomicU64,
    tasks: Mutex<JoinSet<(u64, RelayStatus)>>,
    /// Relays handed out to clients, keyed by the (ip, port) they were told to connect to.
    advertised: std::sync::Mutex<HashMap<(String, u16), ForwardHandle>>,
}

impl ForwardSupervisor {
    pub fn new(bind_addr: &str, lifetime: Duration) -> Arc<Self> {
        Arc::new(Self {
            bind_addr: bind_addr.to_string(),
            lifetime,
            next_id: AtomicU64::new(1),
            tasks: Mutex::new(JoinSet::new()),
            advertised: std::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Binds a fresh local port and relays its first connection to `(dest_host, dest_port)`.
    pub async fn spawn(&self, dest_host: &str, dest_port: u16) -> io::Result<ForwardHandle> {
        let forwarder = PortForwarder::bind(&self.bind_addr, 0, dest_host, dest_port).await?;
        let port = forwarder.local_port()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(RelayStatus::Listening);
        let lifetime = self.lifetime;
        let dest = format!("{}:{}", dest_host, dest_port);

        tracing::info!(relay_id = id, "[port-forward] listening on {} for {}", port, dest);
        let mut tasks = self.tasks.lock().await;
        // Finished relays are reaped here so the set does not grow unbounded.
        while let Some(done) = tasks.try_join_next() {
            log_joined(done);
        }
        tasks.spawn(async move {
            let status = match tokio::time::timeout(lifetime, forwarder.run(&tx)).await {
                Ok(Ok(outcome)) => {
                    tracing::info!(
                        relay_id = id,
                        inbound = outcome.inbound_bytes,
                        outbound = outcome.outbound_bytes,
                        "[port-forward] relay to {} finished",
                        dest
                    );
                    RelayStatus::Finished(outcome)
                }
                Ok(Err(err)) => {
                    tracing::error!(relay_id = id, error = %err, "[port-forward] relay to {} failed", dest);
                    RelayStatus::Failed { error: err.to_string() }
                }
                Err(_) => {
                    tracing::warn!(relay_id = id, "[port-forward] relay to {} timed out after {:?}", dest, lifetime);
                    RelayStatus::TimedOut
                }
            };
            let _ = tx.send(status.clone());
            (id, status)
        });

        Ok(ForwardHandle { id, port, status: rx })
    }

    /// Remembers that `handle` was published to a client as `server_ip:handle.port`.
    pub fn advertise(&self, server_ip: &str, handle: &ForwardHandle) {
        let mut advertised = self.advertised.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        advertised.retain(|_, h| !h.status().is_terminal());
        advertised.insert((server_ip.to_string(), handle.port), handle.clone());
    }

    /// The relay behind an advertised endpoint, if this process owns it.
    pub fn lookup(&self, server_ip: &str, port: u16) -> Option<ForwardHandle> {
        let advertised = self.advertised.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        advertised.get(&(server_ip.to_string(), port)).cloned()
    }

    pub async fn active(&self) -> usize {
        let mut tasks = self.tasks.lock().await;
        while let Some(done) = tasks.try_join_next() {
            log_joined(done);
        }
        tasks.len()
    }

    /// Aborts every live relay.
    pub async fn shutdown(&self) {
        let mut tasks = self.tasks.lock().await;
        tasks.abort_all();
        while let Some(done) = tasks.join_next().await {
            log_joined(done);
        }
    }
}

fn log_joined(done: Result<(u64, RelayStatus), tokio::task::JoinError>) {
    match done {
        Ok((id, status)) => tracing::debug!(relay_id = id, "[port-forward] reaped relay: {:?}", status),
        Err(err) if err.is_cancelled() => tracing::debug!("[port-forward] relay aborted"),
        Err(err) => tracing::error!(error = %err, "[port-forward] relay task panicked"),
    }
}
