//! Host-side singleton server: one loopback listener, one accept task.
//!
//! Connections are served strictly one after another. The handshake is a
//! few short lines from a trusted local launcher, so there is nothing to gain
//! from concurrency, and serial handling means the accept task is the only
//! place that ever changes server state (marker, listener, running flag).
//! Even [`SingletonServer::stop`] goes through it by sending `si.stop` over
//! loopback.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::net::{TcpListener, TcpSocket};
use tokio::task::JoinHandle;

use solo_core::{
    Identity, MarkerStore, MismatchPolicy, Secret, SingletonConfig, WireEncoding,
};

use crate::client::send_stop;
use crate::error::{io_err, IpcError};
use crate::gate::ActivationGate;
use crate::protocol::{self, Command, LineReader, Reply};

/// Pause after a failed `accept()` so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Why the accept loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerExit {
    /// A valid `si.stop` arrived.
    Stopped,
    /// An activation was rejected; the gate was asked to cede.
    Ceded,
    /// A connection presented the wrong secret.
    Disabled,
}

/// What the accept loop does after one connection.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Stop,
    Ceded,
}

pub(crate) struct ServerContext {
    pub identity: Identity,
    pub port: u16,
    pub secret: Secret,
    pub store: MarkerStore,
    pub gate: Arc<dyn ActivationGate>,
    pub read_timeout: Duration,
    pub on_mismatch: MismatchPolicy,
}

pub struct SingletonServer {
    identity: Identity,
    port: u16,
    secret: Secret,
    encoding: WireEncoding,
    timeout: Duration,
    store: MarkerStore,
    running: Arc<AtomicBool>,
    handle: JoinHandle<ServerExit>,
}

impl SingletonServer {
    /// Bind `127.0.0.1:0`, advertise the port in a marker and start serving.
    ///
    /// A marker that cannot be written is logged and ignored: this process
    /// still becomes host, later launches just will not find it.
    pub async fn start(
        identity: Identity,
        store: MarkerStore,
        gate: Arc<dyn ActivationGate>,
        config: &SingletonConfig,
    ) -> Result<Self, IpcError> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
        let socket = TcpSocket::new_v4().map_err(|e| io_err(addr.to_string(), e))?;
        socket.bind(addr).map_err(|e| io_err(addr.to_string(), e))?;
        let listener = socket
            .listen(config.listen_backlog)
            .map_err(|e| io_err(addr.to_string(), e))?;
        let port = listener
            .local_addr()
            .map_err(|e| io_err(addr.to_string(), e))?
            .port();
        tracing::info!(identity = %identity, port, "singleton server listening");

        let secret = Secret::generate();
        if let Err(err) = store.create(&identity, port, secret) {
            tracing::error!(
                identity = %identity,
                error = %err,
                "cannot write singleton marker, continuing without it"
            );
        }

        let running = Arc::new(AtomicBool::new(true));
        let ctx = ServerContext {
            identity: identity.clone(),
            port,
            secret,
            store: store.clone(),
            gate,
            read_timeout: config.read_timeout(),
            on_mismatch: config.on_secret_mismatch,
        };
        let handle = tokio::spawn(accept_loop(listener, ctx, running.clone()));

        Ok(Self {
            identity,
            port,
            secret,
            encoding: config.encoding,
            timeout: config.response_timeout(),
            store,
            running,
            handle,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// False once the accept loop has ended for any reason.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Shut down by sending `si.stop` to our own port, then wait for the
    /// accept task to finish.
    pub async fn stop(self) -> Result<ServerExit, IpcError> {
        if self.is_running() {
            match send_stop(self.port, self.secret, self.encoding, self.timeout).await {
                Ok(()) => return self.handle.await.map_err(IpcError::Join),
                Err(err) => {
                    tracing::warn!(port = self.port, error = %err, "self-stop failed, aborting accept task");
                }
            }
        }

        self.handle.abort();
        let exit = match self.handle.await {
            Ok(exit) => exit,
            Err(err) if err.is_cancelled() => ServerExit::Stopped,
            Err(err) => return Err(IpcError::Join(err)),
        };
        self.store.remove(&self.identity, self.port);
        Ok(exit)
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: ServerContext,
    running: Arc<AtomicBool>,
) -> ServerExit {
    let exit = loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(error = %err, "singleton accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        tracing::debug!(%peer, "singleton connection accepted");

        let (reader, writer) = stream.into_split();
        match handle_connection(reader, writer, &ctx).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Stop) => {
                ctx.store.remove(&ctx.identity, ctx.port);
                break ServerExit::Stopped;
            }
            Ok(Flow::Ceded) => break ServerExit::Ceded,
            Err(IpcError::SecretMismatch) => match ctx.on_mismatch {
                MismatchPolicy::Shutdown => {
                    ctx.store.remove(&ctx.identity, ctx.port);
                    tracing::error!(
                        identity = %ctx.identity,
                        %peer,
                        "unexpected secret on singleton port, server disabled"
                    );
                    break ServerExit::Disabled;
                }
                MismatchPolicy::DropConnection => {
                    tracing::warn!(%peer, "unexpected secret on singleton port, connection dropped");
                }
            },
            Err(err) => {
                tracing::warn!(%peer, error = %err, "singleton connection dropped");
            }
        }
    };

    drop(listener);
    running.store(false, Ordering::SeqCst);
    tracing::info!(identity = %ctx.identity, port = ctx.port, ?exit, "singleton server stopped");

    if exit == ServerExit::Ceded {
        ctx.gate.cede();
    }
    exit
}

/// Serve one connection to completion.
///
/// Secret mismatch surfaces as [`IpcError::SecretMismatch`] so the loop can
/// apply its policy; every other error only ends this connection.
pub(crate) async fn handle_connection<R, W>(
    reader: R,
    mut writer: W,
    ctx: &ServerContext,
) -> Result<Flow, IpcError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    let selector = tokio::time::timeout(ctx.read_timeout, reader.read_u8())
        .await
        .map_err(|_| IpcError::Timeout("encoding selector"))?
        .map_err(|e| io_err("singleton connection", e))?;
    let encoding = WireEncoding::from_selector(selector).ok_or(IpcError::UnknownEncoding(selector))?;

    let mut lines = LineReader::new(reader, encoding, ctx.read_timeout);
    let candidate = lines
        .next_line()
        .await?
        .ok_or_else(|| IpcError::Protocol("connection closed before secret".to_string()))?;
    if !ctx.secret.matches(&candidate) {
        return Err(IpcError::SecretMismatch);
    }

    let command = lines
        .next_line()
        .await?
        .ok_or_else(|| IpcError::Protocol("connection closed before command".to_string()))?;
    match Command::parse(&command) {
        Command::Stop => {
            tracing::info!(identity = %ctx.identity, "singleton stop requested");
            Ok(Flow::Stop)
        }
        Command::Activate => {
            let request = protocol::read_activation(&mut lines).await?;
            tracing::debug!(arguments = request.arguments.len(), "activation received");

            if ctx.gate.can_accept(&request) {
                let gate = ctx.gate.clone();
                tokio::task::spawn_blocking(move || gate.activate(request)).await?;
                protocol::write_reply(&mut writer, encoding, Reply::Ack).await?;
                tracing::debug!("sent {}", Reply::Ack.as_str());
                Ok(Flow::Continue)
            } else {
                protocol::write_reply(&mut writer, encoding, Reply::Exit).await?;
                tracing::info!(identity = %ctx.identity, "activation rejected, ceding to new launch");
                ctx.store.remove(&ctx.identity, ctx.port);
                Ok(Flow::Ceded)
            }
        }
        Command::Unknown(other) => Err(IpcError::Protocol(format!("unknown command '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use solo_core::ActivationRequest;
    use tempfile::TempDir;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[derive(Default)]
    struct Recorder {
        accept: bool,
        activations: Mutex<Vec<ActivationRequest>>,
    }

    impl ActivationGate for Recorder {
        fn can_accept(&self, _request: &ActivationRequest) -> bool {
            self.accept
        }

        fn activate(&self, request: ActivationRequest) {
            self.activations.lock().expect("lock").push(request);
        }

        fn cede(&self) {}
    }

    fn context(home: &TempDir, gate: Arc<Recorder>) -> ServerContext {
        let store = MarkerStore::new(home.path().join("singleton"));
        let identity = Identity::new("U1").expect("identity");
        store
            .create(&identity, 54321, Secret::from(123_456_789))
            .expect("marker");
        ServerContext {
            identity,
            port: 54321,
            secret: Secret::from(123_456_789),
            store,
            gate,
            read_timeout: Duration::from_secs(2),
            on_mismatch: MismatchPolicy::Shutdown,
        }
    }

    async fn exchange(ctx: &ServerContext, payload: &[u8]) -> (Result<Flow, IpcError>, String) {
        let (client, server) = duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let (mut client_read, mut client_write) = tokio::io::split(client);

        client_write.write_all(payload).await.expect("write");
        client_write.shutdown().await.expect("shutdown");

        let flow = handle_connection(server_read, server_write, ctx).await;
        let mut reply = Vec::new();
        client_read.read_to_end(&mut reply).await.expect("read");
        (flow, String::from_utf8(reply).expect("utf8"))
    }

    #[tokio::test]
    async fn accepted_activation_is_forwarded_then_acked() {
        let home = TempDir::new().expect("home");
        let gate = Arc::new(Recorder {
            accept: true,
            ..Default::default()
        });
        let ctx = context(&home, gate.clone());

        let (flow, reply) = exchange(
            &ctx,
            b"\x01123456789\nsi.init\ndicom:get -l foo.dcm\nsi.EOF\n",
        )
        .await;

        assert_eq!(flow.expect("flow"), Flow::Continue);
        assert_eq!(reply, "si.ack\n");
        let seen = gate.activations.lock().expect("lock");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].arguments, vec!["dicom:get -l foo.dcm"]);
        assert!(ctx.store.exists(&ctx.identity, ctx.port));
    }

    #[tokio::test]
    async fn rejected_activation_replies_exit_and_removes_marker() {
        let home = TempDir::new().expect("home");
        let gate = Arc::new(Recorder::default());
        let ctx = context(&home, gate.clone());

        let (flow, reply) = exchange(&ctx, b"\x01123456789\nsi.init\nsi.EOF\n").await;

        assert_eq!(flow.expect("flow"), Flow::Ceded);
        assert_eq!(reply, "si.exit\n");
        assert!(gate.activations.lock().expect("lock").is_empty());
        assert!(!ctx.store.exists(&ctx.identity, ctx.port));
    }

    #[tokio::test]
    async fn wrong_secret_gets_no_reply() {
        let home = TempDir::new().expect("home");
        let ctx = context(&home, Arc::new(Recorder::default()));

        let (flow, reply) = exchange(&ctx, b"\x01999\nsi.init\nsi.EOF\n").await;

        assert!(matches!(flow, Err(IpcError::SecretMismatch)));
        assert!(reply.is_empty());
    }

    #[tokio::test]
    async fn unknown_encoding_aborts_connection() {
        let home = TempDir::new().expect("home");
        let ctx = context(&home, Arc::new(Recorder::default()));

        let (flow, reply) = exchange(&ctx, b"\x07123456789\nsi.stop\n").await;
        assert!(matches!(flow, Err(IpcError::UnknownEncoding(7))));
        assert!(reply.is_empty());
    }

    #[tokio::test]
    async fn stop_command_ends_the_loop() {
        let home = TempDir::new().expect("home");
        let ctx = context(&home, Arc::new(Recorder::default()));

        let (flow, _) = exchange(&ctx, b"\x01123456789\nsi.stop\n").await;
        assert_eq!(flow.expect("flow"), Flow::Stop);
    }

    #[tokio::test]
    async fn utf16_activation_gets_utf16_reply() {
        let home = TempDir::new().expect("home");
        let gate = Arc::new(Recorder {
            accept: true,
            ..Default::default()
        });
        let ctx = context(&home, gate.clone());

        let request = ActivationRequest::new(vec!["ünïcode".into()]);
        let payload = protocol::encode_activation(
            WireEncoding::Utf16le,
            Secret::from(123_456_789),
            &request,
        )
        .expect("encode");

        let (client, server) = duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let (mut client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(&payload).await.expect("write");

        let flow = handle_connection(server_read, server_write, &ctx).await;
        assert_eq!(flow.expect("flow"), Flow::Continue);

        let mut expected = Vec::new();
        protocol::encode_line(WireEncoding::Utf16le, "si.ack", &mut expected);
        let mut reply = vec![0u8; expected.len()];
        client_read.read_exact(&mut reply).await.expect("reply");
        assert_eq!(reply, expected);
        assert_eq!(gate.activations.lock().expect("lock")[0].arguments, vec!["ünïcode"]);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_client_hits_read_deadline() {
        let home = TempDir::new().expect("home");
        let ctx = context(&home, Arc::new(Recorder::default()));

        let (_client, server) = duplex(1024);
        let (server_read, server_write) = tokio::io::split(server);
        let flow = handle_connection(server_read, server_write, &ctx).await;
        assert!(matches!(flow, Err(IpcError::Timeout(_))));
    }
}
