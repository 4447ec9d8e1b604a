//! TCP transport on the tokio runtime. Socket I/O runs as tokio tasks; every
//! inbound event is handed to the session, which moves it onto the owning
//! worker thread.

use std::{
    io,
    net::SocketAddr,
    sync::{Arc, Weak},
};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    runtime::Handle,
    select,
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info};

use super::{Acceptor, Channel, ConnectCallback, Transport};
use crate::session::Session;

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

const READ_CAPACITY: usize = 4 * 1024;

// -----------------------------------------------------------------------------
// ----- TcpTransport ----------------------------------------------------------

pub struct TcpTransport {
    runtime: Handle,
    listeners: DashMap<SocketAddr, JoinHandle<()>>,
}

impl TcpTransport {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            listeners: DashMap::new(),
        }
    }
}

impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn bind(&self, addr: SocketAddr, acceptor: Acceptor) -> io::Result<SocketAddr> {
        let std_listener = std::net::TcpListener::bind(addr)?;
        std_listener.set_nonblocking(true)?;
        let local = std_listener.local_addr()?;

        let listener = {
            let _guard = self.runtime.enter();
            TcpListener::from_std(std_listener)?
        };

        let runtime = self.runtime.clone();
        let task = self.runtime.spawn(async move {
            info!("tcp listening on {local}");
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(v) => v,
                    Err(e) => {
                        error!("accept error on {local}: {e}");
                        continue;
                    }
                };

                let _ = stream.set_nodelay(true);

                match TcpChannel::new(stream, runtime.clone()) {
                    Ok(channel) => acceptor(Arc::new(channel)),
                    Err(e) => error!("dropping connection from {peer}: {e}"),
                }
            }
        });

        self.listeners.insert(local, task);
        Ok(local)
    }

    fn unbind(&self, addr: SocketAddr) -> io::Result<()> {
        let (_, task) = self.listeners.remove(&addr).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("{addr} not bound"))
        })?;
        task.abort();
        info!("tcp stopped listening on {addr}");
        Ok(())
    }

    fn connect(&self, addr: SocketAddr, done: ConnectCallback) {
        let runtime = self.runtime.clone();
        self.runtime.spawn(async move {
            let result = match TcpStream::connect(addr).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    TcpChannel::new(stream, runtime)
                        .map(|channel| Arc::new(channel) as Arc<dyn Channel>)
                }
                Err(e) => Err(e),
            };
            done(result);
        });
    }
}

// -----------------------------------------------------------------------------
// ----- TcpChannel ------------------------------------------------------------

pub struct TcpChannel {
    local: SocketAddr,
    remote: SocketAddr,
    runtime: Handle,
    reader: Arc<tokio::sync::Mutex<OwnedReadHalf>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    readable: watch::Sender<bool>,
}

impl TcpChannel {
    pub fn new(stream: TcpStream, runtime: Handle) -> io::Result<Self> {
        let local = stream.local_addr()?;
        let remote = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();

        let (writer_tx, writer_rx) = mpsc::unbounded_channel::<Bytes>();
        spawn_writer_task(&runtime, writer, writer_rx);

        let (readable, _) = watch::channel(true);

        Ok(Self {
            local,
            remote,
            runtime,
            reader: Arc::new(tokio::sync::Mutex::new(reader)),
            read_task: Mutex::new(None),
            writer: Mutex::new(Some(writer_tx)),
            readable,
        })
    }

    fn stop_reading(&self) {
        if let Some(task) = self.read_task.lock().take() {
            task.abort();
        }
    }
}

impl Channel for TcpChannel {
    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    fn register(&self, session: Arc<Session>) {
        self.stop_reading();

        let reader = self.reader.clone();
        let readable = self.readable.subscribe();
        let task = self
            .runtime
            .spawn(read_loop(reader, readable, Arc::downgrade(&session)));

        *self.read_task.lock() = Some(task);
    }

    fn unregister(&self) {
        self.stop_reading();
    }

    fn flush(&self, batch: Vec<Bytes>) -> io::Result<()> {
        let guard = self.writer.lock();
        let Some(writer) = guard.as_ref() else {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"));
        };

        for buf in batch {
            writer
                .send(buf)
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "writer task gone"))?;
        }
        Ok(())
    }

    fn set_readable(&self, readable: bool) {
        self.readable.send_replace(readable);
    }

    fn close(&self) {
        self.stop_reading();
        // Dropping the sender lets the writer task drain and shut the socket.
        self.writer.lock().take();
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

async fn read_loop(
    reader: Arc<tokio::sync::Mutex<OwnedReadHalf>>,
    mut readable: watch::Receiver<bool>,
    session: Weak<Session>,
) {
    let mut reader = reader.lock().await;
    let mut inbox = BytesMut::with_capacity(READ_CAPACITY);

    loop {
        if !*readable.borrow_and_update() {
            if readable.changed().await.is_err() {
                return;
            }
            continue;
        }

        inbox.reserve(READ_CAPACITY);

        select! {
            read_res = reader.read_buf(&mut inbox) => {
                let Some(session) = session.upgrade() else { return; };
                match read_res {
                    Ok(0) => {
                        debug!("peer closed session {}", session.id());
                        session.closed_by_peer();
                        return;
                    }
                    Ok(_) => session.dispatch_received(inbox.split().freeze()),
                    Err(e) => {
                        session.dispatch_exception(e.to_string());
                        session.closed_by_peer();
                        return;
                    }
                }
            }

            changed = readable.changed() => {
                if changed.is_err() { return; }
            }
        }
    }
}

fn spawn_writer_task(
    runtime: &Handle,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
) {
    runtime.spawn(async move {
        'outer: while let Some(mut buf) = rx.recv().await {
            if writer.write_all_buf(&mut buf).await.is_err() {
                break;
            }

            // coalesce bursts to cut syscalls
            while let Ok(mut more) = rx.try_recv() {
                if writer.write_all_buf(&mut more).await.is_err() {
                    break 'outer;
                }
            }
        }
        let _ = writer.shutdown().await;
    });
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bind_reports_ephemeral_port_and_unbind_releases_it() {
        let transport = TcpTransport::new(Handle::current());
        let acceptor: Acceptor = Arc::new(|_| {});

        let local = transport
            .bind("127.0.0.1:0".parse().unwrap(), acceptor)
            .unwrap();
        assert_ne!(local.port(), 0);

        transport.unbind(local).unwrap();
        assert!(transport.unbind(local).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn accepted_connections_reach_the_acceptor() {
        let transport = TcpTransport::new(Handle::current());
        let (tx, rx) = std_mpsc::channel();
        let tx = Mutex::new(tx);
        let acceptor: Acceptor = Arc::new(move |channel| {
            let _ = tx.lock().send(channel.remote_addr());
        });

        let local = transport
            .bind("127.0.0.1:0".parse().unwrap(), acceptor)
            .unwrap();
        let client = TcpStream::connect(local).await.unwrap();
        let client_addr = client.local_addr().unwrap();

        let seen = tokio::task::spawn_blocking(move || rx.recv().unwrap())
            .await
            .unwrap();
        assert_eq!(seen, client_addr);
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
