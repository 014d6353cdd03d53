// src/network/transport.rs
//! Socket side of the protocol clients
//!
//! [`IoDriver`] executes [`IoCommand`]s on the tokio runtime of the network
//! thread. Every connection runs as its own task and reports back through a
//! single channel, tagged with the client id and epoch that opened it.

use crate::network::client::{IoAction, IoCommand, IoEvent, MAX_LINE_LENGTH};
use crate::network::pool::{Endpoint, TransportKind};
use crate::utils::error::MinerError;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;
use tungstenite::protocol::Message;

/// An IO outcome addressed to `(client, epoch)`
pub type IoReport = (usize, u64, IoEvent);

const TLS_UNAVAILABLE: &str = "TLS transport is not available in this build";

/// Reads newline-terminated lines, refusing lines over [`MAX_LINE_LENGTH`]
///
/// `next_line` is cancel safe: bytes of a partially received line are kept
/// and completed by the next call.
pub struct LineReader<R> {
    reader: BufReader<R>,
    pending: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    /// Wraps a byte stream
    pub fn new(reader: R) -> Self {
        LineReader {
            reader: BufReader::new(reader),
            pending: Vec::with_capacity(4096),
        }
    }

    /// Next line without its terminator, `None` at end of stream
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            let budget = (MAX_LINE_LENGTH + 1).saturating_sub(self.pending.len()) as u64;
            let read = (&mut self.reader)
                .take(budget)
                .read_until(b'\n', &mut self.pending)
                .await?;

            if self.pending.last() == Some(&b'\n') {
                let mut line = std::mem::take(&mut self.pending);
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return String::from_utf8(line)
                    .map(Some)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e));
            }
            if self.pending.len() > MAX_LINE_LENGTH {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("line exceeds {} bytes", MAX_LINE_LENGTH),
                ));
            }
            if read == 0 {
                return Ok(None);
            }
        }
    }
}

/// Performs a no-auth SOCKS5 CONNECT to `host:port` over `stream`
pub async fn socks5_connect<S>(stream: &mut S, host: &str, port: u16) -> Result<(), MinerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let host_len = u8::try_from(host.len())
        .map_err(|_| MinerError::ConnectionError(format!("host name too long: {}", host)))?;

    stream.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await?;
    if greeting != [0x05, 0x00] {
        return Err(MinerError::ConnectionError(format!(
            "SOCKS5 proxy refused no-auth method ({:02x}{:02x})",
            greeting[0], greeting[1]
        )));
    }

    let mut request = vec![0x05, 0x01, 0x00, 0x03, host_len];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x00 {
        return Err(MinerError::ConnectionError(format!(
            "SOCKS5 connect to {}:{} failed with code {}",
            host, port, reply[1]
        )));
    }
    let skip = match reply[3] {
        0x01 => 4 + 2,
        0x04 => 16 + 2,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            usize::from(len[0]) + 2
        }
        other => {
            return Err(MinerError::ConnectionError(format!(
                "SOCKS5 reply with unknown address type {}",
                other
            )));
        }
    };
    let mut bound = vec![0u8; skip];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

#[derive(Clone)]
struct Reporter {
    client: usize,
    epoch: u64,
    events: UnboundedSender<IoReport>,
}

impl Reporter {
    fn send(&self, event: IoEvent) {
        // The receiver only goes away when the network thread shuts down.
        let _ = self.events.send((self.client, self.epoch, event));
    }
}

struct Connection {
    epoch: u64,
    outbound: UnboundedSender<String>,
    task: JoinHandle<()>,
}

/// Executes client IO on the current tokio runtime
pub struct IoDriver {
    events: UnboundedSender<IoReport>,
    connections: HashMap<usize, Connection>,
}

impl IoDriver {
    /// Creates a driver reporting into `events`
    pub fn new(events: UnboundedSender<IoReport>) -> Self {
        IoDriver {
            events,
            connections: HashMap::new(),
        }
    }

    /// Carries out one command
    ///
    /// Must be called from within a tokio runtime.
    pub fn execute(&mut self, command: IoCommand) {
        let IoCommand {
            client,
            epoch,
            action,
        } = command;
        let reporter = Reporter {
            client,
            epoch,
            events: self.events.clone(),
        };

        match action {
            IoAction::Resolve { host, port } => {
                tokio::spawn(async move {
                    let resolved = tokio::net::lookup_host((host.as_str(), port))
                        .await
                        .map(|addrs| addrs.collect::<Vec<_>>())
                        .map_err(|e| e.to_string());
                    reporter.send(IoEvent::Resolved(resolved));
                });
            }
            IoAction::Connect { addrs, endpoint } => {
                let (outbound, queue) = unbounded_channel();
                let task = tokio::spawn(run_connection(addrs, endpoint, queue, reporter));
                if let Some(previous) = self.connections.insert(
                    client,
                    Connection {
                        epoch,
                        outbound,
                        task,
                    },
                ) {
                    previous.task.abort();
                }
            }
            IoAction::StartTls => reporter.send(IoEvent::TlsReady(Err(TLS_UNAVAILABLE.into()))),
            IoAction::Send(line) => match self.connections.get(&client) {
                Some(connection) if connection.epoch == epoch => {
                    if connection.outbound.send(line).is_err() {
                        log::debug!("client {} connection task already finished", client);
                    }
                }
                _ => log::debug!("client {} has no connection for epoch {}", client, epoch),
            },
            IoAction::Close => {
                if self
                    .connections
                    .get(&client)
                    .is_some_and(|connection| connection.epoch == epoch)
                {
                    if let Some(connection) = self.connections.remove(&client) {
                        connection.task.abort();
                    }
                }
            }
        }
    }

    /// Aborts every connection task
    pub fn shutdown(&mut self) {
        for (_, connection) in self.connections.drain() {
            connection.task.abort();
        }
    }
}

impl Drop for IoDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_connection(
    addrs: Vec<SocketAddr>,
    endpoint: Endpoint,
    queue: UnboundedReceiver<String>,
    reporter: Reporter,
) {
    let stream = match open_stream(&addrs, &endpoint).await {
        Ok(stream) => stream,
        Err(e) => {
            reporter.send(IoEvent::Connected(Err(e.to_string())));
            return;
        }
    };

    let outcome = match endpoint.transport {
        TransportKind::Tcp => {
            reporter.send(IoEvent::Connected(Ok(())));
            run_lines(stream, queue, &reporter).await
        }
        TransportKind::WebSocket => {
            let url = format!("ws://{}:{}{}", endpoint.host, endpoint.port, endpoint.path);
            match tokio_tungstenite::client_async(url, stream).await {
                Ok((socket, _)) => {
                    reporter.send(IoEvent::Connected(Ok(())));
                    run_frames(socket, queue, &reporter).await
                }
                Err(e) => {
                    reporter.send(IoEvent::Connected(Err(e.to_string())));
                    return;
                }
            }
        }
    };

    reporter.send(IoEvent::Closed(outcome.err().map(|e| e.to_string())));
}

async fn open_stream(addrs: &[SocketAddr], endpoint: &Endpoint) -> Result<TcpStream, MinerError> {
    let mut stream = TcpStream::connect(addrs).await?;
    stream.set_nodelay(true)?;
    if endpoint.proxy.is_some() {
        socks5_connect(&mut stream, &endpoint.host, endpoint.port).await?;
    }
    Ok(stream)
}

async fn run_lines(
    stream: TcpStream,
    mut queue: UnboundedReceiver<String>,
    reporter: &Reporter,
) -> Result<(), MinerError> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = LineReader::new(read_half);
    let mut writer = BufWriter::new(write_half);

    loop {
        tokio::select! {
            line = reader.next_line() => match line? {
                Some(line) => {
                    log::trace!("rx {}", line);
                    reporter.send(IoEvent::Line(line));
                }
                None => return Ok(()),
            },
            outgoing = queue.recv() => match outgoing {
                Some(line) => {
                    log::trace!("tx {}", line);
                    writer.write_all(line.as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                    writer.flush().await?;
                }
                None => return Ok(()),
            },
        }
    }
}

async fn run_frames(
    socket: tokio_tungstenite::WebSocketStream<TcpStream>,
    mut queue: UnboundedReceiver<String>,
    reporter: &Reporter,
) -> Result<(), MinerError> {
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if text.len() > MAX_LINE_LENGTH {
                        return Err(MinerError::ProtocolError(format!(
                            "frame of {} bytes exceeds limit",
                            text.len()
                        )));
                    }
                    reporter.send(IoEvent::Line(text.to_string()));
                }
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },
            outgoing = queue.recv() => match outgoing {
                Some(line) => sink.send(Message::Text(line.into())).await?,
                None => return Ok(()),
            },
        }
    }
}
