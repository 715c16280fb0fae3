// Transport backends for the relay connection.
//
// Each open connection runs one dedicated blocking reader thread that
// feeds complete frames into the shared session and performs whatever
// sends the session asks for (acks). Application-side sends go:
// - UDP: straight through the shared socket; `send_to` takes `&self`.
// - TCP: straight through the stream; `&TcpStream` implements `Write`
//   and the reader thread only ever reads its clone.
// - WebSocket: into an outbox channel drained by the reader thread,
//   which owns the socket outright since tungstenite sockets cannot be
//   split.
//
// Close is flag-based and idempotent: `TransportLink::close` flips the
// alive flag and nudges the socket so a blocked reader wakes up promptly.

use std::io::{self, BufReader, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use gullwake_protocol::frame::MIN_FRAME_LEN;
use log::debug;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

use crate::error::RelayError;
use crate::session::{ConnectionState, Session, lock_session};

/// A client-side WebSocket, plain or TLS.
pub type WsSocket = WebSocket<MaybeTlsStream<TcpStream>>;

/// Receive timeout used to poll the alive flag on the UDP socket, which
/// would otherwise block forever.
const UDP_READ_POLL: Duration = Duration::from_millis(100);

/// The WebSocket reader is also the writer, so its poll is shorter: this
/// bounds how long a queued send can sit in the outbox.
const WS_READ_POLL: Duration = Duration::from_millis(25);

/// Which wire the client speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    WebSocket,
    Tcp,
    Udp,
}

enum Flavor {
    Udp { socket: UdpSocket, peer: SocketAddr },
    Tcp { stream: TcpStream },
    Ws { outbox: Sender<Vec<u8>> },
}

/// One open socket plus the shared liveness flag. Sending is safe from
/// any thread; receiving belongs to the reader thread alone.
pub struct TransportLink {
    kind: TransportKind,
    alive: AtomicBool,
    flavor: Flavor,
}

impl TransportLink {
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Queue or write one encoded frame. Fire-and-forget: failures are
    /// reported by the caller, never retried here.
    pub fn send(&self, frame: &[u8]) -> io::Result<()> {
        if !self.is_alive() {
            return Err(io::Error::new(ErrorKind::NotConnected, "transport closed"));
        }
        match &self.flavor {
            Flavor::Udp { socket, peer } => socket.send_to(frame, *peer).map(|_| ()),
            Flavor::Tcp { stream } => {
                let mut writer: &TcpStream = stream;
                writer.write_all(frame)
            }
            Flavor::Ws { outbox } => outbox
                .send(frame.to_vec())
                .map_err(|_| io::Error::new(ErrorKind::NotConnected, "writer thread gone")),
        }
    }

    /// Shut the transport down. Idempotent, and wakes a blocked reader.
    pub fn close(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            debug!("closing {:?} transport", self.kind);
            if let Flavor::Tcp { stream } = &self.flavor {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(ErrorKind::AddrNotAvailable, format!("no address for {host}:{port}"))
    })
}

/// Bind an ephemeral UDP socket pointed at the relay.
pub fn open_udp(host: &str, port: u16) -> io::Result<Arc<TransportLink>> {
    let peer = resolve(host, port)?;
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_read_timeout(Some(UDP_READ_POLL))?;
    debug!("udp socket {} talking to relay {peer}", socket.local_addr()?);
    Ok(Arc::new(TransportLink {
        kind: TransportKind::Udp,
        alive: AtomicBool::new(true),
        flavor: Flavor::Udp { socket, peer },
    }))
}

/// Connect a TCP stream to the relay; the returned clone is the reader
/// thread's half.
pub fn open_tcp(host: &str, port: u16) -> io::Result<(Arc<TransportLink>, TcpStream)> {
    let stream = TcpStream::connect((host, port))?;
    stream.set_nodelay(true)?;
    let reader = stream.try_clone()?;
    debug!("tcp stream connected to {host}:{port}");
    let link = Arc::new(TransportLink {
        kind: TransportKind::Tcp,
        alive: AtomicBool::new(true),
        flavor: Flavor::Tcp { stream },
    });
    Ok((link, reader))
}

/// Open and handshake a WebSocket connection, returning the socket for
/// the reader thread along with the outbox it drains for sends.
pub fn open_ws(
    host: &str,
    port: u16,
    ssl: bool,
) -> Result<(Arc<TransportLink>, WsSocket, Receiver<Vec<u8>>), tungstenite::Error> {
    let scheme = if ssl { "wss" } else { "ws" };
    let url = format!("{scheme}://{host}:{port}");
    let (ws, _response) = tungstenite::connect(url.as_str())?;
    match ws.get_ref() {
        MaybeTlsStream::Plain(stream) => stream.set_read_timeout(Some(WS_READ_POLL))?,
        MaybeTlsStream::Rustls(tls) => tls.sock.set_read_timeout(Some(WS_READ_POLL))?,
        _ => {}
    }
    debug!("websocket connected to {url}");
    let (outbox_tx, outbox_rx) = mpsc::channel();
    let link = Arc::new(TransportLink {
        kind: TransportKind::WebSocket,
        alive: AtomicBool::new(true),
        flavor: Flavor::Ws { outbox: outbox_tx },
    });
    Ok((link, ws, outbox_rx))
}

/// UDP reader thread: one datagram is one frame.
pub fn spawn_udp_reader(link: Arc<TransportLink>, session: Arc<Mutex<Session>>) -> JoinHandle<()> {
    thread::spawn(move || {
        let Flavor::Udp { socket, peer } = &link.flavor else {
            return;
        };
        let mut buf = vec![0u8; 64 * 1024];
        while link.is_alive() {
            match socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    // Datagrams from anyone but the relay are noise.
                    if from == *peer {
                        handle_incoming(&link, &session, &buf[..len]);
                    }
                }
                Err(e) if is_poll_timeout(&e) => {}
                Err(e) => {
                    fail_from_reader(
                        &link,
                        &session,
                        RelayError::Io(format!("receive failed: {e}")),
                    );
                    break;
                }
            }
        }
    })
}

/// TCP reader thread: reassemble frames from the 2-byte length prefix.
pub fn spawn_tcp_reader(
    link: Arc<TransportLink>,
    session: Arc<Mutex<Session>>,
    stream: TcpStream,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        while link.is_alive() {
            match read_frame(&mut reader) {
                Ok(frame) => handle_incoming(&link, &session, &frame),
                Err(e) => {
                    let err = match e.kind() {
                        ErrorKind::InvalidData => RelayError::Protocol(e.to_string()),
                        ErrorKind::UnexpectedEof => {
                            RelayError::Io("connection closed by relay".into())
                        }
                        _ => RelayError::Io(format!("receive failed: {e}")),
                    };
                    fail_from_reader(&link, &session, err);
                    break;
                }
            }
        }
    })
}

/// WebSocket reader thread; also the only writer.
pub fn spawn_ws_reader(
    link: Arc<TransportLink>,
    session: Arc<Mutex<Session>>,
    mut ws: WsSocket,
    outbox: Receiver<Vec<u8>>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        loop {
            if !link.is_alive() {
                let _ = ws.close(None);
                break;
            }
            if let Err(err) = pump_ws(&link, &session, &mut ws, &outbox) {
                fail_from_reader(&link, &session, err);
                break;
            }
        }
    })
}

/// One turn of the WebSocket loop: flush queued sends, then read with the
/// poll timeout. A timeout is just the loop turning over.
fn pump_ws(
    link: &TransportLink,
    session: &Mutex<Session>,
    ws: &mut WsSocket,
    outbox: &Receiver<Vec<u8>>,
) -> Result<(), RelayError> {
    while let Ok(frame) = outbox.try_recv() {
        ws.send(Message::binary(frame))
            .map_err(|e| RelayError::Io(format!("send failed: {e}")))?;
    }
    match ws.read() {
        Ok(Message::Binary(frame)) => {
            handle_incoming(link, session, &frame);
            Ok(())
        }
        Ok(Message::Close(_)) => Err(RelayError::Io("connection closed by relay".into())),
        Ok(_) => Ok(()),
        Err(tungstenite::Error::Io(e)) if is_poll_timeout(&e) => Ok(()),
        Err(e) => Err(RelayError::Io(format!("receive failed: {e}"))),
    }
}

/// Read one length-prefixed frame, prefix included, so the codec can
/// cross-check the declared length.
fn read_frame<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut prefix = [0u8; 2];
    reader.read_exact(&mut prefix)?;
    let total = usize::from(u16::from_be_bytes(prefix));
    if total < MIN_FRAME_LEN {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            format!("length prefix {total} below the minimum frame size"),
        ));
    }
    let mut frame = vec![0u8; total];
    frame[..2].copy_from_slice(&prefix);
    reader.read_exact(&mut frame[2..])?;
    Ok(frame)
}

/// Push one complete inbound frame through the session and perform the
/// sends it requests. Closes the link when the session died on it.
fn handle_incoming(link: &TransportLink, session: &Mutex<Session>, frame: &[u8]) {
    let (sends, dead) = {
        let mut session = lock_session(session);
        let sends = session.handle_frame(Instant::now(), frame);
        (sends, session.state() == ConnectionState::Disconnected)
    };
    for bytes in &sends {
        if let Err(e) = link.send(bytes) {
            fail_from_reader(link, session, RelayError::Io(format!("send failed: {e}")));
            return;
        }
    }
    if dead {
        link.close();
    }
}

/// Report a receive-side failure, unless the close was requested locally
/// and the error is just the socket unblocking.
fn fail_from_reader(link: &TransportLink, session: &Mutex<Session>, err: RelayError) {
    if !link.is_alive() {
        return;
    }
    lock_session(session).fail(err);
    link.close();
}

fn is_poll_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use gullwake_protocol::ServerFrame;

    use super::*;

    #[test]
    fn closed_link_refuses_sends() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = receiver.local_addr().unwrap().port();
        let link = open_udp("127.0.0.1", port).unwrap();

        link.close();
        link.close();
        assert!(!link.is_alive());
        assert_eq!(link.send(b"x").unwrap_err().kind(), ErrorKind::NotConnected);
    }

    #[test]
    fn udp_link_sends_datagrams_to_the_peer() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = receiver.local_addr().unwrap().port();
        let link = open_udp("127.0.0.1", port).unwrap();

        link.send(b"hello").unwrap();
        let mut buf = [0u8; 16];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"hello");
    }

    #[test]
    fn read_frame_reassembles_split_writes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        let frame = ServerFrame::Rsmg { seq: 7, body: b"{}".to_vec() }.encode().unwrap();
        // Deliver the frame in two pieces; the reader must wait for both.
        client.write_all(&frame[..3]).unwrap();
        client.flush().unwrap();
        client.write_all(&frame[3..]).unwrap();

        let mut reader = BufReader::new(server);
        assert_eq!(read_frame(&mut reader).unwrap(), frame);
    }

    #[test]
    fn read_frame_rejects_undersized_length_prefix() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        client.write_all(&[0x00, 0x02, 0x00]).unwrap();

        let mut reader = BufReader::new(server);
        let err = read_frame(&mut reader).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}
