//! Buffered, deadline-bounded message I/O over a [`Socket`].

use std::io;

use bytes::{Buf, BytesMut};
use pgwire_protocol::{BackendMessage, FrontendMessage};
use tokio::io::Interest;
use tokio::time::{Instant, timeout_at};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CodecError;
use crate::message_codec::PgCodec;
use crate::socket::Socket;

const READ_CHUNK: usize = 8 * 1024;

/// A socket plus the read and write buffers of one protocol session.
///
/// Outgoing messages are queued into the write buffer and only hit the
/// socket on [`flush`](Self::flush). Incoming bytes accumulate in the read
/// buffer until a complete message can be decoded.
#[derive(Debug)]
pub struct MessageIo<S> {
    socket: S,
    codec: PgCodec,
    read_buf: BytesMut,
    write_buf: BytesMut,
    eof: bool,
}

impl<S: Socket> MessageIo<S> {
    /// Wrap a connected socket.
    pub fn new(socket: S) -> Self {
        Self {
            socket,
            codec: PgCodec::new(),
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::with_capacity(1024),
            eof: false,
        }
    }

    /// Borrow the underlying socket.
    pub fn get_ref(&self) -> &S {
        &self.socket
    }

    /// Queue a message for the next flush.
    pub fn queue(&mut self, msg: FrontendMessage<'_>) -> Result<(), CodecError> {
        self.codec.encode(msg, &mut self.write_buf)
    }

    /// Queue bytes that are already framed, e.g. handshake output.
    pub fn queue_raw(&mut self, bytes: &[u8]) {
        self.write_buf.extend_from_slice(bytes);
    }

    /// Bytes queued but not yet written.
    #[must_use]
    pub fn pending_write(&self) -> usize {
        self.write_buf.len()
    }

    /// Bytes received but not yet decoded.
    #[must_use]
    pub fn pending_read(&self) -> usize {
        self.read_buf.len()
    }

    /// Discard all buffered bytes in both directions.
    pub fn clear(&mut self) {
        self.read_buf.clear();
        self.write_buf.clear();
    }

    /// Write as much of the queue as the socket accepts right now.
    ///
    /// Returns `true` once the write buffer is empty.
    pub fn try_flush(&mut self) -> Result<bool, CodecError> {
        while !self.write_buf.is_empty() {
            match self.socket.try_write(&self.write_buf) {
                Ok(0) => return Err(CodecError::ConnectionClosed),
                Ok(n) => self.write_buf.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    /// Suspend on writability until the queue is fully sent or `deadline` passes.
    pub async fn flush(&mut self, deadline: Instant) -> Result<(), CodecError> {
        while !self.try_flush()? {
            match timeout_at(deadline, self.socket.ready(Interest::WRITABLE)).await {
                Ok(ready) => {
                    ready?;
                }
                Err(_) => return Err(CodecError::Timeout("writable")),
            }
        }
        Ok(())
    }

    /// Whether the peer has closed its side of the socket.
    ///
    /// Bytes received before the close stay decodable.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Read every byte currently available without waiting.
    ///
    /// Returns the number of bytes read; zero means the socket had nothing.
    /// A peer close is reported only once a call reads nothing else, so a
    /// final message sent just before the close is kept.
    pub fn try_fill(&mut self) -> Result<usize, CodecError> {
        if self.eof {
            return Err(CodecError::ConnectionClosed);
        }
        let mut chunk = [0u8; READ_CHUNK];
        let mut total = 0;
        loop {
            match self.socket.try_read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    if total > 0 {
                        return Ok(total);
                    }
                    return Err(CodecError::ConnectionClosed);
                }
                Ok(n) => {
                    self.read_buf.extend_from_slice(&chunk[..n]);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Suspend on readability until at least one byte arrives or `deadline` passes.
    pub async fn fill(&mut self, deadline: Instant) -> Result<usize, CodecError> {
        if self.eof {
            return Err(CodecError::ConnectionClosed);
        }
        loop {
            match timeout_at(deadline, self.socket.ready(Interest::READABLE)).await {
                Ok(ready) => {
                    ready?;
                }
                Err(_) => return Err(CodecError::Timeout("readable")),
            }
            let n = self.try_fill()?;
            if n > 0 {
                return Ok(n);
            }
        }
    }

    /// Decode the next complete message already in the read buffer.
    pub fn next_message(&mut self) -> Result<Option<BackendMessage>, CodecError> {
        self.codec.decode(&mut self.read_buf)
    }

    /// Receive the next message, waiting for more bytes as needed.
    pub async fn recv(&mut self, deadline: Instant) -> Result<BackendMessage, CodecError> {
        loop {
            if let Some(msg) = self.next_message()? {
                return Ok(msg);
            }
            self.fill(deadline).await?;
        }
    }

    /// Best-effort graceful close: attempt a single non-blocking `Terminate` write.
    pub fn try_terminate(&mut self) {
        self.write_buf.clear();
        if self.queue(FrontendMessage::Terminate).is_ok() {
            let _ = self.try_flush();
        }
    }

    /// Unwrap the socket, discarding buffers.
    pub fn into_inner(self) -> S {
        self.socket
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use pgwire_protocol::TransactionStatus;
    use tokio::io::Ready;

    /// In-memory socket: reads are served from `inbound`, writes land in `outbound`.
    #[derive(Default)]
    struct MemorySocket {
        inbound: Mutex<VecDeque<u8>>,
        outbound: Mutex<Vec<u8>>,
        write_limit: Option<usize>,
        closed: bool,
    }

    impl MemorySocket {
        fn with_inbound(bytes: &[u8]) -> Self {
            Self {
                inbound: Mutex::new(bytes.iter().copied().collect()),
                ..Self::default()
            }
        }
    }

    impl Socket for MemorySocket {
        async fn ready(&self, interest: Interest) -> io::Result<Ready> {
            let empty = self.inbound.lock().unwrap().is_empty();
            if interest.is_readable() && empty && !self.closed {
                std::future::pending::<()>().await;
            }
            if interest.is_writable() && self.write_limit == Some(0) {
                std::future::pending::<()>().await;
            }
            Ok(Ready::READABLE | Ready::WRITABLE)
        }

        fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
            let mut inbound = self.inbound.lock().unwrap();
            if inbound.is_empty() {
                if self.closed {
                    return Ok(0);
                }
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(inbound.len());
            for slot in buf.iter_mut().take(n) {
                *slot = inbound.pop_front().unwrap();
            }
            Ok(n)
        }

        fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
            let n = match self.write_limit {
                Some(0) => return Err(io::ErrorKind::WouldBlock.into()),
                Some(limit) => buf.len().min(limit),
                None => buf.len(),
            };
            self.outbound.lock().unwrap().extend_from_slice(&buf[..n]);
            Ok(n)
        }
    }

    fn encode_all(msgs: &[BackendMessage]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for m in msgs {
            m.encode(&mut buf);
        }
        buf.to_vec()
    }

    #[tokio::test]
    async fn test_flush_writes_in_chunks() {
        let socket = MemorySocket {
            write_limit: Some(3),
            ..MemorySocket::default()
        };
        let mut io = MessageIo::new(socket);
        io.queue(FrontendMessage::Query("SELECT 1")).unwrap();
        io.queue(FrontendMessage::Sync).unwrap();
        let expected = io.pending_write();

        io.flush(Instant::now() + Duration::from_secs(1)).await.unwrap();

        assert_eq!(io.pending_write(), 0);
        assert_eq!(io.get_ref().outbound.lock().unwrap().len(), expected);
    }

    #[tokio::test]
    async fn test_recv_decodes_several_messages_from_one_read() {
        let bytes = encode_all(&[
            BackendMessage::CommandComplete("SELECT 1".into()),
            BackendMessage::ReadyForQuery(TransactionStatus::Idle),
        ]);
        let mut io = MessageIo::new(MemorySocket::with_inbound(&bytes));
        let deadline = Instant::now() + Duration::from_secs(1);

        assert!(matches!(
            io.recv(deadline).await.unwrap(),
            BackendMessage::CommandComplete(_)
        ));
        assert_eq!(io.pending_read(), 6);
        assert_eq!(
            io.recv(deadline).await.unwrap(),
            BackendMessage::ReadyForQuery(TransactionStatus::Idle)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_times_out_when_silent() {
        let mut io = MessageIo::new(MemorySocket::default());
        let err = io
            .recv(Instant::now() + Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_times_out_when_blocked() {
        let socket = MemorySocket {
            write_limit: Some(0),
            ..MemorySocket::default()
        };
        let mut io = MessageIo::new(socket);
        io.queue(FrontendMessage::Sync).unwrap();
        let err = io
            .flush(Instant::now() + Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, CodecError::Timeout("writable")));
    }

    #[tokio::test]
    async fn test_peer_close_is_reported() {
        let socket = MemorySocket {
            closed: true,
            ..MemorySocket::default()
        };
        let mut io = MessageIo::new(socket);
        let err = io
            .recv(Instant::now() + Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CodecError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_messages_before_peer_close_are_delivered() {
        let bytes = encode_all(&[
            BackendMessage::CommandComplete("SELECT 1".into()),
            BackendMessage::ReadyForQuery(TransactionStatus::Idle),
        ]);
        let socket = MemorySocket {
            closed: true,
            ..MemorySocket::with_inbound(&bytes)
        };
        let mut io = MessageIo::new(socket);
        let deadline = Instant::now() + Duration::from_secs(1);

        assert!(matches!(
            io.recv(deadline).await.unwrap(),
            BackendMessage::CommandComplete(_)
        ));
        assert!(io.is_eof());
        assert_eq!(
            io.recv(deadline).await.unwrap(),
            BackendMessage::ReadyForQuery(TransactionStatus::Idle)
        );
        let err = io.recv(deadline).await.unwrap_err();
        assert!(matches!(err, CodecError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_partial_message_then_close_is_reported() {
        let bytes = encode_all(&[BackendMessage::CommandComplete("SELECT 1".into())]);
        let socket = MemorySocket {
            closed: true,
            ..MemorySocket::with_inbound(&bytes[..bytes.len() - 2])
        };
        let mut io = MessageIo::new(socket);
        let err = io
            .recv(Instant::now() + Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CodecError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_try_terminate_writes_terminate() {
        let mut io = MessageIo::new(MemorySocket::default());
        io.queue(FrontendMessage::Query("SELECT pg_sleep(10)")).unwrap();
        io.try_terminate();
        assert_eq!(&io.get_ref().outbound.lock().unwrap()[..], b"X\0\0\0\x04");
    }

    #[tokio::test]
    async fn test_tcp_write_then_close() {
        use tokio::io::AsyncWriteExt;
        use tokio::net::{TcpListener, TcpStream};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let bytes = encode_all(&[BackendMessage::ReadyForQuery(TransactionStatus::Idle)]);
            stream.write_all(&bytes).await.unwrap();
            stream.shutdown().await.unwrap();
        });

        let client = TcpStream::connect(addr).await.unwrap();
        server.await.unwrap();
        let mut io = MessageIo::new(client);
        let deadline = Instant::now() + Duration::from_secs(5);
        let msg = io.recv(deadline).await.unwrap();
        assert_eq!(msg, BackendMessage::ReadyForQuery(TransactionStatus::Idle));
        assert!(matches!(
            io.recv(deadline).await.unwrap_err(),
            CodecError::ConnectionClosed
        ));
    }

    #[tokio::test]
    async fn test_tcp_loopback() {
        use tokio::io::AsyncWriteExt;
        use tokio::net::{TcpListener, TcpStream};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let bytes = encode_all(&[BackendMessage::ReadyForQuery(TransactionStatus::Idle)]);
            stream.write_all(&bytes).await.unwrap();
        });

        let client = TcpStream::connect(addr).await.unwrap();
        let mut io = MessageIo::new(client);
        let msg = io.recv(Instant::now() + Duration::from_secs(5)).await.unwrap();
        assert_eq!(msg, BackendMessage::ReadyForQuery(TransactionStatus::Idle));
        server.await.unwrap();
    }
}
