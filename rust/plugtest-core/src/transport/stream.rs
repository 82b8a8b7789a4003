use std::io::ErrorKind;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::BytesMut;
use rmpv::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

use crate::TransportError;

use super::Transport;

const READ_CHUNK: usize = 8 * 1024;

/// Transport over any byte stream (TCP socket, duplex pipe, stdio).
#[derive(Clone)]
pub struct StreamTransport {
    inner: Arc<StreamInner>,
}

impl std::fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("closed", &self.is_closed_inner())
            .finish_non_exhaustive()
    }
}

struct StreamInner {
    reader: AsyncMutex<ReadState>,
    writer: AsyncMutex<Box<dyn AsyncWrite + Unpin + Send + Sync>>,
    closed: AtomicBool,
}

struct ReadState {
    io: Box<dyn AsyncRead + Unpin + Send + Sync>,
    buf: BytesMut,
    scanner: FrameScanner,
}

impl StreamTransport {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_split(reader, writer)
    }

    /// Create a transport from separate reader and writer halves.
    pub fn from_split<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + Sync + 'static,
        W: AsyncWrite + Unpin + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(StreamInner {
                reader: AsyncMutex::new(ReadState {
                    io: Box::new(reader),
                    buf: BytesMut::with_capacity(READ_CHUNK),
                    scanner: FrameScanner::default(),
                }),
                writer: AsyncMutex::new(Box::new(writer)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Two connected in-memory transports.
    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(65536);
        (Self::new(a), Self::new(b))
    }

    fn is_closed_inner(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

/// Walks msgpack markers to find where the next value ends, without building it.
///
/// Resumable across reads: bytes of a partial frame are walked once, however
/// many reads the frame takes to arrive.
#[derive(Debug, Default)]
struct FrameScanner {
    /// Bytes of the pending frame already walked.
    walked: usize,
    /// Items still owed by each open array or map, innermost last.
    open: Vec<u64>,
}

impl FrameScanner {
    /// Length of the first value in `buf`, once all of its bytes are there.
    fn scan(&mut self, buf: &[u8]) -> Result<Option<usize>, rmpv::decode::Error> {
        while let Some(&marker) = buf.get(self.walked) {
            let Some(item) = Item::parse(marker, &buf[self.walked + 1..])? else {
                return Ok(None);
            };
            if item.len > (buf.len() - self.walked) as u64 {
                return Ok(None);
            }
            self.walked += item.len as usize;
            if item.children > 0 {
                self.open.push(item.children);
                continue;
            }
            self.complete_one();
            if self.open.is_empty() {
                return Ok(Some(std::mem::take(&mut self.walked)));
            }
        }
        Ok(None)
    }

    /// An item finished: it fills one slot of its container, which may finish in turn.
    fn complete_one(&mut self) {
        while let Some(owed) = self.open.last_mut() {
            *owed -= 1;
            if *owed > 0 {
                return;
            }
            self.open.pop();
        }
    }
}

/// One msgpack item: its own bytes, plus how many nested items follow it.
struct Item {
    len: u64,
    children: u64,
}

impl Item {
    /// `None` until the bytes holding the item's length have arrived.
    fn parse(marker: u8, rest: &[u8]) -> Result<Option<Self>, rmpv::decode::Error> {
        let item = match marker {
            0x00..=0x7f | 0xc0 | 0xc2 | 0xc3 | 0xe0..=0xff => Self::fixed(1),
            0x80..=0x8f => Self::container(1, 2 * u64::from(marker & 0x0f)),
            0x90..=0x9f => Self::container(1, u64::from(marker & 0x0f)),
            0xa0..=0xbf => Self::fixed(1 + u64::from(marker & 0x1f)),
            0xc4 | 0xd9 => Self::sized(rest, 1, 0),
            0xc5 | 0xda => Self::sized(rest, 2, 0),
            0xc6 | 0xdb => Self::sized(rest, 4, 0),
            0xc7 => Self::sized(rest, 1, 1),
            0xc8 => Self::sized(rest, 2, 1),
            0xc9 => Self::sized(rest, 4, 1),
            0xcc | 0xd0 => Self::fixed(2),
            0xcd | 0xd1 => Self::fixed(3),
            0xca | 0xce | 0xd2 => Self::fixed(5),
            0xcb | 0xcf | 0xd3 => Self::fixed(9),
            0xd4 => Self::fixed(3),
            0xd5 => Self::fixed(4),
            0xd6 => Self::fixed(6),
            0xd7 => Self::fixed(10),
            0xd8 => Self::fixed(18),
            0xdc => Self::counted(rest, 2, 1),
            0xdd => Self::counted(rest, 4, 1),
            0xde => Self::counted(rest, 2, 2),
            0xdf => Self::counted(rest, 4, 2),
            0xc1 => {
                return Err(rmpv::decode::Error::InvalidMarkerRead(std::io::Error::new(
                    ErrorKind::InvalidData,
                    "reserved msgpack marker 0xc1",
                )));
            }
        };
        Ok(item)
    }

    fn fixed(len: u64) -> Option<Self> {
        Some(Self { len, children: 0 })
    }

    fn container(len: u64, children: u64) -> Option<Self> {
        Some(Self { len, children })
    }

    /// Marker, a `width`-byte payload length, `extra` header bytes, then the payload.
    fn sized(rest: &[u8], width: usize, extra: u64) -> Option<Self> {
        let payload = be_uint(rest, width)?;
        Self::fixed(1 + width as u64 + extra + payload)
    }

    /// Marker and a `width`-byte entry count; maps owe a key and a value per entry.
    fn counted(rest: &[u8], width: usize, per_entry: u64) -> Option<Self> {
        let entries = be_uint(rest, width)?;
        Self::container(1 + width as u64, entries * per_entry)
    }
}

fn be_uint(bytes: &[u8], width: usize) -> Option<u64> {
    let bytes = bytes.get(..width)?;
    Some(bytes.iter().fold(0, |n, b| (n << 8) | u64::from(*b)))
}

/// Decode the next value once the scanner has seen all of its bytes.
fn take_frame(
    buf: &mut BytesMut,
    scanner: &mut FrameScanner,
) -> Result<Option<Value>, TransportError> {
    let len = match scanner.scan(buf) {
        Ok(Some(len)) => len,
        Ok(None) => return Ok(None),
        Err(e) => {
            // The stream cannot be resynchronised past an undecodable marker.
            buf.clear();
            *scanner = FrameScanner::default();
            return Err(TransportError::Decode(e));
        }
    };
    let frame = buf.split_to(len);
    let value = rmpv::decode::read_value(&mut &frame[..])?;
    Ok(Some(value))
}

impl Transport for StreamTransport {
    async fn send_frame(&self, frame: Value) -> Result<(), TransportError> {
        if self.is_closed_inner() {
            return Err(TransportError::Closed);
        }

        let mut bytes = Vec::new();
        rmpv::encode::write_value(&mut bytes, &frame)
            .map_err(|e| TransportError::Encode(e.to_string()))?;

        let mut writer = self.inner.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        tracing::trace!(len = bytes.len(), "frame sent");
        Ok(())
    }

    async fn recv_frame(&self) -> Result<Value, TransportError> {
        let mut state = self.inner.reader.lock().await;
        let ReadState { io, buf, scanner } = &mut *state;
        loop {
            if self.is_closed_inner() {
                return Err(TransportError::Closed);
            }
            if let Some(value) = take_frame(buf, scanner)? {
                return Ok(value);
            }
            buf.reserve(READ_CHUNK);
            // read_buf is cancel-safe: bytes land in `buf` or not at all
            let n = io.read_buf(buf).await?;
            if n == 0 {
                if !buf.is_empty() {
                    tracing::debug!(
                        leftover = buf.len(),
                        "stream ended in the middle of a frame"
                    );
                }
                return Err(TransportError::Closed);
            }
        }
    }

    async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut writer = self.inner.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(error = %e, "shutdown of write half failed");
        }
    }

    fn is_closed(&self) -> bool {
        self.is_closed_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_arrive_whole_and_in_order() {
        let (a, b) = StreamTransport::pair();
        let first = Value::Array(vec![Value::from(2), Value::from("m"), Value::Array(vec![])]);
        let second = Value::from("x".repeat(3 * READ_CHUNK));
        a.send_frame(first.clone()).await.unwrap();
        a.send_frame(second.clone()).await.unwrap();
        assert_eq!(b.recv_frame().await.unwrap(), first);
        assert_eq!(b.recv_frame().await.unwrap(), second);
    }

    #[tokio::test]
    async fn reassembles_split_writes() {
        let (raw, peer) = tokio::io::duplex(64);
        let transport = StreamTransport::new(peer);

        let mut bytes = Vec::new();
        rmpv::encode::write_value(&mut bytes, &Value::from("split across writes")).unwrap();
        let (head, tail) = bytes.split_at(5);
        let (_, mut raw_writer) = tokio::io::split(raw);
        raw_writer.write_all(head).await.unwrap();

        let recv = tokio::spawn(async move { transport.recv_frame().await });
        tokio::task::yield_now().await;
        raw_writer.write_all(tail).await.unwrap();

        assert_eq!(
            recv.await.unwrap().unwrap(),
            Value::from("split across writes")
        );
    }

    #[test]
    fn scanner_finds_the_end_of_a_nested_frame_one_byte_at_a_time() {
        let first = Value::Array(vec![
            Value::from(0),
            Value::from(70_000),
            Value::from("method"),
            Value::Array(vec![
                Value::Map(vec![(
                    Value::from("k"),
                    Value::Array(vec![Value::Boolean(true), Value::Nil]),
                )]),
                Value::F64(1.5),
                Value::from(-200),
                Value::Binary(vec![7; 300]),
                Value::Array(vec![]),
            ]),
        ]);
        let mut bytes = Vec::new();
        rmpv::encode::write_value(&mut bytes, &first).unwrap();
        let frame_len = bytes.len();
        rmpv::encode::write_value(&mut bytes, &Value::from("next")).unwrap();

        let mut scanner = FrameScanner::default();
        for end in 0..frame_len {
            assert_eq!(scanner.scan(&bytes[..end]).unwrap(), None, "at {end}");
        }
        assert_eq!(scanner.scan(&bytes).unwrap(), Some(frame_len));
        assert_eq!(scanner.scan(&bytes[frame_len..]).unwrap(), Some(5));
    }

    #[tokio::test]
    async fn reserved_marker_is_a_decode_error() {
        let (raw, peer) = tokio::io::duplex(64);
        let transport = StreamTransport::new(peer);
        let (_, mut raw_writer) = tokio::io::split(raw);
        raw_writer.write_all(&[0x91, 0xc1]).await.unwrap();
        assert!(matches!(
            transport.recv_frame().await,
            Err(TransportError::Decode(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn multi_megabyte_frame_arrives_promptly() {
        let (a, b) = StreamTransport::pair();
        // ~5 MiB on the wire, delivered through a 64 KiB pipe
        let frame = Value::Array((0..1_000_000u64).map(|i| Value::from(i * 4099)).collect());
        let expected = frame.clone();

        let send = tokio::spawn(async move { a.send_frame(frame).await });
        let received = tokio::time::timeout(std::time::Duration::from_secs(10), b.recv_frame())
            .await
            .expect("large frame took too long to decode")
            .unwrap();
        send.await.unwrap().unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn close_is_seen_as_end_of_stream_by_peer() {
        let (a, b) = StreamTransport::pair();
        a.close().await;
        assert!(a.is_closed());
        assert!(matches!(
            a.send_frame(Value::Nil).await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(b.recv_frame().await, Err(TransportError::Closed)));
    }
}
