//! Sensor frame source and producer
//!
//! Reads discrete frames from a byte stream (the sensor UART, or stdin one
//! line at a time), wraps each in a [`Message`] and offers it to the outbound
//! queue. A separate poller periodically asks the sensor for a reading.

use std::io::{self, BufRead, ErrorKind, Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::bridge::{Message, MessageQueue, MAX_PAYLOAD_LEN};
use crate::protocol::QoS;
use crate::supervisor::ConnectionStatus;

/// First byte of every sensor frame
pub const FRAME_START: u8 = 0x5A;

/// Command that makes the sensor report a reading
pub const POLL_COMMAND: [u8; 5] = [0x5A, 0x05, 0xA1, 0x01, 0x5B];

/// Default period between poll commands
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(20);

/// Yields one bounded frame per call; `Ok(None)` once the stream has ended
pub trait FrameSource {
    fn next_frame(&mut self) -> io::Result<Option<Bytes>>;
}

/// Frames of the form `0x5A, total_len, body[total_len - 2]`.
///
/// Bytes before a start byte are skipped. The returned frame includes the
/// start and length bytes.
pub struct SerialFrameReader<R> {
    reader: R,
}

impl<R: Read> SerialFrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// One byte, or `None` at end of stream
    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        loop {
            match self.reader.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(byte[0])),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl<R: Read> FrameSource for SerialFrameReader<R> {
    fn next_frame(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            let mut skipped = 0usize;
            loop {
                match self.read_byte()? {
                    Some(FRAME_START) => break,
                    Some(_) => skipped += 1,
                    None => return Ok(None),
                }
            }
            if skipped > 0 {
                debug!(skipped, "Skipped bytes before frame start");
            }

            let Some(total_len) = self.read_byte()? else {
                return Ok(None);
            };
            if total_len < 2 {
                warn!(total_len, "Ignoring frame with impossible length");
                continue;
            }

            let mut frame = vec![0u8; total_len as usize];
            frame[0] = FRAME_START;
            frame[1] = total_len;
            match self.reader.read_exact(&mut frame[2..]) {
                Ok(()) => return Ok(Some(Bytes::from(frame))),
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    debug!("Stream ended inside a frame");
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// One frame per line, trailing `\n` or `\r\n` stripped. Lines are opaque
/// bytes. Empty lines are skipped, lines longer than a payload are dropped
/// without being buffered whole.
pub struct LineFrameReader<R> {
    reader: R,
    line: Vec<u8>,
}

/// Payload plus a `\r\n` terminator
const MAX_LINE_LEN: u64 = MAX_PAYLOAD_LEN as u64 + 2;

impl<R: BufRead> LineFrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: Vec::with_capacity(MAX_LINE_LEN as usize),
        }
    }

    /// Throw away input up to and including the next newline
    fn skip_rest_of_line(&mut self) -> io::Result<usize> {
        let mut skipped = 0;
        loop {
            let available = self.reader.fill_buf()?;
            if available.is_empty() {
                return Ok(skipped);
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(end) => {
                    self.reader.consume(end + 1);
                    return Ok(skipped + end);
                }
                None => {
                    let len = available.len();
                    self.reader.consume(len);
                    skipped += len;
                }
            }
        }
    }
}

impl<R: BufRead> FrameSource for LineFrameReader<R> {
    fn next_frame(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            self.line.clear();
            let read = (&mut self.reader)
                .take(MAX_LINE_LEN)
                .read_until(b'\n', &mut self.line)?;
            if read == 0 {
                return Ok(None);
            }

            if read as u64 == MAX_LINE_LEN && self.line.last() != Some(&b'\n') {
                let skipped = self.skip_rest_of_line()?;
                warn!(len = read + skipped, "Dropping oversized line");
                continue;
            }

            let mut frame = self.line.as_slice();
            if let Some(rest) = frame.strip_suffix(b"\n") {
                frame = rest.strip_suffix(b"\r").unwrap_or(rest);
            }
            if frame.is_empty() {
                continue;
            }
            if frame.len() > MAX_PAYLOAD_LEN {
                warn!(len = frame.len(), "Dropping oversized line");
                continue;
            }
            return Ok(Some(Bytes::copy_from_slice(frame)));
        }
    }
}

/// Result of one producer step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpOutcome {
    /// Handed to the outbound queue
    Queued,
    /// Queue full or frame unusable; the frame is gone
    Dropped,
    /// Broker not connected; the frame is gone
    Offline,
    /// The frame source has ended
    EndOfStream,
}

/// Moves frames from a source into the outbound queue
pub struct Producer<S> {
    source: S,
    queue: Arc<MessageQueue>,
    status: ConnectionStatus,
    topic: String,
    qos: QoS,
    retain: bool,
}

impl<S: FrameSource> Producer<S> {
    pub fn new(
        source: S,
        queue: Arc<MessageQueue>,
        status: ConnectionStatus,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            source,
            queue,
            status,
            topic: topic.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Read one frame and make a single attempt to queue it
    pub fn pump_once(&mut self) -> io::Result<PumpOutcome> {
        let Some(frame) = self.source.next_frame()? else {
            return Ok(PumpOutcome::EndOfStream);
        };

        if !self.status.is_connected() {
            debug!(len = frame.len(), "Broker offline, dropping frame");
            return Ok(PumpOutcome::Offline);
        }

        let message = match Message::new(self.topic.as_str(), self.qos, self.retain, frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping frame: {}", e);
                return Ok(PumpOutcome::Dropped);
            }
        };

        match self.queue.try_push(message) {
            Ok(()) => Ok(PumpOutcome::Queued),
            Err(_) => Ok(PumpOutcome::Dropped),
        }
    }

    /// Pump until the source ends or fails
    pub fn run(mut self) {
        info!(topic = %self.topic, "Producer started");
        loop {
            match self.pump_once() {
                Ok(PumpOutcome::EndOfStream) => {
                    info!("Frame source ended, producer stopping");
                    return;
                }
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    error!("Frame source failed: {}", e);
                    return;
                }
            }
        }
    }
}

/// Periodically writes [`POLL_COMMAND`] to the sensor
pub struct SensorPoller<W> {
    writer: W,
    interval: Duration,
}

impl<W: Write> SensorPoller<W> {
    pub fn new(writer: W, interval: Duration) -> Self {
        Self { writer, interval }
    }

    pub fn poll_once(&mut self) -> io::Result<()> {
        self.writer.write_all(&POLL_COMMAND)?;
        self.writer.flush()
    }

    pub fn run(mut self) {
        info!(interval = ?self.interval, "Sensor poller started");
        loop {
            if let Err(e) = self.poll_once() {
                warn!("Sensor poll failed: {}", e);
            }
            thread::sleep(self.interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::session::SessionState;

    fn frames<S: FrameSource>(mut source: S) -> Vec<Vec<u8>> {
        std::iter::from_fn(|| source.next_frame().unwrap())
            .map(|f| f.to_vec())
            .collect()
    }

    #[test]
    fn test_serial_frames_skip_leading_noise() {
        let stream = vec![
            0x00, 0xFF, 0x5A, 0x05, 0xA1, 0x01, 0x5B, // noise, then one frame
            0x5A, 0x03, 0x42, // back-to-back frame
        ];
        assert_eq!(
            frames(SerialFrameReader::new(Cursor::new(stream))),
            vec![vec![0x5A, 0x05, 0xA1, 0x01, 0x5B], vec![0x5A, 0x03, 0x42]]
        );
    }

    #[test]
    fn test_serial_frame_with_bad_length_is_skipped() {
        let stream = vec![0x5A, 0x01, 0x5A, 0x02];
        assert_eq!(
            frames(SerialFrameReader::new(Cursor::new(stream))),
            vec![vec![0x5A, 0x02]]
        );
    }

    #[test]
    fn test_serial_truncated_frame_ends_stream() {
        let stream = vec![0x5A, 0x06, 0x01, 0x02];
        assert!(frames(SerialFrameReader::new(Cursor::new(stream))).is_empty());
    }

    #[test]
    fn test_line_frames() {
        let mut input = String::from("hello\r\n\nworld\n");
        input.push_str(&"x".repeat(MAX_PAYLOAD_LEN + 1));
        input.push_str("\nlast");

        assert_eq!(
            frames(LineFrameReader::new(Cursor::new(input))),
            vec![b"hello".to_vec(), b"world".to_vec(), b"last".to_vec()]
        );
    }

    #[test]
    fn test_line_frames_are_opaque_bytes() {
        let input = b"ok\n\xFF\xFE\nafter\n".to_vec();
        assert_eq!(
            frames(LineFrameReader::new(Cursor::new(input))),
            vec![b"ok".to_vec(), vec![0xFF, 0xFE], b"after".to_vec()]
        );
    }

    #[test]
    fn test_huge_line_skipped_in_small_buffer() {
        let mut input = vec![b'y'; 10 * MAX_PAYLOAD_LEN];
        input.extend_from_slice(b"\nnext\n");
        let reader = io::BufReader::with_capacity(64, Cursor::new(input));

        let mut source = LineFrameReader::new(reader);
        let capacity = source.line.capacity();
        assert_eq!(source.next_frame().unwrap(), Some(Bytes::from_static(b"next")));
        // Never grew to hold the oversized line
        assert_eq!(source.line.capacity(), capacity);
        assert_eq!(source.next_frame().unwrap(), None);
    }

    #[test]
    fn test_producer_keeps_running_past_binary_lines() {
        let queue = Arc::new(MessageQueue::new("outbound", 5));
        let status = ConnectionStatus::new();
        status.set(SessionState::Connected);
        let producer = Producer::new(
            LineFrameReader::new(Cursor::new(b"ok\n\xFF\xFE\nafter\n".to_vec())),
            queue.clone(),
            status,
            "mico/test/send",
        );

        producer.run();

        let payloads: Vec<Vec<u8>> = std::iter::from_fn(|| queue.try_pop())
            .map(|m| m.payload().to_vec())
            .collect();
        assert_eq!(payloads, vec![b"ok".to_vec(), vec![0xFF, 0xFE], b"after".to_vec()]);
    }

    fn producer(
        input: &str,
        queue: &Arc<MessageQueue>,
        status: &ConnectionStatus,
    ) -> Producer<LineFrameReader<Cursor<String>>> {
        Producer::new(
            LineFrameReader::new(Cursor::new(input.to_string())),
            queue.clone(),
            status.clone(),
            "mico/test/send",
        )
    }

    #[test]
    fn test_producer_drops_while_offline() {
        let queue = Arc::new(MessageQueue::new("outbound", 5));
        let status = ConnectionStatus::new();
        let mut producer = producer("a\nb\n", &queue, &status);

        assert_eq!(producer.pump_once().unwrap(), PumpOutcome::Offline);
        assert!(queue.is_empty());

        status.set(SessionState::Connected);
        assert_eq!(producer.pump_once().unwrap(), PumpOutcome::Queued);
        assert_eq!(producer.pump_once().unwrap(), PumpOutcome::EndOfStream);

        let message = queue.try_pop().unwrap();
        assert_eq!(message.topic(), "mico/test/send");
        assert_eq!(&message.payload()[..], b"b");
        assert_eq!(message.qos(), QoS::AtMostOnce);
    }

    #[test]
    fn test_producer_drops_when_queue_full() {
        let queue = Arc::new(MessageQueue::new("outbound", 1));
        let status = ConnectionStatus::new();
        status.set(SessionState::Connected);
        let mut producer = producer("a\nb\n", &queue, &status).with_retain(true);

        assert_eq!(producer.pump_once().unwrap(), PumpOutcome::Queued);
        assert_eq!(producer.pump_once().unwrap(), PumpOutcome::Dropped);
        assert_eq!(queue.dropped(), 1);
        assert!(queue.try_pop().unwrap().retained());
    }

    #[test]
    fn test_poller_writes_poll_command() {
        let mut poller = SensorPoller::new(Vec::new(), DEFAULT_POLL_INTERVAL);
        poller.poll_once().unwrap();
        poller.poll_once().unwrap();
        assert_eq!(poller.writer, [POLL_COMMAND, POLL_COMMAND].concat());
    }
}
