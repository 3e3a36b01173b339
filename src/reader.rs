//! Bounded reading of a child's stdout or stderr.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::accumulator::{ChunkAccumulator, Encoding};
use crate::kill::KillSwitch;

const READ_CHUNK: usize = 8 * 1024;

/// Which captured stream a value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamName {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamName::Stdout => f.write_str("stdout"),
            StreamName::Stderr => f.write_str("stderr"),
        }
    }
}

/// Maximum number of bytes retained per captured stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteCap {
    Unbounded,
    Limited(usize),
}

/// Default cap: 1 MiB per stream.
pub const DEFAULT_MAX_BUFFER: ByteCap = ByteCap::Limited(1024 * 1024);

impl Default for ByteCap {
    fn default() -> Self {
        DEFAULT_MAX_BUFFER
    }
}

/// Feeds one stream into a [`ChunkAccumulator`] and enforces the byte cap.
pub struct BoundedReader<R> {
    stream: R,
    name: StreamName,
    cap: ByteCap,
    chunks: ChunkAccumulator,
    frozen: bool,
    switch: Arc<KillSwitch>,
}

impl<R: AsyncRead + Unpin> BoundedReader<R> {
    pub fn new(
        stream: R,
        name: StreamName,
        cap: ByteCap,
        encoding: Encoding,
        switch: Arc<KillSwitch>,
    ) -> Self {
        Self {
            stream,
            name,
            cap,
            chunks: ChunkAccumulator::new(encoding),
            frozen: false,
            switch,
        }
    }

    /// Read until end of stream, or until the switch halts.
    ///
    /// After an overflow the stream is still drained, but nothing more is
    /// kept, so a child that survives the kill signal cannot block on a full
    /// pipe. Once the child is reaped the switch halts and the pipe end is
    /// dropped here, leaving leftover writers with `EPIPE`.
    pub async fn run(mut self) -> std::io::Result<ChunkAccumulator> {
        let mut buf = vec![0u8; READ_CHUNK];
        let mut halted = self.switch.halted();
        let name = self.name;
        loop {
            let n = tokio::select! {
                read = self.stream.read(&mut buf) => read?,
                Ok(_) = halted.wait_for(|halted| *halted) => {
                    debug!(stream = %name, "closing pipe after overflow");
                    break;
                }
            };
            if n == 0 {
                break;
            }
            self.push(&buf[..n]);
        }
        Ok(self.chunks)
    }

    fn push(&mut self, chunk: &[u8]) {
        if self.frozen {
            return;
        }
        let cap = match self.cap {
            ByteCap::Unbounded => {
                self.chunks.append(chunk);
                return;
            }
            ByteCap::Limited(cap) => cap,
        };
        let available = cap.saturating_sub(self.chunks.byte_len());
        if chunk.len() > available {
            self.chunks.append(&chunk[..available]);
            self.frozen = true;
            self.switch.record_overflow(self.name);
        } else {
            self.chunks.append(chunk);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::{Output, TextEncoding};
    use nix::sys::signal::Signal;
    use std::time::Duration;

    const UTF8: Encoding = Encoding::Text(TextEncoding::Utf8);

    fn switch() -> Arc<KillSwitch> {
        Arc::new(KillSwitch::new(Signal::SIGTERM))
    }

    fn reader<'a>(
        data: &'a [u8],
        name: StreamName,
        cap: ByteCap,
        switch: &Arc<KillSwitch>,
    ) -> BoundedReader<&'a [u8]> {
        BoundedReader::new(data, name, cap, UTF8, Arc::clone(switch))
    }

    #[tokio::test]
    async fn unbounded_keeps_everything() {
        let data = vec![b'x'; 3 * READ_CHUNK + 5];
        let switch = switch();
        let chunks = reader(&data, StreamName::Stdout, ByteCap::Unbounded, &switch)
            .run()
            .await
            .unwrap();
        assert_eq!(chunks.byte_len(), data.len());
        assert_eq!(switch.overflow(), None);
    }

    #[tokio::test]
    async fn output_at_cap_is_kept_whole() {
        let switch = switch();
        let chunks = reader(b"exactly17bytes!!!", StreamName::Stdout, ByteCap::Limited(17), &switch)
            .run()
            .await
            .unwrap();
        assert_eq!(chunks.finalize(), Output::Text("exactly17bytes!!!".into()));
        assert_eq!(switch.overflow(), None);
    }

    #[tokio::test]
    async fn overflow_truncates_to_cap_and_records_stream() {
        let switch = switch();
        let data = b"012345678901234567890123456789";
        let chunks = reader(data, StreamName::Stdout, ByteCap::Limited(17), &switch)
            .run()
            .await
            .unwrap();
        assert_eq!(chunks.byte_len(), 17);
        assert_eq!(chunks.finalize(), Output::Text("01234567890123456".into()));
        assert_eq!(switch.overflow(), Some(StreamName::Stdout));
    }

    #[tokio::test]
    async fn cap_counts_encoded_bytes() {
        let switch = switch();
        // "Stö" is four bytes; a cap of three cuts inside the two-byte "ö".
        let chunks = reader("Stö".as_bytes(), StreamName::Stderr, ByteCap::Limited(3), &switch)
            .run()
            .await
            .unwrap();
        assert_eq!(chunks.byte_len(), 3);
        assert_eq!(switch.overflow(), Some(StreamName::Stderr));
    }

    #[tokio::test]
    async fn zero_cap_overflows_on_first_byte() {
        let switch = switch();
        let chunks = reader(b"a", StreamName::Stdout, ByteCap::Limited(0), &switch)
            .run()
            .await
            .unwrap();
        assert_eq!(chunks.byte_len(), 0);
        assert_eq!(switch.overflow(), Some(StreamName::Stdout));
    }

    #[tokio::test]
    async fn zero_cap_with_no_output_is_fine() {
        let switch = switch();
        let chunks = reader(b"", StreamName::Stdout, ByteCap::Limited(0), &switch)
            .run()
            .await
            .unwrap();
        assert_eq!(chunks.byte_len(), 0);
        assert_eq!(switch.overflow(), None);
    }

    #[tokio::test]
    async fn first_overflow_across_streams_wins() {
        let switch = switch();
        reader(b"too much on stderr", StreamName::Stderr, ByteCap::Limited(4), &switch)
            .run()
            .await
            .unwrap();
        let out = reader(b"too much on stdout", StreamName::Stdout, ByteCap::Limited(4), &switch)
            .run()
            .await
            .unwrap();
        assert_eq!(out.byte_len(), 4);
        assert_eq!(switch.overflow(), Some(StreamName::Stderr));
    }

    #[tokio::test]
    async fn halt_releases_a_reader_whose_writer_stays_open() {
        let switch = switch();
        let (_writer, stream) = tokio::io::duplex(64);
        let task = tokio::spawn(
            BoundedReader::new(stream, StreamName::Stderr, ByteCap::Limited(4), UTF8, Arc::clone(&switch))
                .run(),
        );
        switch.record_overflow(StreamName::Stdout);
        switch.finalize();

        let chunks = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("reader stopped")
            .unwrap()
            .unwrap();
        assert_eq!(chunks.byte_len(), 0);
    }

    #[test]
    fn chunk_after_freeze_is_dropped() {
        let switch = switch();
        let mut r = BoundedReader::new(&b""[..], StreamName::Stdout, ByteCap::Limited(5), UTF8, switch);
        r.push(b"abc");
        r.push(b"defg");
        r.push(b"h");
        assert_eq!(r.chunks.byte_len(), 5);
        assert_eq!(r.chunks.finalize(), Output::Text("abcde".into()));
    }
}
