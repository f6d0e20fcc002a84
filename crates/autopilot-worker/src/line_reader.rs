use tokio::io::{AsyncRead, AsyncReadExt};

const READ_CHUNK: usize = 4096;

/// Reconstructs logical lines from a raw child-process byte stream.
///
/// Terminal output treats `\r` as a line terminator too: progress indicators
/// redraw one visual line by emitting many `\r`-terminated updates. Splitting
/// on both `\n` and `\r` captures those updates as lines, and the carriage
/// flag collapses each contiguous run of `\r` lines down to its first one so
/// a progress bar does not flood the log with thousands of redraws.
///
/// Emitted lines keep their terminator byte, so an appender can write them
/// as-is. The stream is finite and non-restartable; `next_line` returns
/// `None` once the underlying reader hits EOF.
pub struct LineReader<R> {
    inner: R,
    buf: Vec<u8>,
    eof: bool,
    is_carriage: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            eof: false,
            is_carriage: false,
        }
    }

    /// Next raw line, terminated by `\n` or `\r`. A partial line at EOF is
    /// returned without a terminator; after that, `None`.
    async fn read_line(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n' || b == b'\r') {
                let rest = self.buf.split_off(pos + 1);
                let line = std::mem::replace(&mut self.buf, rest);
                return Ok(Some(line));
            }

            if self.eof {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(std::mem::take(&mut self.buf)));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                self.eof = true;
            } else {
                self.buf.extend_from_slice(&chunk[..n]);
            }
        }
    }

    /// Next line to emit, with carriage-run collapsing applied.
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        while let Some(raw) = self.read_line().await? {
            // Best-effort UTF-8, as real agent output can interleave escape
            // sequences with multi-byte characters.
            let line = String::from_utf8_lossy(&raw).into_owned();
            if line.contains('\r') {
                if self.is_carriage {
                    continue;
                }
                self.is_carriage = true;
                return Ok(Some(line));
            }
            self.is_carriage = false;
            return Ok(Some(line));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use tokio::io::ReadBuf;

    /// Serves predefined chunks one `poll_read` at a time, mimicking the
    /// arbitrary chunking of a real pipe.
    struct ChunkReader {
        chunks: VecDeque<Vec<u8>>,
    }

    impl ChunkReader {
        fn new<I: IntoIterator<Item = &'static str>>(chunks: I) -> Self {
            Self {
                chunks: chunks.into_iter().map(|c| c.as_bytes().to_vec()).collect(),
            }
        }
    }

    impl AsyncRead for ChunkReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            if let Some(chunk) = self.chunks.pop_front() {
                buf.put_slice(&chunk);
            }
            Poll::Ready(Ok(()))
        }
    }

    async fn collect(reader: &mut LineReader<ChunkReader>) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(line) = reader.next_line().await.unwrap() {
            out.push(line);
        }
        out
    }

    #[tokio::test]
    async fn splits_on_newline() {
        let mut r = LineReader::new(ChunkReader::new(["one\ntwo\n", "three\n"]));
        assert_eq!(collect(&mut r).await, vec!["one\n", "two\n", "three\n"]);
    }

    #[tokio::test]
    async fn partial_line_at_eof_is_returned() {
        let mut r = LineReader::new(ChunkReader::new(["one\ntwo"]));
        assert_eq!(collect(&mut r).await, vec!["one\n", "two"]);
    }

    #[tokio::test]
    async fn collapses_carriage_redraw_runs() {
        let mut r = LineReader::new(ChunkReader::new(["10%\r", "20%\r", "30%\r", "done\n"]));
        // First redraw and final state survive; the middle redraws are
        // suppressed while the carriage flag is set.
        assert_eq!(collect(&mut r).await, vec!["10%\r", "done\n"]);
    }

    #[tokio::test]
    async fn newline_clears_carriage_suppression() {
        let mut r = LineReader::new(ChunkReader::new([
            "10%\r", "20%\r", "step done\n", "30%\r", "40%\r", "all done\n",
        ]));
        assert_eq!(
            collect(&mut r).await,
            vec!["10%\r", "step done\n", "30%\r", "all done\n"]
        );
    }

    #[tokio::test]
    async fn line_boundaries_survive_arbitrary_chunking() {
        let mut r = LineReader::new(ChunkReader::new(["do", "wnloading", "\r", "50", "%\r", "ok\n"]));
        assert_eq!(collect(&mut r).await, vec!["downloading\r", "ok\n"]);
    }

    #[tokio::test]
    async fn empty_stream_yields_nothing() {
        let mut r = LineReader::new(ChunkReader::new([]));
        assert!(collect(&mut r).await.is_empty());
    }

    #[tokio::test]
    async fn lone_carriage_run_emits_first_then_eof() {
        let mut r = LineReader::new(ChunkReader::new(["a\r", "b\r", "c\r"]));
        assert_eq!(collect(&mut r).await, vec!["a\r"]);
    }
}
