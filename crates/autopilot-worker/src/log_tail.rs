use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncSeekExt};

const TAIL_WINDOW_BYTES: u64 = 1024 * 1024;

fn split_lines_from_tail(buf: &[u8], max_lines: usize) -> Vec<String> {
    // Best-effort UTF-8: drop invalid sequences.
    let text = String::from_utf8_lossy(buf);

    // The log stores the first redraw of each progress run `\r`-terminated,
    // so `\r` ends a line here too; a `\r\n` pair counts once.
    let mut out: Vec<String> = Vec::new();
    let mut prev_cr = false;
    for seg in text.split_inclusive(['\n', '\r']) {
        if prev_cr && seg == "\n" {
            prev_cr = false;
            continue;
        }
        prev_cr = seg.ends_with('\r');
        out.push(seg.trim_end_matches(['\n', '\r']).to_string());
    }

    if out.len() > max_lines {
        out.drain(0..(out.len() - max_lines));
    }
    out
}

/// Last `max_lines` lines of the run log, read from a bounded byte window at
/// the end of the file so a large log never gets loaded whole. A missing file
/// is an empty log, not an error: the bot may simply not have run yet.
pub async fn tail_log(path: &Path, max_lines: usize) -> std::io::Result<Vec<String>> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let size = meta.len();
    let start = size.saturating_sub(TAIL_WINDOW_BYTES);
    let to_read = (size - start) as usize;

    let mut f = tokio::fs::File::open(path).await?;
    f.seek(std::io::SeekFrom::Start(start)).await?;

    let mut buf = vec![0u8; to_read];
    if to_read > 0 {
        f.read_exact(&mut buf).await?;
    }

    Ok(split_lines_from_tail(&buf, max_lines))
}
