use std::{
    io::Write,
    time::{Duration, Instant},
};

const EMIT_INTERVAL: Duration = Duration::from_millis(300);

fn download_chunk_threshold(total_bytes: u64) -> u64 {
    if total_bytes >= 2 * 1024 * 1024 * 1024 {
        8 * 1024 * 1024
    } else if total_bytes >= 512 * 1024 * 1024 {
        4 * 1024 * 1024
    } else {
        1024 * 1024
    }
}

/// `%10d  [%3.2f%%]`, the percentage omitted when the size is unknown.
pub fn format_status(downloaded_bytes: u64, total_bytes: Option<u64>) -> String {
    match total_bytes.filter(|t| *t > 0) {
        Some(total) => {
            let pct = downloaded_bytes as f64 * 100.0 / total as f64;
            format!("{downloaded_bytes:>10}  [{pct:>3.2}%]")
        }
        None => format!("{downloaded_bytes:>10}"),
    }
}

/// Redraws a single progress line on stdout while a download streams in.
pub struct ProgressLine<W: Write> {
    out: W,
    total_bytes: Option<u64>,
    threshold: u64,
    downloaded_bytes: u64,
    last_emit_bytes: u64,
    last_emit_at: Instant,
    emitted: u32,
}

impl ProgressLine<std::io::Stdout> {
    pub fn stdout(total_bytes: Option<u64>) -> Self {
        Self::new(std::io::stdout(), total_bytes)
    }
}

impl<W: Write> ProgressLine<W> {
    pub fn new(out: W, total_bytes: Option<u64>) -> Self {
        Self {
            out,
            total_bytes,
            threshold: download_chunk_threshold(total_bytes.unwrap_or(0).max(1)),
            downloaded_bytes: 0,
            last_emit_bytes: 0,
            last_emit_at: Instant::now(),
            emitted: 0,
        }
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded_bytes
    }

    pub fn redraws(&self) -> u32 {
        self.emitted
    }

    pub fn advance(&mut self, chunk_len: usize) {
        self.advance_at(chunk_len, Instant::now());
    }

    fn advance_at(&mut self, chunk_len: usize, now: Instant) {
        self.downloaded_bytes = self.downloaded_bytes.saturating_add(chunk_len as u64);
        let should_emit = self.downloaded_bytes.saturating_sub(self.last_emit_bytes)
            >= self.threshold
            || now.duration_since(self.last_emit_at) >= EMIT_INTERVAL;
        if should_emit {
            self.emit();
            self.last_emit_bytes = self.downloaded_bytes;
            self.last_emit_at = now;
        }
    }

    /// Final redraw, then move off the progress line.
    pub fn finish(mut self) -> W {
        self.emit();
        let _ = writeln!(self.out);
        let _ = self.out.flush();
        self.out
    }

    fn emit(&mut self) {
        let status = format_status(self.downloaded_bytes, self.total_bytes);
        // Backspaces park the cursor at the line start for the next redraw.
        let rewind = "\u{8}".repeat(status.len() + 1);
        let _ = write!(self.out, "{status}{rewind}");
        let _ = self.out.flush();
        self.emitted += 1;
    }
}
