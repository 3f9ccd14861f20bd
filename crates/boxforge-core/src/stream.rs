//! Copy loops between container streams and the host.

use std::io::{self, Read, Write};
use tokio_util::sync::CancellationToken;

const HEADER_LEN: usize = 8;
const COPY_CHUNK: usize = 8 * 1024;

/// Split a framed engine stream into stdout and stderr.
///
/// Each frame is an 8-byte header `[stream, 0, 0, 0, len_be_u32]` followed by
/// `len` payload bytes. Stream 0 (stdin echo) and 1 go to `stdout`, 2 to
/// `stderr`. End of input on a frame boundary is a clean finish; anywhere
/// else it is `UnexpectedEof`. Once `stop` is cancelled the loop ends without
/// error.
pub fn demultiplex(
    src: &mut impl Read,
    stdout: &mut impl Write,
    stderr: &mut impl Write,
    stop: &CancellationToken,
) -> io::Result<()> {
    let mut header = [0u8; HEADER_LEN];
    loop {
        if stop.is_cancelled() {
            return Ok(());
        }
        match next_frame(src, stdout, stderr, &mut header) {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(_) if stop.is_cancelled() => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

/// The payload is copied through in chunks, so a corrupt length never turns
/// into a large allocation.
fn next_frame(
    src: &mut impl Read,
    stdout: &mut impl Write,
    stderr: &mut impl Write,
    header: &mut [u8; HEADER_LEN],
) -> io::Result<bool> {
    if !read_header(src, header)? {
        return Ok(false);
    }
    let dst: &mut dyn Write = match header[0] {
        0 | 1 => stdout,
        2 => stderr,
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown stream id {other} in container output"),
            ))
        }
    };
    let len = u64::from(u32::from_be_bytes([header[4], header[5], header[6], header[7]]));
    let copied = io::copy(&mut src.by_ref().take(len), &mut *dst)?;
    if copied < len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("frame payload ended after {copied} of {len} bytes"),
        ));
    }
    dst.flush()?;
    Ok(true)
}

/// `Ok(false)` on end of input before the first header byte.
fn read_header(src: &mut impl Read, header: &mut [u8; HEADER_LEN]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < HEADER_LEN {
        match src.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated frame header",
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// Copy `src` into `dst` until end of input or until `stop` is cancelled.
///
/// `WouldBlock` and `Interrupted` reads are retried, which lets a polling
/// reader hand control back between chunks. Returns the bytes copied.
pub fn copy_until_stopped(
    src: &mut impl Read,
    dst: &mut impl Write,
    stop: &CancellationToken,
) -> io::Result<u64> {
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut total = 0u64;
    loop {
        if stop.is_cancelled() {
            return Ok(total);
        }
        let n = match src.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                continue
            }
            Err(_) if stop.is_cancelled() => return Ok(total),
            Err(e) => return Err(e),
        };
        if let Err(e) = dst.write_all(&buf[..n]).and_then(|()| dst.flush()) {
            if stop.is_cancelled() {
                return Ok(total);
            }
            return Err(e);
        }
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boxforge_engine::frame;
    use std::io::Cursor;

    fn demux(input: Vec<u8>) -> (io::Result<()>, Vec<u8>, Vec<u8>) {
        let (mut out, mut err) = (Vec::new(), Vec::new());
        let result = demultiplex(
            &mut Cursor::new(input),
            &mut out,
            &mut err,
            &CancellationToken::new(),
        );
        (result, out, err)
    }

    #[test]
    fn routes_frames_by_stream_id() {
        let mut input = frame(1, b"out ");
        input.extend(frame(2, b"err"));
        input.extend(frame(0, b"echo"));
        input.extend(frame(1, b""));

        let (result, out, err) = demux(input);
        result.unwrap();
        assert_eq!(out, b"out echo");
        assert_eq!(err, b"err");
    }

    #[test]
    fn empty_stream_is_clean() {
        let (result, out, _) = demux(Vec::new());
        result.unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn unknown_stream_is_invalid_data() {
        let (result, _, _) = demux(frame(3, b"x"));
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn bad_stream_id_rejected_before_payload() {
        // The length field here decodes to ~1.6 GB.
        let (result, out, err) = demux(b"\x07\x00\x00\x00bage".to_vec());
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidData);
        assert!(out.is_empty() && err.is_empty());
    }

    #[test]
    fn oversized_length_copies_what_arrives() {
        let mut input = vec![1, 0, 0, 0, 0xff, 0xff, 0xff, 0xff];
        input.extend_from_slice(b"abc");
        let (result, out, _) = demux(input);
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(out, b"abc");
    }

    #[test]
    fn truncation_is_unexpected_eof() {
        let mut short_payload = frame(1, b"hello");
        short_payload.truncate(10);
        let (result, _, _) = demux(short_payload);
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::UnexpectedEof);

        let (result, _, _) = demux(vec![1, 0, 0]);
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn stopped_demux_writes_nothing() {
        let stop = CancellationToken::new();
        stop.cancel();
        let mut out = Vec::new();
        demultiplex(
            &mut Cursor::new(frame(1, b"late")),
            &mut out,
            &mut io::sink(),
            &stop,
        )
        .unwrap();
        assert!(out.is_empty());
    }

    struct Flaky {
        stalls: usize,
        data: Cursor<Vec<u8>>,
    }

    impl Read for Flaky {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.stalls > 0 {
                self.stalls -= 1;
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.data.read(buf)
        }
    }

    #[test]
    fn copy_retries_would_block() {
        let mut src = Flaky {
            stalls: 3,
            data: Cursor::new(b"typed input".to_vec()),
        };
        let mut dst = Vec::new();
        let n = copy_until_stopped(&mut src, &mut dst, &CancellationToken::new()).unwrap();
        assert_eq!(n, 11);
        assert_eq!(dst, b"typed input");
    }

    #[test]
    fn copy_stops_on_cancel() {
        let stop = CancellationToken::new();
        stop.cancel();
        let mut dst = Vec::new();
        let n = copy_until_stopped(&mut Cursor::new(b"abc".to_vec()), &mut dst, &stop).unwrap();
        assert_eq!(n, 0);
        assert!(dst.is_empty());
    }
}
