//! Newline-delimited reading of raw log streams.

use std::io;

use futures_util::io::{AsyncBufRead, AsyncBufReadExt};
use futures_util::stream::{self, BoxStream};

/// Turn a buffered byte stream into log lines of at most `max_line_bytes`.
///
/// Strips `\n` and `\r\n`, replaces invalid UTF-8, yields a trailing line
/// without a newline, and ends after the first read error. A line longer
/// than the limit comes out as several consecutive pieces; a UTF-8 sequence
/// cut by the limit is carried over to the next piece, so concatenating the
/// pieces gives back the original line.
pub fn lines_lossy<'a, R>(reader: R, max_line_bytes: usize) -> BoxStream<'a, io::Result<String>>
where
    R: AsyncBufRead + Unpin + Send + 'a,
{
    let max = max_line_bytes.max(4);

    Box::pin(stream::unfold(
        (Some(reader), Vec::new()),
        move |(reader, mut buf)| async move {
            let mut reader = reader?;

            match read_bounded(&mut reader, &mut buf, max).await {
                Ok(0) if buf.is_empty() => None,
                Ok(_) => {
                    let carry = if buf.last() == Some(&b'\n') {
                        buf.pop();
                        if buf.last() == Some(&b'\r') {
                            buf.pop();
                        }
                        Vec::new()
                    } else if buf.len() >= max {
                        split_incomplete_tail(&mut buf)
                    } else {
                        Vec::new()
                    };
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    Some((Ok(line), (Some(reader), carry)))
                }
                Err(e) => Some((Err(e), (None, Vec::new()))),
            }
        },
    ))
}

/// Append to `buf` up to and including the next `\n`, stopping once `buf`
/// holds `max` bytes. Returns the number of bytes read; 0 means end of input.
async fn read_bounded<R>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut read = 0;
    while buf.len() < max {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            break;
        }

        let window = &available[..available.len().min(max - buf.len())];
        let (used, found) = match window.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => (window.len(), false),
        };
        buf.extend_from_slice(&window[..used]);
        reader.consume_unpin(used);
        read += used;

        if found {
            break;
        }
    }
    Ok(read)
}

/// Remove and return a UTF-8 sequence left incomplete at the end of `buf`
/// by the length limit.
fn split_incomplete_tail(buf: &mut Vec<u8>) -> Vec<u8> {
    match std::str::from_utf8(buf) {
        Err(e) if e.error_len().is_none() => buf.split_off(e.valid_up_to()),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use futures::io::Cursor;

    const LIMIT: usize = 1024;

    async fn collect(input: &[u8], max: usize) -> Vec<String> {
        lines_lossy(Cursor::new(input.to_vec()), max)
            .map(|line| line.unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_splits_and_strips_newlines() {
        let lines = collect(b"first\r\nsecond\n\nlast", LIMIT).await;
        assert_eq!(lines, vec!["first", "second", "", "last"]);
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_replaced() {
        let reader = Cursor::new(b"ok \xff\xfe end\n".to_vec());
        let mut lines = lines_lossy(reader, LIMIT);

        let line = lines.next().await.unwrap().unwrap();
        assert_eq!(line, "ok \u{fffd}\u{fffd} end");
        assert!(lines.next().await.is_none());
    }

    #[tokio::test]
    async fn test_empty_input_ends_immediately() {
        let mut lines = lines_lossy(Cursor::new(Vec::new()), LIMIT);
        assert!(lines.next().await.is_none());
    }

    #[tokio::test]
    async fn test_unterminated_input_is_bounded() {
        let input = "x".repeat(100);
        let lines = collect(input.as_bytes(), 16).await;

        assert!(lines.iter().all(|line| line.len() <= 16));
        assert_eq!(lines.len(), 7);
        assert_eq!(lines.concat(), input);
    }

    #[tokio::test]
    async fn test_long_line_then_next_line() {
        let lines = collect(b"0123456789abcdef\nnext\n", 10).await;
        assert_eq!(lines, vec!["0123456789", "abcdef", "next"]);
    }

    #[tokio::test]
    async fn test_cut_inside_multibyte_char_is_carried_over() {
        // Each '€' is three bytes, so a 10-byte limit lands inside the fourth.
        let input = "€".repeat(6);
        let lines = collect(input.as_bytes(), 10).await;

        assert!(lines.iter().all(|line| !line.contains('\u{fffd}')));
        assert_eq!(lines, vec!["€€€", "€€€"]);
        assert_eq!(lines.concat(), input);
    }
}
