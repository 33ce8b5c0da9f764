//! Log line chunking and timestamp parsing.
//!
//! Container runtimes prefix each line with an RFC 3339 timestamp when the log
//! stream is opened with timestamps enabled. Lines are cut into bounded chunks
//! before they reach subscribers, and each chunk is parsed on its own, so only
//! the first chunk of a long line normally carries the real timestamp. Later
//! chunks come out with an empty timestamp unless they happen to contain
//! whitespace, which is expected.

/// Maximum bytes per emitted chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Maximum bytes read from a log stream before a line is cut.
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

/// Split `line` into consecutive slices of at most `size` bytes.
///
/// Cuts never land inside a UTF-8 sequence: a cut is moved back to the previous
/// char boundary, and a char wider than `size` becomes a slice of its own. A
/// line no longer than `size` (the empty line included) yields one slice.
/// Joining the slices in order gives back `line`.
pub fn chunk_line(line: &str, size: usize) -> Vec<&str> {
    let size = size.max(1);
    if line.len() <= size {
        return vec![line];
    }

    let mut chunks = Vec::with_capacity(line.len() / size + 1);
    let mut rest = line;

    while rest.len() > size {
        let mut cut = size;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        if cut == 0 {
            // First char is wider than `size`.
            cut = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        let (head, tail) = rest.split_at(cut);
        chunks.push(head);
        rest = tail;
    }

    if !rest.is_empty() {
        chunks.push(rest);
    }
    chunks
}

/// Split a chunk into `(timestamp, message)` at its first whitespace char.
///
/// A chunk without whitespace is all message: `("", chunk)`.
pub fn parse_chunk(chunk: &str) -> (&str, &str) {
    chunk.split_once(char::is_whitespace).unwrap_or(("", chunk))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_line_is_single_chunk() {
        assert_eq!(chunk_line("hello", 10), vec!["hello"]);
        assert_eq!(chunk_line("exactly10!", 10), vec!["exactly10!"]);
        assert_eq!(chunk_line("", 10), vec![""]);
    }

    #[test]
    fn test_long_line_reassembles() {
        let line = "2024-01-01T00:00:00Z ".to_string() + &"x".repeat(2500);
        let chunks = chunk_line(&line, DEFAULT_CHUNK_SIZE);

        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() <= DEFAULT_CHUNK_SIZE));
        assert_eq!(chunks.concat(), line);
    }

    #[test]
    fn test_exact_multiple_has_no_empty_tail() {
        let line = "ab".repeat(6);
        let chunks = chunk_line(&line, 4);
        assert_eq!(chunks, vec!["abab", "abab", "abab"]);
    }

    #[test]
    fn test_multibyte_cut_moves_to_boundary() {
        let line = "aé€😀b";
        for size in 1..=line.len() {
            let chunks = chunk_line(line, size);
            assert_eq!(chunks.concat(), line, "size {size}");
            assert!(chunks.iter().all(|c| !c.is_empty()));
        }
        assert_eq!(chunk_line(line, 3), vec!["aé", "€", "😀", "b"]);
    }

    #[test]
    fn test_zero_size_still_progresses() {
        assert_eq!(chunk_line("abc", 0), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_parse_splits_first_token() {
        assert_eq!(
            parse_chunk("2024-01-01T00:00:00.000Z server started on :8080"),
            ("2024-01-01T00:00:00.000Z", "server started on :8080")
        );
        assert_eq!(parse_chunk("ts\tmessage"), ("ts", "message"));
        assert_eq!(parse_chunk("ts "), ("ts", ""));
    }

    #[test]
    fn test_parse_without_whitespace() {
        assert_eq!(parse_chunk("xxxxxxxx"), ("", "xxxxxxxx"));
        assert_eq!(parse_chunk(""), ("", ""));
    }

    #[test]
    fn test_continuation_chunk_degrades_to_empty_timestamp() {
        let line = format!("2024-01-01T00:00:00Z {}", "y".repeat(30));
        let chunks = chunk_line(&line, 25);
        assert_eq!(parse_chunk(chunks[0]).0, "2024-01-01T00:00:00Z");
        assert_eq!(parse_chunk(chunks[1]), ("", chunks[1]));
    }
}
