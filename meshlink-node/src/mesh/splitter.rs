//! Outbound text chunking.
//!
//! Radio text payloads are capped at [`MAX_CHUNK`] bytes. Longer messages are
//! split on UTF-8 boundaries and labelled `[i/N] ` so readers can reassemble
//! them; the transport inserts [`CHUNK_SPACING`] between sends so the radio's
//! transmit queue is not overrun.
use std::time;

/// Hard cap on a single outbound text payload, in bytes.
pub const MAX_CHUNK: usize = 200;
/// Minimum spacing between chunk sends.
pub const CHUNK_SPACING: time::Duration = time::Duration::from_millis(500);

/// Split `text` into chunks of at most [`MAX_CHUNK`] bytes.
///
/// Single-chunk messages are returned unlabelled. Multi-chunk messages carry
/// a `[i/N] ` prefix, and concatenating the chunk bodies (prefixes stripped)
/// yields the input exactly.
pub fn split(text: &str) -> Vec<String> {
    if text.len() <= MAX_CHUNK {
        return vec![text.to_owned()];
    }

    // The prefix steals from the chunk budget, and its width depends on the
    // final chunk count. Start with a one-digit assumption and redo the split
    // until the digit width stops growing; the budget only shrinks, so this
    // terminates.
    let mut digits = 1;
    loop {
        let budget = MAX_CHUNK - prefix_width(digits);
        let bodies = split_bodies(text, budget);
        let actual = decimal_digits(bodies.len());

        if actual <= digits {
            let total = bodies.len();
            return bodies
                .into_iter()
                .enumerate()
                .map(|(i, body)| format!("[{}/{}] {}", i + 1, total, body))
                .collect();
        }
        digits = actual;
    }
}

/// Byte width of a `[i/N] ` prefix where both numbers have up to `digits` digits.
fn prefix_width(digits: usize) -> usize {
    // '[' + i + '/' + N + ']' + ' '
    4 + 2 * digits
}

fn decimal_digits(mut n: usize) -> usize {
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    digits
}

/// Split on UTF-8 character boundaries into bodies of at most `budget` bytes.
fn split_bodies(text: &str, budget: usize) -> Vec<String> {
    let mut bodies = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        let mut cut = rest.len().min(budget);
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let (body, tail) = rest.split_at(cut);
        bodies.push(body.to_owned());
        rest = tail;
    }
    bodies
}

/// Strip the `[i/N] ` prefix from a chunk, if present.
pub fn strip_label(chunk: &str) -> &str {
    let Some(rest) = chunk.strip_prefix('[') else {
        return chunk;
    };
    let Some((label, body)) = rest.split_once("] ") else {
        return chunk;
    };
    match label.split_once('/') {
        Some((i, n))
            if !i.is_empty()
                && !n.is_empty()
                && i.bytes().all(|b| b.is_ascii_digit())
                && n.bytes().all(|b| b.is_ascii_digit()) =>
        {
            body
        }
        _ => chunk,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use qcheck_macros::quickcheck;

    #[test]
    fn test_short_text_is_untouched() {
        assert_eq!(split("hello"), vec!["hello".to_owned()]);
        let exact = "x".repeat(MAX_CHUNK);
        assert_eq!(split(&exact), vec![exact.clone()]);
    }

    #[test]
    fn test_long_text_is_labelled() {
        let text = "a".repeat(MAX_CHUNK + 1);
        let chunks = split(&text);

        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].starts_with("[1/2] "));
        assert!(chunks[1].starts_with("[2/2] "));
        for chunk in &chunks {
            assert!(chunk.len() <= MAX_CHUNK);
        }
    }

    #[test]
    fn test_reassembly() {
        let text = "The quick brown fox jumps over the lazy dog. ".repeat(20);
        let chunks = split(&text);
        let rebuilt: String = chunks.iter().map(|c| strip_label(c)).collect();

        assert_eq!(rebuilt, text);
    }

    #[test]
    fn test_multibyte_boundaries() {
        let text = "départ⇒arrivée ".repeat(40);
        let chunks = split(&text);

        for chunk in &chunks {
            assert!(chunk.len() <= MAX_CHUNK);
            assert!(std::str::from_utf8(chunk.as_bytes()).is_ok());
        }
        let rebuilt: String = chunks.iter().map(|c| strip_label(c)).collect();
        assert_eq!(rebuilt, text);
    }

    #[test]
    fn test_strip_label_leaves_plain_text() {
        assert_eq!(strip_label("no label"), "no label");
        assert_eq!(strip_label("[not/num] x"), "[not/num] x");
        assert_eq!(strip_label("[3/9] body"), "body");
    }

    #[quickcheck]
    fn prop_chunks_fit_and_reassemble(words: Vec<String>) {
        let text = words.join(" ");
        if text.is_empty() {
            return;
        }
        let chunks = split(&text);

        for chunk in &chunks {
            assert!(chunk.len() <= MAX_CHUNK, "chunk too large: {}", chunk.len());
        }
        let rebuilt: String = chunks.iter().map(|c| strip_label(c)).collect();
        assert_eq!(rebuilt, text);
    }
}
