use anyhow::Result;
use regex::Regex;
use tiktoken_rs::cl100k_base;

/// Trait for splitting text into ordered spans.
///
/// Implementations must be deterministic: the same input always yields the
/// same spans.
pub trait Segmenter: Send + Sync {
    fn segment(&self, text: &str, size: usize, overlap: usize) -> Result<Vec<String>>;
}

/// Fixed token windows using tiktoken (cl100k)
pub struct TokenSegmenter {
    bpe: tiktoken_rs::CoreBPE,
}

impl TokenSegmenter {
    pub fn new() -> Result<Self> {
        let bpe = cl100k_base()?;
        Ok(Self { bpe })
    }

    pub fn count_tokens(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }

    /// Longest window of at most `size` tokens from `start` that decodes to
    /// whole characters. A character spanning more than `size` tokens widens
    /// the window instead.
    fn window(&self, tokens: &[usize], start: usize, size: usize) -> Result<(usize, String)> {
        let limit = std::cmp::min(start + size, tokens.len());
        let shrink = (start + 1..=limit).rev();
        let widen = limit + 1..=tokens.len();

        shrink
            .chain(widen)
            .find_map(|end| {
                self.bpe
                    .decode(tokens[start..end].to_vec())
                    .ok()
                    .map(|span| (end, span))
            })
            .ok_or_else(|| anyhow::anyhow!("no decodable window at token {}", start))
    }

    /// First position in `from..end` where a character starts, or `end`
    fn boundary_at_or_after(&self, tokens: &[usize], from: usize, end: usize) -> usize {
        (from..end)
            .find(|&s| self.bpe.decode(tokens[s..end].to_vec()).is_ok())
            .unwrap_or(end)
    }
}

impl Segmenter for TokenSegmenter {
    fn segment(&self, text: &str, size: usize, overlap: usize) -> Result<Vec<String>> {
        if text.trim().is_empty() {
            return Ok(vec![]);
        }
        if size == 0 {
            anyhow::bail!("segment size must be positive");
        }

        let tokens = self.bpe.encode_with_special_tokens(text);

        if tokens.len() <= size {
            return Ok(vec![text.to_string()]);
        }

        let mut spans = Vec::new();
        let mut start = 0;

        // Overlap must leave room to advance
        let overlap = overlap.min(size.saturating_sub(1));

        while start < tokens.len() {
            let (end, span) = self.window(&tokens, start, size)?;
            spans.push(span);

            if end >= tokens.len() {
                break;
            }
            start = self.boundary_at_or_after(&tokens, end.saturating_sub(overlap).max(start + 1), end);
        }

        Ok(spans)
    }
}

/// Whole sentences packed into spans of at most `size` characters.
///
/// `overlap` counts sentences carried over from the end of the previous span.
/// A single sentence longer than `size` becomes its own span.
pub struct SentenceSegmenter {
    boundary: Regex,
}

impl SentenceSegmenter {
    pub fn new() -> Result<Self> {
        Ok(Self {
            boundary: Regex::new(r"[.!?]+[\s]+|\n{2,}")?,
        })
    }

    fn sentences<'a>(&self, text: &'a str) -> Vec<&'a str> {
        let mut sentences = Vec::new();
        let mut last = 0;
        for m in self.boundary.find_iter(text) {
            sentences.push(text[last..m.end()].trim());
            last = m.end();
        }
        sentences.push(text[last..].trim());
        sentences.retain(|s| !s.is_empty());
        sentences
    }
}

impl Segmenter for SentenceSegmenter {
    fn segment(&self, text: &str, size: usize, overlap: usize) -> Result<Vec<String>> {
        if size == 0 {
            anyhow::bail!("segment size must be positive");
        }

        let sentences = self.sentences(text);
        let mut spans = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut fresh = 0;

        for sentence in sentences {
            let len: usize = current.iter().map(|s| s.chars().count() + 1).sum();
            if fresh > 0 && len + sentence.chars().count() > size {
                spans.push(current.join(" "));
                // Carry at most all but one sentence, and only what still fits
                let keep = overlap.min(current.len() - 1);
                current.drain(..current.len() - keep);
                while !current.is_empty()
                    && current.iter().map(|s| s.chars().count() + 1).sum::<usize>()
                        + sentence.chars().count()
                        > size
                {
                    current.remove(0);
                }
                fresh = 0;
            }
            current.push(sentence);
            fresh += 1;
        }

        if fresh > 0 {
            spans.push(current.join(" "));
        }

        Ok(spans)
    }
}
