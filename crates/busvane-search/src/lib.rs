use serde::Serialize;
use std::collections::BTreeMap;

/// A contiguous run of bytes in a label that matched a query word and
/// should be rendered emphasized. Offsets index the original label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HighlightSpan {
    pub start: usize,
    pub len: usize,
}

impl HighlightSpan {
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

/// One run of a label split for rendering: either plain text or an
/// emphasized match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Segment {
    pub text: String,
    pub emphasized: bool,
}

/// A parsed search query: non-empty whitespace-separated words, folded to
/// uppercase. Folding is ASCII-only so match offsets always index the
/// original label; non-ASCII text is compared bytewise.
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    words: Vec<String>,
}

impl SearchQuery {
    pub fn parse(raw: &str) -> Self {
        let words = raw
            .split_whitespace()
            .map(|word| word.to_ascii_uppercase())
            .collect();
        Self { words }
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }

    /// True iff every query word occurs in `label`, ignoring ASCII case.
    /// An empty query matches everything.
    pub fn matches(&self, label: &str) -> bool {
        if self.words.is_empty() {
            return true;
        }
        let folded = label.to_ascii_uppercase();
        self.words.iter().all(|word| folded.contains(word.as_str()))
    }

    /// Row-level filter: every query word must occur in at least one of the
    /// row's own fields. Parent and child rows do not contribute.
    pub fn matches_row(&self, fields: &[&str]) -> bool {
        if self.words.is_empty() {
            return true;
        }
        let folded: Vec<String> = fields
            .iter()
            .map(|field| field.to_ascii_uppercase())
            .collect();
        self.words
            .iter()
            .all(|word| folded.iter().any(|field| field.contains(word.as_str())))
    }

    /// Compute the emphasized spans for `label`, ordered left to right.
    ///
    /// Every occurrence of every word is considered; at each start offset
    /// only the longest matching word survives. A span overlapping the
    /// previous one is truncated to its uncovered suffix and dropped when
    /// fully covered, so the spans never overlap and splitting the label
    /// on them reconstructs it exactly.
    pub fn highlight_spans(&self, label: &str) -> Vec<HighlightSpan> {
        if self.words.is_empty() || label.is_empty() {
            return Vec::new();
        }
        let folded = label.to_ascii_uppercase();
        // start offset -> longest word length matching there
        let mut longest: BTreeMap<usize, usize> = BTreeMap::new();
        for word in &self.words {
            let mut from = 0usize;
            while let Some(found) = folded[from..].find(word.as_str()) {
                let start = from + found;
                let slot = longest.entry(start).or_insert(0);
                if *slot < word.len() {
                    *slot = word.len();
                }
                from = start + 1;
                while !folded.is_char_boundary(from) {
                    from += 1;
                }
            }
        }
        let mut spans = Vec::with_capacity(longest.len());
        let mut covered = 0usize;
        for (start, len) in longest {
            let end = start + len;
            if end <= covered {
                continue;
            }
            let begin = start.max(covered);
            spans.push(HighlightSpan {
                start: begin,
                len: end - begin,
            });
            covered = end;
        }
        spans
    }

    /// Split `label` into alternating plain/emphasized runs based on
    /// [`highlight_spans`](Self::highlight_spans). Concatenating the
    /// segment texts yields `label` unchanged.
    pub fn segments(&self, label: &str) -> Vec<Segment> {
        let spans = self.highlight_spans(label);
        let mut out = Vec::with_capacity(spans.len() * 2 + 1);
        let mut cursor = 0usize;
        for span in spans {
            if span.start > cursor {
                out.push(Segment {
                    text: label[cursor..span.start].to_string(),
                    emphasized: false,
                });
            }
            out.push(Segment {
                text: label[span.start..span.end()].to_string(),
                emphasized: true,
            });
            cursor = span.end();
        }
        if cursor < label.len() {
            out.push(Segment {
                text: label[cursor..].to_string(),
                emphasized: false,
            });
        }
        out
    }
}
