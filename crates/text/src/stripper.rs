//! Incremental markup stripping
//!
//! The stripper removes markdown decoration the model emits despite the role
//! prompt asking it not to: paired `**`/`__`, backticks, fenced code
//! delimiter lines, heading hashes, bullet and numbered-list markers at line
//! starts, and CJK corner/lens brackets.
//!
//! It is chunking-invariant: feeding a text in arbitrary splits produces the
//! same output as feeding it whole. Ambiguous suffixes (a lone `*` that may
//! become `**`, digits that may become a `1. ` marker) are held back until
//! the next chunk or end of stream resolves them.

/// Streaming stripper state
#[derive(Debug)]
pub struct StreamingStripper {
    pending: String,
    at_line_start: bool,
}

impl StreamingStripper {
    pub fn new() -> Self {
        Self {
            pending: String::new(),
            at_line_start: true,
        }
    }

    /// Feed a chunk; returns the stripped text that is now unambiguous
    pub fn push(&mut self, chunk: &str) -> String {
        self.pending.push_str(chunk);
        self.drain(false)
    }

    /// End of stream: resolve and return everything still held back
    pub fn finish(&mut self) -> String {
        let out = self.drain(true);
        self.pending.clear();
        self.at_line_start = true;
        out
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.at_line_start = true;
    }

    fn drain(&mut self, eof: bool) -> String {
        let pending = std::mem::take(&mut self.pending);
        let chars: Vec<char> = pending.chars().collect();
        let n = chars.len();
        let mut out = String::with_capacity(pending.len());
        let mut i = 0usize;
        let mut line_start = self.at_line_start;

        'scan: while i < n {
            if line_start {
                // optional indentation before a block marker
                let mut j = i;
                while j < n && (chars[j] == ' ' || chars[j] == '\t') {
                    j += 1;
                }
                if j >= n {
                    if !eof {
                        break 'scan;
                    }
                    for &c in &chars[i..n] {
                        out.push(c);
                    }
                    i = n;
                    break 'scan;
                }

                let c = chars[j];

                // fenced code delimiter line: drop it entirely, tag included
                if c == '`' {
                    let is_fence = j + 2 < n && chars[j + 1] == '`' && chars[j + 2] == '`';
                    let may_become_fence =
                        j + 1 >= n || (chars[j + 1] == '`' && j + 2 >= n);
                    if is_fence {
                        let mut k = j + 3;
                        while k < n && chars[k] != '\n' {
                            k += 1;
                        }
                        if k < n {
                            i = k + 1;
                            line_start = true;
                            continue 'scan;
                        }
                        if eof {
                            i = n;
                            break 'scan;
                        }
                        break 'scan;
                    }
                    if may_become_fence && !eof {
                        break 'scan;
                    }
                    // a backtick that is not a fence falls through to the
                    // generic pass, which strips backticks anyway
                }

                // bullet marker: -, * or + followed by a space
                if c == '-' || c == '*' || c == '+' {
                    if j + 1 < n {
                        if chars[j + 1] == ' ' {
                            i = j + 2;
                            line_start = false;
                            continue 'scan;
                        }
                    } else if !eof {
                        break 'scan;
                    }
                }

                // numbered-list marker: digits, '.', space
                if c.is_ascii_digit() {
                    let mut k = j;
                    while k < n && chars[k].is_ascii_digit() {
                        k += 1;
                    }
                    if k >= n && !eof {
                        break 'scan;
                    }
                    if k < n && chars[k] == '.' {
                        if k + 1 >= n && !eof {
                            break 'scan;
                        }
                        if k + 1 < n && chars[k + 1] == ' ' {
                            i = k + 2;
                            line_start = false;
                            continue 'scan;
                        }
                    }
                }

                // heading marker: run of '#', one following space consumed
                if c == '#' {
                    let mut k = j;
                    while k < n && chars[k] == '#' {
                        k += 1;
                    }
                    if k >= n {
                        if !eof {
                            break 'scan;
                        }
                    } else if chars[k] == ' ' {
                        k += 1;
                    }
                    i = k;
                    line_start = false;
                    continue 'scan;
                }

                // no block marker: the indentation is ordinary text
                for &c in &chars[i..j] {
                    out.push(c);
                }
                i = j;
                line_start = false;
                continue 'scan;
            }

            let c = chars[i];
            match c {
                '*' | '_' => {
                    if i + 1 < n && chars[i + 1] == c {
                        i += 2;
                    } else if i + 1 >= n && !eof {
                        break 'scan;
                    } else {
                        out.push(c);
                        i += 1;
                    }
                }
                '`' | '【' | '】' | '「' | '」' => {
                    i += 1;
                }
                '\n' => {
                    out.push('\n');
                    i += 1;
                    line_start = true;
                }
                _ => {
                    out.push(c);
                    i += 1;
                }
            }
        }

        if i < n {
            self.pending = chars[i..].iter().collect();
        }
        self.at_line_start = line_start;
        out
    }
}

impl Default for StreamingStripper {
    fn default() -> Self {
        Self::new()
    }
}

/// Strip markup from a complete text in one pass
pub fn strip_markup(text: &str) -> String {
    let mut stripper = StreamingStripper::new();
    let mut out = stripper.push(text);
    out.push_str(&stripper.finish());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strip_chunked(text: &str, size: usize) -> String {
        let mut stripper = StreamingStripper::new();
        let mut out = String::new();
        let chars: Vec<char> = text.chars().collect();
        for chunk in chars.chunks(size) {
            let piece: String = chunk.iter().collect();
            out.push_str(&stripper.push(&piece));
        }
        out.push_str(&stripper.finish());
        out
    }

    #[test]
    fn strips_bold_and_italic_markers() {
        assert_eq!(strip_markup("**Hi** there"), "Hi there");
        assert_eq!(strip_markup("__bold__ and _kept_"), "bold and _kept_");
        assert_eq!(strip_markup("a ** b"), "a  b");
    }

    #[test]
    fn strips_headings_and_bullets() {
        assert_eq!(strip_markup("# Title\ntext"), "Title\ntext");
        assert_eq!(strip_markup("### Deep\n- one\n* two\n+ three"), "Deep\none\ntwo\nthree");
        assert_eq!(strip_markup("  - indented item"), "indented item");
    }

    #[test]
    fn strips_numbered_lists_but_not_numbers() {
        assert_eq!(strip_markup("1. first\n12. twelfth"), "first\ntwelfth");
        assert_eq!(strip_markup("3.14 is pi"), "3.14 is pi");
        assert_eq!(strip_markup("call 1.\nnext"), "call 1.\nnext");
    }

    #[test]
    fn strips_backticks_and_fences() {
        assert_eq!(strip_markup("run `cargo build` now"), "run cargo build now");
        assert_eq!(strip_markup("```rust\nlet x = 1;\n```\ndone"), "let x = 1;\ndone");
    }

    #[test]
    fn strips_cjk_decoration() {
        assert_eq!(strip_markup("【注】「引用」"), "注引用");
    }

    #[test]
    fn keeps_plain_text_untouched() {
        let text = "What time is it? It is about three pm.";
        assert_eq!(strip_markup(text), text);
    }

    #[test]
    fn chunking_is_invariant() {
        let cases = [
            "**Hi** there.\n- item one\n- item two\n",
            "# Title\n1. first\n22. second\nplain *star* __bold__",
            "```\ncode\n```\nafter `tick` and 3.14",
            "a_b_c __d__ ** e",
        ];
        for text in cases {
            let whole = strip_markup(text);
            for size in 1..=7 {
                assert_eq!(strip_chunked(text, size), whole, "split={size} text={text:?}");
            }
        }
    }

    #[test]
    fn trailing_ambiguity_resolves_at_eof() {
        let mut stripper = StreamingStripper::new();
        assert_eq!(stripper.push("tail *"), "tail ");
        // a lone trailing star is literal once the stream ends
        assert_eq!(stripper.finish(), "*");
    }
}
