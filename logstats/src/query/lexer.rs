//! Tokenizer for the stats-pipe sublanguage.
//!
//! Tokens are either punctuation (`(`, `)`, `,`, `:`, `|`, `=`), bare
//! words, or double-quoted strings. Signs and unit suffixes stay glued to
//! their word (`-5s`, `/24`, `1.5KiB`), which keeps bucket and offset
//! parsing a single-token affair.

const PUNCT: &[char] = &['(', ')', ',', ':', '|', '='];

pub struct Lexer<'a> {
    chars: Vec<char>,
    pos: usize,
    /// Current token text ("" at end of input).
    pub token: String,
    /// True when the current token came from a quoted string.
    pub token_quoted: bool,
    src: &'a str,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        let mut lex = Self {
            chars: src.chars().collect(),
            pos: 0,
            token: String::new(),
            token_quoted: false,
            src,
        };
        lex.next_token();
        lex
    }

    pub fn source(&self) -> &'a str {
        self.src
    }

    pub fn is_end(&self) -> bool {
        self.token.is_empty() && !self.token_quoted
    }

    /// Case-insensitive keyword check; quoted tokens never match.
    pub fn is_keyword(&self, kw: &str) -> bool {
        !self.token_quoted && self.token.eq_ignore_ascii_case(kw)
    }

    pub fn is_any_keyword(&self, kws: &[&str]) -> bool {
        kws.iter().any(|kw| self.is_keyword(kw))
    }

    /// Advance to the next token.
    pub fn next_token(&mut self) {
        self.token.clear();
        self.token_quoted = false;

        while self.pos < self.chars.len() && self.chars[self.pos].is_whitespace() {
            self.pos += 1;
        }
        if self.pos >= self.chars.len() {
            return;
        }

        let c = self.chars[self.pos];
        if PUNCT.contains(&c) {
            self.token.push(c);
            self.pos += 1;
            return;
        }
        if c == '"' {
            self.pos += 1;
            while self.pos < self.chars.len() {
                let c = self.chars[self.pos];
                self.pos += 1;
                match c {
                    '"' => break,
                    '\\' if self.pos < self.chars.len() => {
                        let esc = self.chars[self.pos];
                        self.pos += 1;
                        match esc {
                            'n' => self.token.push('\n'),
                            't' => self.token.push('\t'),
                            other => self.token.push(other),
                        }
                    }
                    other => self.token.push(other),
                }
            }
            self.token_quoted = true;
            return;
        }

        while self.pos < self.chars.len() {
            let c = self.chars[self.pos];
            if c.is_whitespace() || PUNCT.contains(&c) || c == '"' {
                break;
            }
            self.token.push(c);
            self.pos += 1;
        }
    }
}

/// Quote `s` for the canonical display form when it contains characters
/// the lexer would split on.
pub fn quote_token_if_needed(s: &str) -> String {
    let needs_quotes = s.is_empty()
        || s.chars()
            .any(|c| c.is_whitespace() || PUNCT.contains(&c) || c == '"');
    if !needs_quotes {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}
