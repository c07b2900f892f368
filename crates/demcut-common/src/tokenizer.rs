// tokenizer.rs — server command tokenizer
//
// Commands arrive as one text line: a name followed by arguments, where a
// quoted argument keeps its inner whitespace. Quotes do not nest and there
// is no escape character; a missing closing quote runs to the end of the
// line.

pub const MAX_STRING_TOKENS: usize = 1024;

#[derive(Debug, Default)]
pub struct Tokenizer {
    argv: Vec<String>,
}

impl Tokenizer {
    pub fn new() -> Self {
        Self { argv: Vec::new() }
    }

    pub fn tokenize(&mut self, text: &str) {
        self.argv.clear();

        let bytes = text.as_bytes();
        let mut pos = 0;

        loop {
            while pos < bytes.len() && bytes[pos] <= b' ' {
                pos += 1;
            }
            if pos >= bytes.len() || self.argv.len() >= MAX_STRING_TOKENS {
                return;
            }

            let token = if bytes[pos] == b'"' {
                pos += 1;
                let start = pos;
                while pos < bytes.len() && bytes[pos] != b'"' {
                    pos += 1;
                }
                let token = &bytes[start..pos];
                if pos < bytes.len() {
                    pos += 1; // closing quote
                }
                token
            } else {
                let start = pos;
                while pos < bytes.len() && bytes[pos] > b' ' {
                    pos += 1;
                }
                &bytes[start..pos]
            };

            self.argv.push(String::from_utf8_lossy(token).into_owned());
        }
    }

    pub fn argc(&self) -> usize {
        self.argv.len()
    }

    /// Out-of-range arguments read as the empty string.
    pub fn argv(&self, arg: usize) -> &str {
        self.argv.get(arg).map(String::as_str).unwrap_or("")
    }
}

// ============================================================
// Tests
// ============================================================
