use std::sync::LazyLock;

use regex::Regex;
use tracing_subscriber::fmt::MakeWriter;

/// A writer that strips credentials (AWS keys, bearer tokens, chat tokens)
/// from log output before it reaches stderr.
pub struct RedactingWriter<W> {
    inner: W,
}

impl RedactingWriter<std::io::Stderr> {
    pub fn stderr() -> Self {
        Self {
            inner: std::io::stderr(),
        }
    }
}

impl<W: std::io::Write> std::io::Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let original = String::from_utf8_lossy(buf);
        let redacted = redact_secrets(&original);
        self.inner.write_all(redacted.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl<'a> MakeWriter<'a> for RedactingWriter<std::io::Stderr> {
    type Writer = RedactingWriter<std::io::Stderr>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::stderr()
    }
}

/// Replace known credential patterns with `[REDACTED]`.
pub fn redact_secrets(input: &str) -> String {
    static PATTERNS: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(
            r"(?x)
              (?:AKIA|ASIA)[A-Z0-9]{16}        # AWS access key ids
            | ABSK[A-Za-z0-9+/=]{20,}          # Bedrock API keys
            | Bearer\s+[A-Za-z0-9._~+/=\-]{20,}
            | ghp_[A-Za-z0-9]{20,}             # GitHub classic tokens
            | github_pat_[A-Za-z0-9_]{20,}     # GitHub fine-grained tokens
            | xox[bpa]-\S{10,}                 # Slack tokens
            | xapp-\S{10,}
            | sk-\S{20,}
            ",
        )
        .expect("redaction regex should compile")
    });

    PATTERNS.replace_all(input, "[REDACTED]").into_owned()
}
