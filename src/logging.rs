//! Log output setup.
//!
//! Unless unsafe logging is requested, every line goes through [`scrub`] before being written,
//! so relayed peers' IP addresses don't end up in logs.

use std::{
    borrow::Cow,
    io::{self, Write},
    net::{IpAddr, SocketAddr},
};

use tracing_subscriber::{fmt::MakeWriter, EnvFilter};

/// What a scrubbed address is replaced with.
pub const SCRUBBED: &str = "[scrubbed]";

/// Installs the global subscriber, writing to stderr.
///
/// `log_level` is an [`EnvFilter`] directive; `RUST_LOG` takes precedence when set.
pub fn init(log_level: &str, unsafe_logging: bool) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match unsafe_logging {
        true => builder.with_writer(io::stderr).try_init(),
        false => builder.with_ansi(false).with_writer(ScrubbingMakeWriter::new(io::stderr)).try_init(),
    };

    if let Err(error) = result {
        eprintln!("Failed to initialize logging: {error}");
    }
}

fn is_address_char(c: char) -> bool {
    c.is_ascii_hexdigit() || matches!(c, ':' | '.' | '[' | ']')
}

fn is_address(token: &str) -> bool {
    token.bytes().any(|b| b.is_ascii_digit())
        && (token.parse::<IpAddr>().is_ok()
            || token.parse::<SocketAddr>().is_ok()
            || token.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>().is_ok())
}

/// Finds the address inside a run of address characters, ignoring punctuation around it.
fn find_address(token: &str) -> Option<(usize, usize)> {
    if is_address(token) {
        return Some((0, token.len()));
    }

    let trimmed = token.trim_matches(|c| c == '.' || c == ':');
    let start = token.len() - token.trim_start_matches(|c| c == '.' || c == ':').len();
    is_address(trimmed).then(|| (start, start + trimmed.len()))
}

/// Replaces every IPv4 or IPv6 address (with or without a port) in `text` with [`SCRUBBED`].
pub fn scrub(text: &str) -> Cow<'_, str> {
    let mut result = String::new();
    let mut copied_up_to = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((start, c)) = chars.next() {
        if !is_address_char(c) {
            continue;
        }

        let mut end = start + c.len_utf8();
        while let Some(&(index, next)) = chars.peek() {
            if !is_address_char(next) {
                break;
            }
            end = index + next.len_utf8();
            chars.next();
        }

        if let Some((from, to)) = find_address(&text[start..end]) {
            result.push_str(&text[copied_up_to..start + from]);
            result.push_str(SCRUBBED);
            copied_up_to = start + to;
        }
    }

    match copied_up_to {
        0 => Cow::Borrowed(text),
        _ => {
            result.push_str(&text[copied_up_to..]);
            Cow::Owned(result)
        }
    }
}

/// A [`MakeWriter`] whose writers scrub addresses out of everything written through them.
pub struct ScrubbingMakeWriter<M> {
    inner: M,
}

impl<M> ScrubbingMakeWriter<M> {
    pub const fn new(inner: M) -> Self {
        Self { inner }
    }
}

impl<'a, M: MakeWriter<'a>> MakeWriter<'a> for ScrubbingMakeWriter<M> {
    type Writer = ScrubbingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        ScrubbingWriter {
            inner: self.inner.make_writer(),
        }
    }
}

pub struct ScrubbingWriter<W> {
    inner: W,
}

impl<W: Write> Write for ScrubbingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // Every formatted event arrives in a single write.
        match std::str::from_utf8(buf) {
            Ok(text) => self.inner.write_all(scrub(text).as_bytes())?,
            Err(_) => self.inner.write_all(buf)?,
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
