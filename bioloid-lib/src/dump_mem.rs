//! Hex/ASCII memory dumps, used for packet tracing.

/// Layout options for [`dump_mem`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpOptions {
    pub prefix: String,
    /// Address printed for the first byte
    pub addr: usize,
    pub line_width: usize,
    pub show_ascii: bool,
    pub show_addr: bool,
}

impl Default for DumpOptions {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            addr: 0,
            line_width: 16,
            show_ascii: true,
            show_addr: true,
        }
    }
}

impl DumpOptions {
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Self::default()
        }
    }

    pub fn no_ascii(mut self) -> Self {
        self.show_ascii = false;
        self
    }

    pub fn no_addr(mut self) -> Self {
        self.show_addr = false;
        self
    }

    pub fn addr(mut self, addr: usize) -> Self {
        self.addr = addr;
        self
    }

    pub fn line_width(mut self, line_width: usize) -> Self {
        self.line_width = line_width;
        self
    }
}

/// Formats `buf` as lines of `ADDR: hex bytes  ascii`.
///
/// An empty buffer yields a single `<prefix>:No data` line.
pub fn dump_mem(buf: &[u8], opts: &DumpOptions) -> Vec<String> {
    let line_width = if opts.line_width == 0 { 16 } else { opts.line_width };
    let mut prefix = opts.prefix.clone();
    if !prefix.is_empty() {
        prefix.push(':');
    }
    if buf.is_empty() {
        return vec![format!("{prefix}No data")];
    }

    let mut lines = Vec::with_capacity(buf.len().div_ceil(line_width));
    let mut addr = opts.addr;
    for chunk in buf.chunks(line_width) {
        let mut line = String::with_capacity(prefix.len() + 7 + line_width * 4);
        if !prefix.is_empty() {
            line.push_str(&prefix);
            line.push(' ');
        }
        if opts.show_addr {
            line.push_str(&format!("{addr:04x}: "));
        }
        let hex = chunk
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(" ");
        if opts.show_ascii {
            let ascii: String = chunk
                .iter()
                .map(|&b| if (0x20..=0x7e).contains(&b) { b as char } else { '.' })
                .collect();
            line.push_str(&format!("{hex:<width$} {ascii}", width = line_width * 3 - 1));
        } else {
            line.push_str(&hex);
        }
        lines.push(line);
        addr += line_width;
    }
    lines
}

/// Emits a dump of `bytes` at TRACE level, one event per line.
pub(crate) fn trace_dump(prefix: &str, bytes: &[u8]) {
    if tracing::enabled!(tracing::Level::TRACE) {
        for line in dump_mem(bytes, &DumpOptions::with_prefix(prefix)) {
            tracing::trace!("{line}");
        }
    }
}
