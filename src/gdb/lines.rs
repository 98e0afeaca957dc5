//! Reassembles newline-terminated lines from raw pipe reads

/// Byte buffer that hands out complete lines and keeps the unterminated tail.
///
/// Text is decoded only after a whole line is available, so a multi-byte
/// UTF-8 sequence split across two reads comes out intact.
#[derive(Debug, Default)]
pub struct LineAssembler {
    buffer: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and return every line completed by them, without the
    /// line terminator (`\n` or `\r\n`).
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let Some(end) = self.buffer.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };

        let rest = self.buffer.split_off(end + 1);
        let complete = std::mem::replace(&mut self.buffer, rest);

        complete[..end]
            .split(|&b| b == b'\n')
            .map(|line| {
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                String::from_utf8_lossy(line).into_owned()
            })
            .collect()
    }

    /// Bytes received after the last newline
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    /// Drain the unterminated tail, e.g. when the stream hits EOF
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}
