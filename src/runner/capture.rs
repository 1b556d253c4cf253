//! Bounded capture of child output streams.
//!
//! Keeps at most `cap` bytes and drains the rest so a program that prints
//! forever neither blocks on a full pipe nor grows our memory.

use tokio::io::{AsyncRead, AsyncReadExt};

const READ_CHUNK: usize = 8192;

/// Captured stream content, possibly truncated
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    bytes: Vec<u8>,
    omitted: u64,
}

impl CapturedOutput {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            bytes: text.into().into_bytes(),
            omitted: 0,
        }
    }

    /// Captured bytes as (lossy) UTF-8, without the truncation marker
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    pub fn is_truncated(&self) -> bool {
        self.omitted > 0
    }

    pub fn omitted_bytes(&self) -> u64 {
        self.omitted
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty() && self.omitted == 0
    }

    /// Text for reports; truncated output ends with a marker
    pub fn render(&self) -> String {
        let mut text = self.text();
        if self.is_truncated() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&format!("[output truncated: {} bytes omitted]", self.omitted));
        }
        text
    }
}

/// Read a stream to EOF keeping at most `cap` bytes
pub async fn read_capped<R>(reader: Option<R>, cap: usize) -> std::io::Result<CapturedOutput>
where
    R: AsyncRead + Unpin,
{
    let mut output = CapturedOutput::default();
    let Some(mut reader) = reader else {
        return Ok(output);
    };

    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }

        let remaining = cap.saturating_sub(output.bytes.len());
        let kept = n.min(remaining);
        output.bytes.extend_from_slice(&chunk[..kept]);
        output.omitted += (n - kept) as u64;
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_within_cap() {
        let data: &[u8] = b"hello\n";
        let output = read_capped(Some(data), 64).await.unwrap();
        assert_eq!(output.text(), "hello\n");
        assert!(!output.is_truncated());
        assert_eq!(output.render(), "hello\n");
    }

    #[tokio::test]
    async fn test_truncates_and_drains() {
        let data = vec![b'x'; 20_000];
        let output = read_capped(Some(data.as_slice()), 100).await.unwrap();
        assert_eq!(output.text().len(), 100);
        assert_eq!(output.omitted_bytes(), 19_900);
        assert!(output
            .render()
            .ends_with("\n[output truncated: 19900 bytes omitted]"));
    }

    #[tokio::test]
    async fn test_missing_stream_is_empty() {
        let output = read_capped::<&[u8]>(None, 100).await.unwrap();
        assert!(output.is_empty());
    }
}
