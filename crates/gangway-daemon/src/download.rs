//! One-shot HTTP download endpoint
//!
//! Redeems a token minted by the file manager's `download` operation and
//! streams the file back as a plain HTTP response on the same local socket.
//! The token is consumed before the file is touched, so a second fetch of
//! the same URL is a 404 no matter how the first attempt went.
//!
//! Single-range requests get standard partial-content treatment; multipart
//! ranges are legal to ignore and answered with the whole file.

use std::io::SeekFrom;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::transfers::TransferTable;

/// Copy buffer for file streaming
const CHUNK_SIZE: usize = 1024 * 1024;

/// Upper bound on the request head; a GET for a token never comes close
const MAX_HEAD_SIZE: usize = 8 * 1024;

/// Serve one download request on a freshly routed connection. The request
/// head is still unread on the stream (routing only peeks).
pub async fn handle<S>(
    mut stream: S,
    token: &str,
    transfers: &TransferTable,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let head = read_head(&mut stream).await?;

    let path = match transfers.redeem_download_token(token) {
        Some(path) => path,
        None => {
            debug!("download token unknown or already used");
            return write_simple_response(&mut stream, "404 Not Found", "Not Found").await;
        }
    };

    let mut file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            warn!("download source {:?} unreadable: {}", path, e);
            return write_simple_response(&mut stream, "404 Not Found", "Not Found").await;
        }
    };
    let len = file.metadata().await?.len();
    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());

    let range = match header_value(&head, "range") {
        Some(value) => parse_range(value, len),
        None => ByteRange::All,
    };

    match range {
        ByteRange::Unsatisfiable => {
            let response = format!(
                "HTTP/1.1 416 Range Not Satisfiable\r\n\
                 Content-Range: bytes */{len}\r\n\
                 Content-Length: 0\r\n\
                 Connection: close\r\n\r\n"
            );
            stream.write_all(response.as_bytes()).await?;
        }
        ByteRange::All => {
            let response = format!(
                "HTTP/1.1 200 OK\r\n\
                 Content-Type: {mime}\r\n\
                 Content-Length: {len}\r\n\
                 Content-Disposition: attachment; filename=\"{}\"\r\n\
                 Accept-Ranges: bytes\r\n\
                 Connection: close\r\n\r\n",
                filename.replace('"', "\\\"")
            );
            stream.write_all(response.as_bytes()).await?;
            stream_bytes(&mut file, &mut stream, len).await?;
            debug!("served {:?} ({} bytes)", path, len);
        }
        ByteRange::Slice { start, end } => {
            file.seek(SeekFrom::Start(start)).await?;
            let count = end - start + 1;
            let response = format!(
                "HTTP/1.1 206 Partial Content\r\n\
                 Content-Type: {mime}\r\n\
                 Content-Length: {count}\r\n\
                 Content-Range: bytes {start}-{end}/{len}\r\n\
                 Content-Disposition: attachment; filename=\"{}\"\r\n\
                 Accept-Ranges: bytes\r\n\
                 Connection: close\r\n\r\n",
                filename.replace('"', "\\\"")
            );
            stream.write_all(response.as_bytes()).await?;
            stream_bytes(&mut file, &mut stream, count).await?;
            debug!("served {:?} (bytes {}-{})", path, start, end);
        }
    }
    stream.flush().await
}

/// Minimal plain-text response, shared with the routing layer's refusals
pub(crate) async fn write_simple_response<S>(
    stream: &mut S,
    status: &str,
    body: &str,
) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {status}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}

async fn read_head<S>(stream: &mut S) -> std::io::Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(512);
    let mut buf = [0u8; 512];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        head.extend_from_slice(&buf[..n]);
        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if head.len() > MAX_HEAD_SIZE {
            return Err(std::io::Error::other("request head too large"));
        }
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

fn header_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case(name) {
            Some(value.trim())
        } else {
            None
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteRange {
    /// Serve the whole file (no range, or one we may ignore)
    All,
    /// Inclusive byte range, already clamped to the file
    Slice { start: u64, end: u64 },
    Unsatisfiable,
}

/// Interpret a `Range` header against a file of `len` bytes. Syntactically
/// broken ranges fall back to the whole file; a well-formed range that lies
/// entirely outside the file is unsatisfiable.
fn parse_range(value: &str, len: u64) -> ByteRange {
    let spec = match value.strip_prefix("bytes=") {
        Some(spec) => spec.trim(),
        None => return ByteRange::All,
    };
    if spec.contains(',') {
        return ByteRange::All;
    }
    let (start_s, end_s) = match spec.split_once('-') {
        Some(parts) => parts,
        None => return ByteRange::All,
    };

    if start_s.is_empty() {
        // Suffix form: the last n bytes.
        let suffix = match end_s.parse::<u64>() {
            Ok(n) => n,
            Err(_) => return ByteRange::All,
        };
        if suffix == 0 || len == 0 {
            return ByteRange::Unsatisfiable;
        }
        return ByteRange::Slice {
            start: len.saturating_sub(suffix),
            end: len - 1,
        };
    }

    let start = match start_s.parse::<u64>() {
        Ok(n) => n,
        Err(_) => return ByteRange::All,
    };
    let end = if end_s.is_empty() {
        len.saturating_sub(1)
    } else {
        match end_s.parse::<u64>() {
            Ok(n) => n.min(len.saturating_sub(1)),
            Err(_) => return ByteRange::All,
        }
    };
    if start >= len {
        return ByteRange::Unsatisfiable;
    }
    if start > end {
        return ByteRange::All;
    }
    ByteRange::Slice { start, end }
}

async fn stream_bytes<R, W>(file: &mut R, out: &mut W, mut remaining: u64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if remaining == 0 {
        return Ok(());
    }
    let mut buf = vec![0u8; CHUNK_SIZE.min(remaining as usize)];
    while remaining > 0 {
        let want = (remaining as usize).min(buf.len());
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            // File shrank underneath us; close short rather than hang.
            break;
        }
        out.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_parse_range_forms() {
        assert_eq!(parse_range("bytes=0-4", 10), ByteRange::Slice { start: 0, end: 4 });
        assert_eq!(parse_range("bytes=5-", 10), ByteRange::Slice { start: 5, end: 9 });
        assert_eq!(parse_range("bytes=-3", 10), ByteRange::Slice { start: 7, end: 9 });
        // End past the file is clamped, not refused.
        assert_eq!(parse_range("bytes=0-99", 10), ByteRange::Slice { start: 0, end: 9 });
        assert_eq!(parse_range("bytes=-99", 10), ByteRange::Slice { start: 0, end: 9 });
    }

    #[test]
    fn test_parse_range_ignorable() {
        assert_eq!(parse_range("bytes=0-1,3-4", 10), ByteRange::All);
        assert_eq!(parse_range("bytes=x-y", 10), ByteRange::All);
        assert_eq!(parse_range("items=0-4", 10), ByteRange::All);
        assert_eq!(parse_range("bytes=5-2", 10), ByteRange::All);
        assert_eq!(parse_range("bytes", 10), ByteRange::All);
    }

    #[test]
    fn test_parse_range_unsatisfiable() {
        assert_eq!(parse_range("bytes=10-", 10), ByteRange::Unsatisfiable);
        assert_eq!(parse_range("bytes=-0", 10), ByteRange::Unsatisfiable);
        assert_eq!(parse_range("bytes=0-", 0), ByteRange::Unsatisfiable);
    }

    #[test]
    fn test_header_value_lookup() {
        let head = "GET /x HTTP/1.1\r\nHost: gateway\r\nRange: bytes=0-1\r\n\r\n";
        assert_eq!(header_value(head, "range"), Some("bytes=0-1"));
        assert_eq!(header_value(head, "host"), Some("gateway"));
        assert_eq!(header_value(head, "accept"), None);
    }

    async fn fetch(table: &Arc<TransferTable>, token: &str, range: Option<&str>) -> String {
        let (mut client, server) = tokio::io::duplex(256 * 1024);
        let table = Arc::clone(table);
        let owned_token = token.to_string();
        let server_task = tokio::spawn(async move {
            let _ = handle(server, &owned_token, &table).await;
        });

        let mut request = format!("GET /download/{} HTTP/1.1\r\nHost: gateway\r\n", token);
        if let Some(range) = range {
            request.push_str(&format!("Range: {}\r\n", range));
        }
        request.push_str("\r\n");
        client.write_all(request.as_bytes()).await.unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        server_task.await.unwrap();
        String::from_utf8_lossy(&out).into_owned()
    }

    #[tokio::test]
    async fn test_serves_file_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.pdf");
        tokio::fs::write(&path, b"%PDF-1.4 fake report").await.unwrap();
        let table = Arc::new(TransferTable::new());
        let token = table.create_download_token(path.clone()).unwrap();

        let response = fetch(&table, &token, None).await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("Content-Type: application/pdf"));
        assert!(response.contains("Content-Disposition: attachment; filename=\"report.pdf\""));
        assert!(response.contains("Accept-Ranges: bytes"));
        assert!(response.ends_with("%PDF-1.4 fake report"));

        // The token went with the first fetch.
        let response = fetch(&table, &token, None).await;
        assert!(response.starts_with("HTTP/1.1 404"));
    }

    #[tokio::test]
    async fn test_serves_partial_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("digits.txt");
        tokio::fs::write(&path, b"0123456789").await.unwrap();
        let table = Arc::new(TransferTable::new());
        let token = table.create_download_token(path).unwrap();

        let response = fetch(&table, &token, Some("bytes=2-5")).await;
        assert!(response.starts_with("HTTP/1.1 206 Partial Content"));
        assert!(response.contains("Content-Range: bytes 2-5/10"));
        assert!(response.contains("Content-Length: 4"));
        assert!(response.ends_with("2345"));
    }

    #[tokio::test]
    async fn test_range_past_end_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("digits.txt");
        tokio::fs::write(&path, b"0123456789").await.unwrap();
        let table = Arc::new(TransferTable::new());
        let token = table.create_download_token(path).unwrap();

        let response = fetch(&table, &token, Some("bytes=50-")).await;
        assert!(response.starts_with("HTTP/1.1 416"));
        assert!(response.contains("Content-Range: bytes */10"));
    }

    #[tokio::test]
    async fn test_unknown_extension_defaults_to_octet_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.zzqq");
        tokio::fs::write(&path, b"opaque").await.unwrap();
        let table = Arc::new(TransferTable::new());
        let token = table.create_download_token(path).unwrap();

        let response = fetch(&table, &token, None).await;
        assert!(response.contains("Content-Type: application/octet-stream"));
    }

    #[tokio::test]
    async fn test_missing_source_file_is_not_found() {
        let table = Arc::new(TransferTable::new());
        let token = table
            .create_download_token(std::path::PathBuf::from("/nonexistent/gone.bin"))
            .unwrap();

        let response = fetch(&table, &token, None).await;
        assert!(response.starts_with("HTTP/1.1 404"));
    }
}
