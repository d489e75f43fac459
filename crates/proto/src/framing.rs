use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// One JSON object per line, UTF-8. This is the single framing invariant of
/// all three shoal protocols.
pub async fn write_frame<T: Serialize>(
    writer: &mut (impl AsyncWrite + Unpin),
    value: &T,
) -> anyhow::Result<()> {
    let mut buf = serde_json::to_vec(value)?;
    buf.push(b'\n');
    writer.write_all(&buf).await?;
    Ok(())
}

/// Reads one line and decodes it. `Ok(None)` means clean EOF; a malformed
/// line is an error, which one-shot servers treat as fatal for the
/// connection.
pub async fn read_frame<T: DeserializeOwned>(
    reader: &mut (impl AsyncBufRead + Unpin),
) -> anyhow::Result<Option<T>> {
    match read_line(reader).await? {
        Some(line) => Ok(Some(serde_json::from_str(&line)?)),
        None => Ok(None),
    }
}

/// Reads one raw line, for callers that want to skip malformed records
/// instead of failing (persistent chat streams).
pub async fn read_line(
    reader: &mut (impl AsyncBufRead + Unpin),
) -> anyhow::Result<Option<String>> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(Some(line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
    }

    #[tokio::test]
    async fn test_round_trip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Ping { seq: 1 }).await.unwrap();
        write_frame(&mut buf, &Ping { seq: 2 }).await.unwrap();

        let mut reader = std::io::Cursor::new(buf);
        assert_eq!(
            read_frame::<Ping>(&mut reader).await.unwrap(),
            Some(Ping { seq: 1 })
        );
        assert_eq!(
            read_frame::<Ping>(&mut reader).await.unwrap(),
            Some(Ping { seq: 2 })
        );
        assert_eq!(read_frame::<Ping>(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_malformed_line_is_an_error() {
        let mut reader = std::io::Cursor::new(b"not json\n".to_vec());
        assert!(read_frame::<Ping>(&mut reader).await.is_err());
    }
}
