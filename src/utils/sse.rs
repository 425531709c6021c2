use futures_util::stream::{self, BoxStream};
use futures_util::TryStreamExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::io::StreamReader;

use crate::{CalciferError, Result};

#[derive(Clone, Copy, Debug)]
pub(crate) struct SseLimits {
    pub max_line_bytes: usize,
    pub max_event_bytes: usize,
}

impl Default for SseLimits {
    fn default() -> Self {
        Self {
            max_line_bytes: 256 * 1024,
            max_event_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Lazy stream of SSE `data:` payloads from a response body. Ends on EOF or
/// a `[DONE]` sentinel event.
pub(crate) fn sse_data_stream_from_response(
    response: reqwest::Response,
) -> BoxStream<'static, Result<String>> {
    let byte_stream = response.bytes_stream().map_err(std::io::Error::other);
    let reader = StreamReader::new(byte_stream);
    sse_data_stream_from_reader(tokio::io::BufReader::new(reader), SseLimits::default())
}

pub(crate) fn sse_data_stream_from_reader<R>(
    reader: R,
    limits: SseLimits,
) -> BoxStream<'static, Result<String>>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    Box::pin(stream::try_unfold(
        (reader, limits),
        |(mut reader, limits)| async move {
            match next_sse_data(&mut reader, limits).await? {
                Some(data) => Ok(Some((data, (reader, limits)))),
                None => Ok(None),
            }
        },
    ))
}

async fn next_sse_data<R>(reader: &mut R, limits: SseLimits) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut event = String::new();
    let mut line_bytes = Vec::new();

    loop {
        if !read_line_limited(reader, &mut line_bytes, limits.max_line_bytes).await? {
            if event.is_empty() {
                return Ok(None);
            }
            return Ok(Some(event));
        }

        let line = std::str::from_utf8(&line_bytes).map_err(|err| {
            CalciferError::InvalidResponse(format!("invalid SSE UTF-8: {err}"))
        })?;
        let line = line.trim_end_matches(['\r', '\n']);

        if line.is_empty() {
            if event.is_empty() {
                continue;
            }
            if event == "[DONE]" {
                return Ok(None);
            }
            return Ok(Some(event));
        }

        let Some(rest) = line.strip_prefix("data:") else {
            continue;
        };
        let rest = rest.trim_start();

        let separator_bytes = usize::from(!event.is_empty());
        if event
            .len()
            .saturating_add(separator_bytes)
            .saturating_add(rest.len())
            > limits.max_event_bytes
        {
            return Err(CalciferError::InvalidResponse(format!(
                "SSE event exceeds max_event_bytes={}",
                limits.max_event_bytes
            )));
        }
        if separator_bytes == 1 {
            event.push('\n');
        }
        event.push_str(rest);
    }
}

async fn read_line_limited<R>(reader: &mut R, out: &mut Vec<u8>, max_bytes: usize) -> Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    out.clear();

    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(!out.is_empty());
        }

        let newline_pos = buf.iter().position(|b| *b == b'\n');
        let take_len = newline_pos.map(|pos| pos + 1).unwrap_or(buf.len());

        if out.len().saturating_add(take_len) > max_bytes {
            return Err(CalciferError::InvalidResponse(format!(
                "SSE line exceeds max_line_bytes={max_bytes}"
            )));
        }

        out.extend_from_slice(&buf[..take_len]);
        reader.consume(take_len);

        if newline_pos.is_some() {
            return Ok(true);
        }
    }
}
