use std::io;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use http::StatusCode;
use http::header::{
    ACCEPT_ENCODING, ACCEPT_RANGES, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE,
    HeaderValue, IF_MODIFIED_SINCE, LAST_MODIFIED, RANGE,
};
use time::OffsetDateTime;
use time::PrimitiveDateTime;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, SeekFrom};

use crate::cache::ClientChannel;
use crate::io_util::{GzipSink, copy_to_sink};

const IMF_FIXDATE: &[BorrowedFormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

pub fn fmt_http_date(t: SystemTime) -> String {
    OffsetDateTime::from(t)
        .format(&IMF_FIXDATE)
        .unwrap_or_default()
}

pub fn parse_http_date(value: &str) -> Option<SystemTime> {
    let parsed = PrimitiveDateTime::parse(value, &IMF_FIXDATE).ok()?;
    Some(parsed.assume_utc().into())
}

fn unix_secs(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(err) => -(err.duration().as_secs() as i64),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum RangeOutcome {
    Full,
    Partial(u64, u64),
    Unsatisfiable,
}

/// Single-range `bytes=` parsing. Malformed and multi-range headers are
/// ignored (full 200 response); syntactically valid but unsatisfiable
/// ranges yield 416.
fn parse_range(header: &str, size: u64) -> RangeOutcome {
    let Some(spec) = header.strip_prefix("bytes=") else {
        return RangeOutcome::Full;
    };
    if spec.contains(',') {
        return RangeOutcome::Full;
    }
    let Some((start, end)) = spec.trim().split_once('-') else {
        return RangeOutcome::Full;
    };

    if start.is_empty() {
        // suffix form: last N bytes
        let Ok(n) = end.parse::<u64>() else {
            return RangeOutcome::Full;
        };
        if n == 0 || size == 0 {
            return RangeOutcome::Unsatisfiable;
        }
        return RangeOutcome::Partial(size.saturating_sub(n), size - 1);
    }

    let Ok(start) = start.parse::<u64>() else {
        return RangeOutcome::Full;
    };
    if start >= size {
        return RangeOutcome::Unsatisfiable;
    }
    if end.is_empty() {
        return RangeOutcome::Partial(start, size - 1);
    }
    let Ok(end) = end.parse::<u64>() else {
        return RangeOutcome::Full;
    };
    if start > end {
        return RangeOutcome::Full;
    }
    RangeOutcome::Partial(start, end.min(size - 1))
}

fn accepts_gzip(client: &ClientChannel) -> bool {
    client
        .req_headers()
        .get(ACCEPT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .map(|value| {
            value
                .split(',')
                .any(|token| token.trim().split(';').next() == Some("gzip"))
        })
        .unwrap_or(false)
}

fn gzip_eligible(client: &ClientChannel, gzip_types: &[String]) -> bool {
    if gzip_types.is_empty() || !accepts_gzip(client) {
        return false;
    }
    client
        .response_header(&CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|content_type| gzip_types.iter().any(|prefix| content_type.starts_with(prefix)))
        .unwrap_or(false)
}

/// Serves an open cache file with conditional-GET and single-range
/// semantics, using the file's mtime as the validator. The handle stays
/// readable even if the file is unlinked concurrently.
pub(crate) async fn serve_file(
    client: &mut ClientChannel,
    file: &mut File,
    size: u64,
    mtime: SystemTime,
    gzip_types: &[String],
) -> io::Result<()> {
    let last_modified = fmt_http_date(mtime);
    if let Ok(value) = HeaderValue::from_str(&last_modified) {
        client.insert_header(LAST_MODIFIED, value);
    }
    client.insert_header(ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    if let Some(since) = client
        .req_headers()
        .get(IF_MODIFIED_SINCE)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_http_date)
        && unix_secs(mtime) <= unix_secs(since)
    {
        client.remove_header(&ACCEPT_RANGES);
        return client.send_head(StatusCode::NOT_MODIFIED);
    }

    let range = client
        .req_headers()
        .get(RANGE)
        .and_then(|value| value.to_str().ok())
        .map(|value| parse_range(value, size))
        .unwrap_or(RangeOutcome::Full);

    match range {
        RangeOutcome::Unsatisfiable => {
            let value = format!("bytes */{size}");
            if let Ok(value) = HeaderValue::from_str(&value) {
                client.insert_header(CONTENT_RANGE, value);
            }
            client.send_head(StatusCode::RANGE_NOT_SATISFIABLE)
        }
        RangeOutcome::Partial(start, end) => {
            let len = end - start + 1;
            let content_range = format!("bytes {start}-{end}/{size}");
            if let Ok(value) = HeaderValue::from_str(&content_range) {
                client.insert_header(CONTENT_RANGE, value);
            }
            client.insert_header(CONTENT_LENGTH, HeaderValue::from(len));
            client.send_head(StatusCode::PARTIAL_CONTENT)?;
            file.seek(SeekFrom::Start(start)).await?;
            copy_to_sink(file, client, Some(len)).await?;
            Ok(())
        }
        RangeOutcome::Full => {
            if gzip_eligible(client, gzip_types) {
                client.insert_header(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
                client.send_head(StatusCode::OK)?;
                let mut gzip = GzipSink::new(&mut *client);
                copy_to_sink(file, &mut gzip, Some(size)).await?;
                gzip.finish().await?;
                Ok(())
            } else {
                client.insert_header(CONTENT_LENGTH, HeaderValue::from(size));
                client.send_head(StatusCode::OK)?;
                copy_to_sink(file, client, Some(size)).await?;
                Ok(())
            }
        }
    }
}
