use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{debug, info, trace};

use crate::ensure;
use crate::pipeline::{Outcome, ProgressTask, Service, ServiceData, Stage};
use crate::protocol::{HttpError, ParseError, RawRequestHead};
use crate::reader::NetworkReader;
use crate::server::BoxedReader;

/// Empty lines tolerated before a request line.
const MAX_LEADING_EMPTY_LINES: usize = 4;

/// Reads the request line and header lines of the next request.
///
/// The first byte must arrive within the configured first byte timeout, otherwise the client
/// gets `408 Request Timeout`. A connection closed before sending anything ends the task
/// without any response.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestReader;

#[async_trait]
impl Service for RequestReader {
    fn stage(&self) -> Stage {
        Stage::ReadRequest
    }

    fn can_handle(&self, task: &ProgressTask) -> Option<ServiceData> {
        task.raw_request().is_none().then(ServiceData::none)
    }

    async fn execute(&self, task: &mut ProgressTask, _data: ServiceData) -> Result<Outcome, HttpError> {
        let first_byte_timeout = task.config().first_byte_timeout;
        let limits = HeadLimits { max_bytes: task.config().max_header_bytes, max_count: task.config().max_header_count };

        let reader = task.reader_mut();
        if reader.buffered() == 0 {
            match timeout(first_byte_timeout, reader.fill()).await {
                Err(_) => {
                    let e = ParseError::Timeout { waited_ms: first_byte_timeout.as_millis() };
                    info!(remote_addr = %task.remote_addr(), cause = %e, "request timeout");
                    task.set_close_connection();
                    return Ok(Outcome::abort(e.status_code()));
                }
                Ok(Err(e)) => return Ok(disconnected(task, &ParseError::io(e))),
                Ok(Ok(0)) => {
                    trace!(connection_id = task.connection_id(), "connection closed before a request arrived");
                    task.set_close_connection();
                    task.set_next_stage(Stage::Cleanup);
                    return Ok(Outcome::Continue);
                }
                Ok(Ok(_)) => {}
            }
        }

        match read_head(task.reader_mut(), limits).await {
            Ok(Some(head)) => {
                trace!(method = %head.method, target = %head.target, headers = head.headers.len(), "read request head");
                task.set_raw_request(head);
                Ok(Outcome::Continue)
            }
            Ok(None) => Ok(disconnected(task, &ParseError::io(std::io::ErrorKind::UnexpectedEof))),
            Err(e @ ParseError::Io { .. }) => Ok(disconnected(task, &e)),
            Err(e) => {
                debug!(remote_addr = %task.remote_addr(), cause = %e, "malformed request head");
                task.set_close_connection();
                Ok(Outcome::abort(e.status_code()))
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct HeadLimits {
    max_bytes: usize,
    max_count: usize,
}

/// Reads one request head, `None` when the stream ended first.
async fn read_head(reader: &mut NetworkReader<BoxedReader>, limits: HeadLimits) -> Result<Option<RawRequestHead>, ParseError> {
    let mut leading = 0;
    let request_line = loop {
        let Some(line) = reader.read_line_bounded(limits.max_bytes).await? else {
            return Ok(None);
        };
        if !line.is_empty() {
            break line;
        }
        leading += 1;
        ensure!(leading <= MAX_LEADING_EMPTY_LINES, ParseError::invalid_request_line("too many empty lines"));
    };

    let mut head = RawRequestHead::from_request_line(&request_line)?;
    let mut head_bytes = request_line.len() + 2;
    loop {
        let remaining = limits.max_bytes.saturating_sub(head_bytes);
        let line = reader.read_line_bounded(remaining).await.map_err(|e| match e {
            ParseError::TooLargeHeader { current_size, .. } => {
                ParseError::too_large_header(head_bytes + current_size, limits.max_bytes)
            }
            e => e,
        })?;
        let Some(line) = line else {
            return Ok(None);
        };
        if line.is_empty() {
            return Ok(Some(head));
        }

        ensure!(head.headers.len() < limits.max_count, ParseError::too_many_headers(limits.max_count));
        head_bytes += line.len() + 2;
        head.push_header_line(&line)?;
    }
}

/// The peer went away or the stream failed: no response, close the connection.
fn disconnected(task: &mut ProgressTask, cause: &ParseError) -> Outcome {
    debug!(connection_id = task.connection_id(), cause = %cause, "connection lost while reading request");
    task.mark_broken();
    task.set_close_connection();
    task.set_next_stage(Stage::Cleanup);
    Outcome::Continue
}
