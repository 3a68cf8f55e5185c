use async_trait::async_trait;
use http::{StatusCode, header};
use tracing::debug;

use crate::pipeline::{Outcome, ProgressTask, Service, ServiceData, Stage};
use crate::protocol::{HttpError, ParseError, RequestHeader};

/// Turns the raw request head into a typed [`RequestHeader`] and determines the body length.
///
/// Request bodies must be framed with `Content-Length`; a `Transfer-Encoding` body is answered
/// with `411 Length Required`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestParser;

#[async_trait]
impl Service for RequestParser {
    fn stage(&self) -> Stage {
        Stage::ParseRequest
    }

    fn can_handle(&self, task: &ProgressTask) -> Option<ServiceData> {
        task.raw_request().is_some().then(ServiceData::none)
    }

    async fn execute(&self, task: &mut ProgressTask, _data: ServiceData) -> Result<Outcome, HttpError> {
        let Some(raw) = task.take_raw_request() else {
            return Ok(Outcome::Continue);
        };

        let request = match RequestHeader::try_from(raw) {
            Ok(request) => request,
            Err(e) => return Ok(bad_request(task, &e)),
        };

        let chunked = request.headers().contains_key(header::TRANSFER_ENCODING);
        let content_length = content_length(&request);
        task.set_request(request);

        if chunked {
            debug!(remote_addr = %task.remote_addr(), "transfer-encoding request bodies are not supported");
            task.set_close_connection();
            return Ok(Outcome::abort(StatusCode::LENGTH_REQUIRED));
        }

        match content_length {
            Ok(length) => {
                task.set_body_length(length);
                Ok(Outcome::Continue)
            }
            Err(e) => Ok(bad_request(task, &e)),
        }
    }
}

/// The declared body length; repeated headers must agree.
fn content_length(request: &RequestHeader) -> Result<u64, ParseError> {
    let mut length = None;
    for value in request.headers().get_all(header::CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|value| value.trim().parse::<u64>().ok())
            .ok_or_else(|| ParseError::invalid_content_length(format!("{value:?}")))?;

        match length {
            Some(previous) if previous != parsed => {
                return Err(ParseError::invalid_content_length("conflicting values"));
            }
            _ => length = Some(parsed),
        }
    }
    Ok(length.unwrap_or(0))
}

fn bad_request(task: &mut ProgressTask, cause: &ParseError) -> Outcome {
    debug!(remote_addr = %task.remote_addr(), cause = %cause, "invalid request");
    task.set_close_connection();
    Outcome::abort(cause.status_code())
}
