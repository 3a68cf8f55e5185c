use async_trait::async_trait;
use http::{HeaderValue, StatusCode, Version, header};
use tracing::trace;

use crate::pipeline::{Outcome, ProgressTask, Service, ServiceData, Stage};
use crate::protocol::{CLOSE, HttpError, KEEP_ALIVE, PayloadSize, status_allows_body};
use crate::source::BytesSource;

/// Statuses after which the connection can not be trusted to carry another request.
const CONNECTION_FATAL: [StatusCode; 4] = [
    StatusCode::BAD_REQUEST,
    StatusCode::REQUEST_TIMEOUT,
    StatusCode::LENGTH_REQUIRED,
    StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
];

/// Completes the response head: status, body framing, content type and connection handling.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResponseCreator;

#[async_trait]
impl Service for ResponseCreator {
    fn stage(&self) -> Stage {
        Stage::CreateResponse
    }

    fn can_handle(&self, _task: &ProgressTask) -> Option<ServiceData> {
        Some(ServiceData::none())
    }

    async fn execute(&self, task: &mut ProgressTask, _data: ServiceData) -> Result<Outcome, HttpError> {
        if !task.status_set() && !task.stage_matched(Stage::CreateDocument) && !task.document().has_body() {
            task.set_status(StatusCode::NOT_FOUND);
        }

        let status = task.response().status();
        if (status.is_client_error() || status.is_server_error()) && !task.document().has_body() {
            task.document_mut().push_source(BytesSource::text(format!("{status}\r\n")));
        }

        let payload_size = match status_allows_body(status).then(|| PayloadSize::from_length(task.document().length())) {
            // http/1.0 clients know no chunked encoding
            Some(PayloadSize::Chunked) if task.response().version() == Version::HTTP_10 => PayloadSize::UntilClose,
            Some(payload_size) => payload_size,
            None => PayloadSize::Empty,
        };
        task.set_payload_size(payload_size);

        let mime = task.document().mime_type();
        let server_name = HeaderValue::from_str(&task.config().server_name).ok();
        let keep_alive = keep_alive(task, status) && !payload_size.is_until_close();
        let headers = task.response_mut().headers_mut();

        if status_allows_body(status)
            && !payload_size.is_empty()
            && !headers.contains_key(header::CONTENT_TYPE)
            && let Some(value) = mime.and_then(|mime| HeaderValue::from_str(mime.as_ref()).ok())
        {
            headers.insert(header::CONTENT_TYPE, value);
        }
        if let Some(server_name) = server_name {
            headers.entry(header::SERVER).or_insert(server_name);
        }

        // an upgrade response carries its own connection header
        if status != StatusCode::SWITCHING_PROTOCOLS {
            headers.insert(header::CONNECTION, if keep_alive { KEEP_ALIVE } else { CLOSE });
            if !keep_alive {
                task.set_close_connection();
            }
        }

        trace!(status = status.as_u16(), ?payload_size, keep_alive, "created response");
        Ok(Outcome::Continue)
    }
}

fn keep_alive(task: &ProgressTask, status: StatusCode) -> bool {
    task.request().is_some_and(|request| request.keep_alive_requested())
        && !task.close_connection()
        && !task.is_broken()
        && !CONNECTION_FATAL.contains(&status)
}
