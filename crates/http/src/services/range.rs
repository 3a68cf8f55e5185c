use async_trait::async_trait;
use http::{HeaderValue, Method, StatusCode, header};
use tracing::debug;

use crate::pipeline::{Outcome, ProgressTask, Service, ServiceData, Stage};
use crate::protocol::{HttpError, RangeError};
use crate::source::{MultiRangeSource, RangeSet, RangeSource};

const BYTES: HeaderValue = HeaderValue::from_static("bytes");

/// Serves `Range` requests from a document made of one source of known length.
///
/// One merged range is answered with a plain `206 Partial Content` body, several ranges with a
/// `multipart/byteranges` body. A range outside the document yields `416 Range Not Satisfiable`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RangeService;

#[async_trait]
impl Service for RangeService {
    fn stage(&self) -> Stage {
        Stage::ProcessDocument
    }

    fn priority(&self) -> i32 {
        100
    }

    fn can_handle(&self, task: &ProgressTask) -> Option<ServiceData> {
        let document = task.document();
        if task.response().status() != StatusCode::OK || document.sources().len() != 1 {
            return None;
        }
        document.length().map(ServiceData::new)
    }

    async fn execute(&self, task: &mut ProgressTask, data: ServiceData) -> Result<Outcome, HttpError> {
        let Some(total) = data.downcast::<u64>() else {
            return Ok(Outcome::Continue);
        };
        task.response_mut().headers_mut().insert(header::ACCEPT_RANGES, BYTES);

        let Some(range) = requested_range(task) else {
            return Ok(Outcome::Continue);
        };

        match RangeSet::parse(&range, total, task.config().range_join_gap) {
            Err(RangeError::Invalid { reason }) => {
                debug!(%reason, "ignore invalid range header");
                Ok(Outcome::Continue)
            }
            Err(RangeError::NotSatisfiable { length }) => {
                task.document_mut().clear_sources();
                insert_header(task, header::CONTENT_RANGE, &format!("bytes */{length}"));
                Ok(Outcome::abort(StatusCode::RANGE_NOT_SATISFIABLE))
            }
            Ok(ranges) => {
                let Some(source) = task.document_mut().take_sources().pop() else {
                    return Ok(Outcome::Continue);
                };

                if let [range] = ranges.ranges() {
                    insert_header(task, header::CONTENT_RANGE, &range.content_range(total));
                    task.document_mut().push_source(RangeSource::new(source, *range));
                } else {
                    let multipart = MultiRangeSource::new(source, &ranges);
                    if let Some(mime) = crate::source::HttpDataSource::mime_type(&multipart) {
                        insert_header(task, header::CONTENT_TYPE, mime.as_ref());
                    }
                    task.document_mut().push_source(multipart);
                }

                debug!(ranges = ranges.ranges().len(), total, "serve partial content");
                task.set_status(StatusCode::PARTIAL_CONTENT);
                Ok(Outcome::Continue)
            }
        }
    }
}

/// The `Range` header of a `GET` request.
fn requested_range(task: &ProgressTask) -> Option<String> {
    let request = task.request()?;
    if request.method() != Method::GET {
        return None;
    }
    request.headers().get(header::RANGE)?.to_str().ok().map(str::to_string)
}

fn insert_header(task: &mut ProgressTask, name: header::HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        task.response_mut().headers_mut().insert(name, value);
    }
}
