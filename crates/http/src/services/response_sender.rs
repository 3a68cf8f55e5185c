use std::io;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio_util::codec::Encoder;
use tracing::{debug, warn};

use crate::codec::HeaderEncoder;
use crate::pipeline::{Outcome, ProgressTask, Service, ServiceData, Stage};
use crate::protocol::{HttpError, PayloadSize, ResponseHead, SendError, status_allows_body};
use crate::source::{ChunkedSource, HttpDataSource, LazySource};

/// Writes the response head and the document's data sources to the connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResponseSender;

#[async_trait]
impl Service for ResponseSender {
    fn stage(&self) -> Stage {
        Stage::SendResponse
    }

    fn can_handle(&self, task: &ProgressTask) -> Option<ServiceData> {
        task.payload_size().map(ServiceData::new)
    }

    async fn execute(&self, task: &mut ProgressTask, data: ServiceData) -> Result<Outcome, HttpError> {
        let payload_size = data.downcast::<PayloadSize>().unwrap_or(PayloadSize::Empty);
        let send_body = status_allows_body(task.response().status()) && !task.is_head() && !payload_size.is_empty();

        let mut head = BytesMut::new();
        HeaderEncoder.encode((copy_head(task.response()), payload_size), &mut head)?;

        let sources = if send_body { task.document_mut().take_sources() } else { Vec::new() };
        let chunk_size = task.config().chunk_buffer_size;
        let writer = task.writer_mut();

        let sent = async {
            writer.write_all(&head).await?;
            let written = match payload_size {
                PayloadSize::Length(_) | PayloadSize::UntilClose => {
                    let mut written = 0;
                    for mut source in sources {
                        written += source.write_to(&mut **writer, 0, None).await?;
                    }
                    written
                }
                PayloadSize::Chunked => ChunkedSource::new(LazySource::new(sources), chunk_size).write_to(&mut **writer, 0, None).await?,
                PayloadSize::Empty => 0,
            };
            writer.flush().await?;
            Ok::<_, io::Error>(written)
        };

        match sent.await {
            Ok(written) => {
                if let PayloadSize::Length(expected) = payload_size
                    && send_body
                    && written != expected
                {
                    warn!(expected, written, "response body length differs from its content-length");
                    task.set_close_connection();
                }
            }
            Err(e) => {
                debug!(connection_id = task.connection_id(), cause = %SendError::io(e), "failed to send response");
                task.mark_broken();
            }
        }
        Ok(Outcome::Continue)
    }
}

/// The encoder takes the head by value while the task keeps its own.
fn copy_head(head: &ResponseHead) -> ResponseHead {
    let mut copy = ResponseHead::new(());
    *copy.status_mut() = head.status();
    *copy.version_mut() = head.version();
    copy.headers_mut().clone_from(head.headers());
    copy
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::task_tests::task as new_task;
    use crate::protocol::{RawRequestHead, RequestHeader};
    use crate::services::ResponseCreator;
    use crate::source::BytesSource;
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn task_for(request_line: &str) -> (ProgressTask, DuplexStream) {
        let (mut task, client) = new_task();
        let raw = RawRequestHead::from_request_line(request_line).unwrap();
        task.set_request(RequestHeader::try_from(raw).unwrap());
        (task, client)
    }

    async fn respond(task: &mut ProgressTask, client: &mut DuplexStream) -> String {
        ResponseCreator.execute(task, ServiceData::none()).await.unwrap();
        let data = ResponseSender.can_handle(task).unwrap();
        ResponseSender.execute(task, data).await.unwrap();
        task.writer_mut().shutdown().await.unwrap();

        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn fixed_length_response() {
        let (mut task, mut client) = task_for("GET / HTTP/1.1");
        task.document_mut().push_source(BytesSource::text("Hello "));
        task.document_mut().push_source(BytesSource::new("World!"));

        let out = respond(&mut task, &mut client).await;
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("content-length: 12\r\n"));
        assert!(out.ends_with("\r\n\r\nHello World!"));
    }

    #[tokio::test]
    async fn chunked_response() {
        let (mut task, mut client) = task_for("GET / HTTP/1.1");
        let parts: Vec<Box<dyn HttpDataSource>> = vec![Box::new(BytesSource::new("abc")), Box::new(BytesSource::new("def"))];
        task.document_mut().push_source(LazySource::new(parts));

        let out = respond(&mut task, &mut client).await;
        assert!(out.contains("transfer-encoding: chunked\r\n"));
        assert!(!out.contains("content-length"));
        assert!(out.ends_with("0\r\n\r\n"));
    }

    #[tokio::test]
    async fn head_request_has_no_body() {
        let (mut task, mut client) = task_for("HEAD / HTTP/1.1");
        task.document_mut().push_source(BytesSource::text("invisible"));

        let out = respond(&mut task, &mut client).await;
        assert!(out.contains("content-length: 9\r\n"));
        assert!(out.ends_with("\r\n\r\n"));
        assert!(!out.contains("invisible"));
    }

    #[tokio::test]
    async fn http10_unknown_length_is_unframed() {
        let (mut task, mut client) = task_for("GET / HTTP/1.0");
        let parts: Vec<Box<dyn HttpDataSource>> = vec![Box::new(BytesSource::new("abc")), Box::new(BytesSource::new("def"))];
        task.document_mut().push_source(LazySource::new(parts));

        let out = respond(&mut task, &mut client).await;
        assert!(out.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(out.contains("connection: close\r\n"));
        assert!(!out.contains("transfer-encoding"));
        assert!(!out.contains("content-length"));
        assert!(out.ends_with("\r\n\r\nabcdef"));
        assert!(task.close_connection());
    }

    #[tokio::test]
    async fn http10_response() {
        let (mut task, mut client) = task_for("GET / HTTP/1.0");
        task.document_mut().push_source(BytesSource::text("old"));

        let out = respond(&mut task, &mut client).await;
        assert!(out.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(out.contains("connection: close\r\n"));
    }
}
