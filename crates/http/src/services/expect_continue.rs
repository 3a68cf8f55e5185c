use async_trait::async_trait;
use http::{Version, header};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::pipeline::{Outcome, ProgressTask, Service, ServiceData, Stage};
use crate::protocol::HttpError;

/// Answers `Expect: 100-continue` with an interim `100 Continue` before any body is read.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExpectContinue;

#[async_trait]
impl Service for ExpectContinue {
    fn stage(&self) -> Stage {
        Stage::ParseRequest
    }

    fn priority(&self) -> i32 {
        10
    }

    fn can_handle(&self, task: &ProgressTask) -> Option<ServiceData> {
        let request = task.request()?;
        let expects_continue = request
            .headers()
            .get(header::EXPECT)
            .is_some_and(|value| value.as_bytes().eq_ignore_ascii_case(b"100-continue"));

        (expects_continue && request.version() == Version::HTTP_11 && task.body_state().unread_bytes() > 0)
            .then(ServiceData::none)
    }

    async fn execute(&self, task: &mut ProgressTask, _data: ServiceData) -> Result<Outcome, HttpError> {
        let writer = task.writer_mut();
        let sent = async {
            writer.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
            writer.flush().await
        };

        match sent.await {
            Ok(()) => info!("receive expect request header, sent continue response"),
            Err(e) => {
                debug!(cause = %e, "failed to send continue response");
                task.mark_broken();
            }
        }
        Ok(Outcome::Continue)
    }
}
