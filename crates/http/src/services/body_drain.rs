use async_trait::async_trait;
use tracing::debug;

use crate::pipeline::{Outcome, ProgressTask, Service, ServiceData, Stage};
use crate::protocol::HttpError;

/// Discards request content no service consumed, so the next request starts at its head.
#[derive(Debug, Default, Clone, Copy)]
pub struct BodyDrain;

#[async_trait]
impl Service for BodyDrain {
    fn stage(&self) -> Stage {
        Stage::Cleanup
    }

    fn can_handle(&self, task: &ProgressTask) -> Option<ServiceData> {
        // a connection about to close needs no realignment
        (task.body_state().unread_bytes() > 0 && !task.close_connection()).then(ServiceData::none)
    }

    async fn execute(&self, task: &mut ProgressTask, _data: ServiceData) -> Result<Outcome, HttpError> {
        let discarded = task.content().discard().await;
        if let Err(e) = discarded {
            debug!(connection_id = task.connection_id(), cause = %e, "failed to discard request content");
            task.mark_broken();
        }
        Ok(Outcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::task_tests::task as new_task;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn drains_unread_body() {
        let (mut task, mut client) = new_task();
        client.write_all(b"0123456789GET /next HTTP/1.1\r\n").await.unwrap();
        task.set_body_length(10);

        let mut head = [0u8; 4];
        task.content().read(&mut head).await.unwrap();

        let data = BodyDrain.can_handle(&task).unwrap();
        BodyDrain.execute(&mut task, data).await.unwrap();
        assert_eq!(task.body_state().unread_bytes(), 0);
        assert!(BodyDrain.can_handle(&task).is_none());
        assert_eq!(task.reader_mut().read_line().await.unwrap().as_deref(), Some("GET /next HTTP/1.1"));
    }

    #[tokio::test]
    async fn truncated_body_breaks_connection() {
        let (mut task, mut client) = new_task();
        client.write_all(b"short").await.unwrap();
        drop(client);
        task.set_body_length(10);

        BodyDrain.execute(&mut task, ServiceData::none()).await.unwrap();
        assert!(task.is_broken());
    }
}
