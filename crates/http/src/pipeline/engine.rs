//! Drives tasks through the stages.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::pipeline::{Outcome, ProgressTask, Services, Stage, SwitchProtocol};
use crate::protocol::HttpError;

/// Receives connections leaving the server's bookkeeping through a protocol switch.
pub trait ConnectionTracker: Send + Sync {
    fn untrack(&self, connection_id: u64);
}

/// How a task chain ended.
#[derive(Debug)]
pub enum ChainOutcome {
    /// The chain ran through, the task still owns the connection.
    Finished(ProgressTask),
    /// The connection was handed to another protocol.
    Switched,
}

/// Runs the registered services of each stage against a task.
#[derive(Clone)]
pub struct ServiceEngine {
    services: Arc<Services>,
    tracker: Option<Arc<dyn ConnectionTracker>>,
}

impl ServiceEngine {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services, tracker: None }
    }

    #[must_use]
    pub fn with_tracker(mut self, tracker: Arc<dyn ConnectionTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Runs the task from its current stage up to and including `terminate`.
    ///
    /// Services route the task only through its next stage; after every stage the task moves to
    /// that stage. An [`Outcome::Abort`] is handled here and never surfaces as an error.
    pub async fn execute_task_chain(&self, mut task: ProgressTask, terminate: Stage) -> Result<ChainOutcome, HttpError> {
        loop {
            let stage = task.current_stage();
            if stage > terminate {
                break;
            }

            self.execute_stage(&mut task, stage).await?;

            if stage == terminate || task.advance().is_none() {
                break;
            }
        }

        if let Some(handoff) = task.take_switch_protocol() {
            self.switch_protocol(task, handoff);
            return Ok(ChainOutcome::Switched);
        }
        Ok(ChainOutcome::Finished(task))
    }

    async fn execute_stage(&self, task: &mut ProgressTask, stage: Stage) -> Result<(), HttpError> {
        let services = self.services.group(stage).snapshot();
        let stage_watch = task.monitor_mut().start(stage.name(), None);

        for entry in services.iter() {
            if task.is_broken() {
                debug!(connection_id = task.connection_id(), %stage, "connection broken, abort stage");
                break;
            }

            let service = entry.service();
            let Some(data) = service.can_handle(task) else {
                continue;
            };
            task.mark_matched(stage);

            trace!(service = service.name(), %stage, "execute service");
            let watch = if task.monitor().is_enabled() {
                Some(task.monitor_mut().start(service.name().to_string(), Some(stage_watch)))
            } else {
                None
            };
            let outcome = service.execute(task, data).await;
            if let Some(watch) = watch {
                task.monitor_mut().stop(watch);
            }

            match outcome? {
                Outcome::Continue => {
                    if stage.is_single_execution() {
                        break;
                    }
                }
                Outcome::Abort { status, body } => {
                    debug!(service = service.name(), %stage, status = status.as_u16(), "service aborted the stage");
                    task.set_status(status);
                    if let Some(body) = body {
                        task.document_mut().push_boxed(body);
                    }
                    if stage < Stage::CreateResponse {
                        task.set_next_stage(Stage::CreateResponse);
                    }
                    break;
                }
            }
        }

        task.monitor_mut().stop(stage_watch);
        Ok(())
    }

    fn switch_protocol(&self, task: ProgressTask, handoff: SwitchProtocol) {
        let connection_id = task.connection_id();
        if let Some(tracker) = &self.tracker {
            tracker.untrack(connection_id);
        }

        debug!(connection_id, "switch protocol, hand over connection");
        let (reader, writer) = task.into_connection().into_parts();
        tokio::spawn(handoff(reader, writer));
    }
}

impl fmt::Debug for ServiceEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceEngine").field("services", &self.services).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ServiceData;
    use crate::pipeline::Service;
    use crate::pipeline::task::tests::task;
    use crate::source::BytesSource;
    use async_trait::async_trait;
    use futures::FutureExt;
    use http::StatusCode;
    use std::sync::Mutex;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::oneshot;

    type Log = Arc<Mutex<Vec<String>>>;

    #[derive(Clone, Copy)]
    enum Action {
        Continue,
        Abort,
        Fail,
        JumpTo(Stage),
    }

    struct Recorder {
        name: &'static str,
        stage: Stage,
        priority: i32,
        matches: bool,
        action: Action,
        log: Log,
    }

    impl Recorder {
        fn new(name: &'static str, stage: Stage, priority: i32, log: &Log) -> Self {
            Self { name, stage, priority, matches: true, action: Action::Continue, log: Arc::clone(log) }
        }

        fn action(mut self, action: Action) -> Self {
            self.action = action;
            self
        }

        fn unmatched(mut self) -> Self {
            self.matches = false;
            self
        }
    }

    #[async_trait]
    impl Service for Recorder {
        fn stage(&self) -> Stage {
            self.stage
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn name(&self) -> &str {
            self.name
        }

        fn can_handle(&self, _task: &ProgressTask) -> Option<ServiceData> {
            self.matches.then(ServiceData::none)
        }

        async fn execute(&self, task: &mut ProgressTask, _data: ServiceData) -> Result<Outcome, HttpError> {
            self.log.lock().unwrap().push(self.name.to_string());
            match self.action {
                Action::Continue => Ok(Outcome::Continue),
                Action::Abort => Ok(Outcome::abort_with(StatusCode::FORBIDDEN, BytesSource::text("denied"))),
                Action::Fail => Err(HttpError::service("boom")),
                Action::JumpTo(stage) => {
                    task.set_next_stage(stage);
                    Ok(Outcome::Continue)
                }
            }
        }
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    fn engine(services: Services) -> ServiceEngine {
        ServiceEngine::new(Arc::new(services))
    }

    #[tokio::test]
    async fn multi_stage_runs_in_priority_order() {
        let log = Log::default();
        let services = Services::new();
        services.add(Recorder::new("ten", Stage::ProcessDocument, 10, &log));
        services.add(Recorder::new("minus_five", Stage::ProcessDocument, -5, &log));
        services.add(Recorder::new("zero", Stage::ProcessDocument, 0, &log));

        let (task, _client) = task();
        let outcome = engine(services).execute_task_chain(task, Stage::Cleanup).await.unwrap();

        assert_eq!(entries(&log), ["minus_five", "zero", "ten"]);
        let ChainOutcome::Finished(task) = outcome else { panic!("chain must finish") };
        assert!(task.stage_matched(Stage::ProcessDocument));
        assert!(!task.stage_matched(Stage::CreateDocument));
    }

    #[tokio::test]
    async fn single_stage_stops_after_first_execution() {
        let log = Log::default();
        let services = Services::new();
        services.add(Recorder::new("skipped", Stage::CreateDocument, -10, &log).unmatched());
        services.add(Recorder::new("first", Stage::CreateDocument, 0, &log));
        services.add(Recorder::new("second", Stage::CreateDocument, 1, &log));

        let (task, _client) = task();
        engine(services).execute_task_chain(task, Stage::Cleanup).await.unwrap();

        assert_eq!(entries(&log), ["first"]);
    }

    #[tokio::test]
    async fn abort_routes_to_create_response() {
        let log = Log::default();
        let services = Services::new();
        services.add(Recorder::new("parse", Stage::ParseRequest, 0, &log).action(Action::Abort));
        services.add(Recorder::new("parse_late", Stage::ParseRequest, 1, &log));
        services.add(Recorder::new("document", Stage::CreateDocument, 0, &log));
        services.add(Recorder::new("response", Stage::CreateResponse, 0, &log));
        services.add(Recorder::new("cleanup", Stage::Cleanup, 0, &log));

        let (task, _client) = task();
        let outcome = engine(services).execute_task_chain(task, Stage::Cleanup).await.unwrap();

        assert_eq!(entries(&log), ["parse", "response", "cleanup"]);
        let ChainOutcome::Finished(task) = outcome else { panic!("chain must finish") };
        assert_eq!(task.response().status(), StatusCode::FORBIDDEN);
        assert_eq!(task.document().length(), Some(6));
    }

    #[tokio::test]
    async fn jump_skips_intermediate_stages() {
        let log = Log::default();
        let services = Services::new();
        services.add(Recorder::new("read", Stage::ReadRequest, 0, &log).action(Action::JumpTo(Stage::Cleanup)));
        services.add(Recorder::new("parse", Stage::ParseRequest, 0, &log));
        services.add(Recorder::new("send", Stage::SendResponse, 0, &log));
        services.add(Recorder::new("cleanup", Stage::Cleanup, 0, &log));

        let (task, _client) = task();
        engine(services).execute_task_chain(task, Stage::Cleanup).await.unwrap();

        assert_eq!(entries(&log), ["read", "cleanup"]);
    }

    #[tokio::test]
    async fn terminate_stage_ends_chain() {
        let log = Log::default();
        let services = Services::new();
        services.add(Recorder::new("read", Stage::ReadRequest, 0, &log));
        services.add(Recorder::new("parse", Stage::ParseRequest, 0, &log));
        services.add(Recorder::new("document", Stage::CreateDocument, 0, &log));

        let (task, _client) = task();
        engine(services).execute_task_chain(task, Stage::ParseRequest).await.unwrap();

        assert_eq!(entries(&log), ["read", "parse"]);
    }

    #[tokio::test]
    async fn service_error_surfaces() {
        let log = Log::default();
        let services = Services::new();
        services.add(Recorder::new("fail", Stage::CreateDocument, 0, &log).action(Action::Fail));
        services.add(Recorder::new("cleanup", Stage::Cleanup, 0, &log));

        let (task, _client) = task();
        let result = engine(services).execute_task_chain(task, Stage::Cleanup).await;

        assert!(matches!(result, Err(HttpError::ServiceError { .. })));
        assert_eq!(entries(&log), ["fail"]);
    }

    #[tokio::test]
    async fn broken_connection_aborts_stage() {
        let log = Log::default();
        let services = Services::new();
        services.add(Recorder::new("a", Stage::ProcessDocument, 0, &log));
        services.add(Recorder::new("b", Stage::ProcessDocument, 1, &log));

        let (mut task, _client) = task();
        task.mark_broken();
        engine(services).execute_task_chain(task, Stage::Cleanup).await.unwrap();

        assert!(entries(&log).is_empty());
    }

    struct Switcher(Mutex<Option<oneshot::Sender<Vec<u8>>>>);

    #[async_trait]
    impl Service for Switcher {
        fn stage(&self) -> Stage {
            Stage::CreateDocument
        }

        fn can_handle(&self, _task: &ProgressTask) -> Option<ServiceData> {
            Some(ServiceData::none())
        }

        async fn execute(&self, task: &mut ProgressTask, _data: ServiceData) -> Result<Outcome, HttpError> {
            let done = self.0.lock().unwrap().take();
            task.set_switch_protocol(move |mut reader, mut writer| {
                async move {
                    writer.write_all(b"switched").await.unwrap();
                    let leftover = reader.read_bytes(5).await.unwrap();
                    if let Some(done) = done {
                        let _ = done.send(leftover.to_vec());
                    }
                }
                .boxed()
            });
            Ok(Outcome::Continue)
        }
    }

    struct Untracked(Mutex<Vec<u64>>);

    impl ConnectionTracker for Untracked {
        fn untrack(&self, connection_id: u64) {
            self.0.lock().unwrap().push(connection_id);
        }
    }

    #[tokio::test]
    async fn protocol_switch_hands_over_streams() {
        let (done, leftover) = oneshot::channel();
        let services = Services::new();
        services.add(Switcher(Mutex::new(Some(done))));
        let tracker = Arc::new(Untracked(Mutex::new(vec![])));
        let engine = engine(services).with_tracker(Arc::clone(&tracker) as Arc<dyn ConnectionTracker>);

        let (task, mut client) = task();
        client.write_all(b"hello").await.unwrap();
        let outcome = engine.execute_task_chain(task, Stage::Cleanup).await.unwrap();

        assert!(matches!(outcome, ChainOutcome::Switched));
        assert_eq!(leftover.await.unwrap(), b"hello");
        assert_eq!(*tracker.0.lock().unwrap(), [7]);

        let mut reply = [0u8; 8];
        tokio::io::AsyncReadExt::read_exact(&mut client, &mut reply).await.unwrap();
        assert_eq!(&reply, b"switched");
    }
}
