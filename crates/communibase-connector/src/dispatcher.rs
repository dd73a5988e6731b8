//! Bounded-concurrency execution of remote requests.
//!
//! Requests are queued on an unbounded channel and pulled in FIFO order by a single loop, which
//! hands each one to its own task as soon as one of the fixed number of slots frees up.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use sentry::{Hub, SentryFutureExt};
use tokio::runtime;
use tokio::sync::{Semaphore, mpsc};

use crate::completion::{Completer, Completion};
use crate::error::ConnectorError;
use crate::remote::{Credentials, RemoteRequest, RemoteResponse, Transport};

/// A queued remote request together with the completer of its result.
#[derive(Debug)]
struct Task {
    request: RemoteRequest,
    completer: Completer<RemoteResponse>,
}

/// Executes at most `concurrency` remote requests at a time.
#[derive(Debug)]
pub struct Dispatcher {
    queue: mpsc::UnboundedSender<Task>,
    credentials: Arc<RwLock<Credentials>>,
}

impl Dispatcher {
    /// Creates a dispatcher and spawns its queue loop onto `runtime`.
    ///
    /// The loop ends once the dispatcher is dropped and every queued task has been started.
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Credentials,
        concurrency: usize,
        runtime: &runtime::Handle,
    ) -> Self {
        let (queue, receiver) = mpsc::unbounded_channel();
        let credentials = Arc::new(RwLock::new(credentials));

        let worker = Worker {
            transport,
            credentials: Arc::clone(&credentials),
            slots: Arc::new(Semaphore::new(concurrency.max(1))),
            concurrency: concurrency.max(1),
            runtime: runtime.clone(),
        };
        runtime.spawn(worker.run(receiver).bind_hub(Hub::new_from_top(Hub::current())));

        Self { queue, credentials }
    }

    /// Queues `request` and returns the completion of its eventual result.
    ///
    /// This never waits for a free slot.
    pub fn submit(&self, request: RemoteRequest) -> Completion<RemoteResponse> {
        let (completer, completion) = Completion::pending();
        metric!(counter("dispatcher.submitted") += 1);
        tracing::trace!(method = %request.method, path = %request.path, "Queueing remote request");

        if let Err(mpsc::error::SendError(task)) = self.queue.send(Task { request, completer }) {
            task.completer.reject(ConnectorError::Transport(
                "the request dispatcher has shut down".into(),
            ));
        }
        completion
    }

    /// The credentials tasks are currently authenticated with.
    pub fn credentials(&self) -> Credentials {
        self.credentials.read().clone()
    }

    /// Replaces the access token used by every task started from now on.
    pub fn set_access_token(&self, access_token: Option<String>) {
        self.credentials.write().access_token = access_token;
    }
}

struct Worker {
    transport: Arc<dyn Transport>,
    credentials: Arc<RwLock<Credentials>>,
    slots: Arc<Semaphore>,
    concurrency: usize,
    runtime: runtime::Handle,
}

impl Worker {
    async fn run(self, mut receiver: mpsc::UnboundedReceiver<Task>) {
        while let Some(task) = receiver.recv().await {
            let Ok(permit) = Arc::clone(&self.slots).acquire_owned().await else {
                break;
            };

            let credentials = self.credentials.read().clone();
            if let Err(error) = credentials.ensure_present() {
                metric!(counter("dispatcher.failed") += 1, "reason" => "configuration");
                task.completer.reject(error);
                continue;
            }

            let in_flight = self.concurrency - self.slots.available_permits();
            metric!(gauge("dispatcher.in_flight") = in_flight as u64);

            let transport = Arc::clone(&self.transport);
            let future = async move {
                let Task { request, completer } = task;
                let start = Instant::now();
                let result = transport.execute(&request, &credentials).await;
                metric!(timer("dispatcher.request_duration") = start.elapsed());

                if let Err(error) = &result {
                    metric!(counter("dispatcher.failed") += 1, "reason" => "remote");
                    tracing::debug!(
                        method = %request.method,
                        path = %request.path,
                        error = %error,
                        "Remote request failed"
                    );
                }
                completer.settle(result);
                drop(permit);
            };
            self.runtime
                .spawn(future.bind_hub(Hub::new_from_top(Hub::current())));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::test::FakeTransport;
    use crate::types::EntityType;

    fn dispatcher(transport: &Arc<FakeTransport>, concurrency: usize) -> Dispatcher {
        Dispatcher::new(
            transport.clone(),
            Credentials::api_key("secret"),
            concurrency,
            &runtime::Handle::current(),
        )
    }

    #[tokio::test]
    async fn test_submit_executes_request() {
        let transport = FakeTransport::new();
        transport.insert("Person", json!({"_id": "52259f95dafd757b06002221", "name": "Henk"}));
        let dispatcher = dispatcher(&transport, 8);

        let response = dispatcher
            .submit(RemoteRequest::list(&EntityType::new("Person")))
            .await
            .unwrap();

        assert_eq!(
            response.records,
            json!([{"_id": "52259f95dafd757b06002221", "name": "Henk"}])
        );
        assert_eq!(transport.call_count(), 1);
        assert_eq!(
            transport.credentials()[0].api_key.as_deref(),
            Some("secret")
        );
    }

    #[tokio::test]
    async fn test_bounded_concurrency() {
        let transport = FakeTransport::new();
        transport.set_delay(Duration::from_millis(20));
        let dispatcher = dispatcher(&transport, 3);

        let person = EntityType::new("Person");
        let completions: Vec<_> = (0..10)
            .map(|_| dispatcher.submit(RemoteRequest::list(&person)))
            .collect();
        for result in futures::future::join_all(completions).await {
            assert!(result.is_ok());
        }

        assert_eq!(transport.call_count(), 10);
        assert_eq!(transport.max_in_flight(), 3);
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let transport = FakeTransport::new();
        transport.fail_path(
            "Person.json/crud",
            ConnectorError::Remote {
                code: 503,
                message: "Service unavailable".into(),
                errors: json!({}),
            },
        );
        let dispatcher = dispatcher(&transport, 8);

        let failing = dispatcher.submit(RemoteRequest::list(&EntityType::new("Person")));
        let succeeding = dispatcher.submit(RemoteRequest::list(&EntityType::new("Company")));

        assert!(matches!(
            failing.await,
            Err(ConnectorError::Remote { code: 503, .. })
        ));
        assert!(succeeding.await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_credentials() {
        let transport = FakeTransport::new();
        let dispatcher = Dispatcher::new(
            transport.clone(),
            Credentials::default(),
            8,
            &runtime::Handle::current(),
        );

        let result = dispatcher
            .submit(RemoteRequest::list(&EntityType::new("Person")))
            .await;

        assert!(matches!(result, Err(ConnectorError::Configuration(_))));
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_access_token_applies_to_later_tasks() {
        let transport = FakeTransport::new();
        let dispatcher = Dispatcher::new(
            transport.clone(),
            Credentials::default(),
            8,
            &runtime::Handle::current(),
        );

        dispatcher.set_access_token(Some("token".into()));
        let result = dispatcher
            .submit(RemoteRequest::list(&EntityType::new("Person")))
            .await;

        assert!(result.is_ok());
        assert_eq!(
            transport.credentials()[0].access_token.as_deref(),
            Some("token")
        );
    }
}
