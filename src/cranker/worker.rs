//! Execution worker pool.
//!
//! Workers share one request queue of capacity 1 and hand each request to the
//! [`CrankSubmitter`]. A failed attempt is retried for that same request,
//! paced by an exponential backoff, until it succeeds or its retry budget is
//! spent. Either way the request yields exactly one response unless
//! cancellation arrives first. A submitter that panics leaves the worker
//! unable to answer, so that is reported on the fatal channel.

use super::backoff::ExponentialBackoff;
use crate::error::{SubmitError, WorkerError};
use crate::feed::{PeriodWithPayout, PipelineData};
use crate::submit::{CrankParams, CrankSubmitter};
use solana_pubkey::Pubkey;
use solana_signature::Signature;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Capacity of the request queue between the core and the workers
pub const REQUEST_QUEUE_CAPACITY: usize = 1;

/// One crank attempt chosen by the decision core
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrankRequest {
    pub pipeline: Pubkey,
    pub data: PipelineData,
    pub period: PeriodWithPayout,
    /// Slot at which the attempt was made
    pub slot: u64,
}

impl CrankRequest {
    pub fn params(&self, payer: Pubkey) -> CrankParams {
        CrankParams {
            payer,
            pipeline: self.pipeline,
            controller: self.data.controller,
            vault: self.data.vault,
            fee_vault: self.data.fee_vault,
            period: self.period,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrankResponse {
    pub request: CrankRequest,
    pub worker: usize,
    /// Submissions made for this request, retries included
    pub attempts: u32,
    pub result: Result<Signature, SubmitError>,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub payer: Pubkey,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Retries per request after the first failed submission
    pub max_retries: u32,
}

type SharedRequests = Arc<Mutex<mpsc::Receiver<CrankRequest>>>;

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` workers draining `requests`
    pub fn spawn(
        count: usize,
        settings: WorkerSettings,
        submitter: Arc<dyn CrankSubmitter>,
        requests: mpsc::Receiver<CrankRequest>,
        responses: mpsc::UnboundedSender<CrankResponse>,
        fatal: mpsc::Sender<WorkerError>,
        cancel: CancellationToken,
    ) -> Self {
        let requests: SharedRequests = Arc::new(Mutex::new(requests));
        let handles = (0..count.max(1))
            .map(|id| {
                let worker = Worker {
                    id,
                    settings: settings.clone(),
                    submitter: submitter.clone(),
                    requests: requests.clone(),
                    responses: responses.clone(),
                    fatal: fatal.clone(),
                    cancel: cancel.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        log::info!(
            "👷 Spawned {} crank worker(s) using '{}'",
            count.max(1),
            submitter.name()
        );
        Self { handles }
    }

    /// Wait for every worker to exit
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                log::error!("❌ Crank worker panicked: {}", e);
            }
        }
    }
}

/// How one submission ended
enum Attempt {
    Submitted(Signature),
    Failed(SubmitError),
    Canceled,
    Panicked,
}

/// How one request ended
enum Outcome {
    Done {
        attempts: u32,
        result: Result<Signature, SubmitError>,
    },
    Canceled,
    Panicked,
}

struct Worker {
    id: usize,
    settings: WorkerSettings,
    submitter: Arc<dyn CrankSubmitter>,
    requests: SharedRequests,
    responses: mpsc::UnboundedSender<CrankResponse>,
    fatal: mpsc::Sender<WorkerError>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) {
        let mut backoff = ExponentialBackoff::new(
            self.settings.backoff_initial,
            self.settings.backoff_max,
            self.settings.max_retries,
        );

        loop {
            let request = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = async { self.requests.lock().await.recv().await } => match next {
                    Some(request) => request,
                    None => break,
                },
            };

            backoff.reset();
            let (attempts, result) = match self.execute(&request, &mut backoff).await {
                Outcome::Done { attempts, result } => (attempts, result),
                Outcome::Canceled => break,
                Outcome::Panicked => {
                    let fatal = WorkerError::SubmitterPanicked {
                        worker: self.id,
                        pipeline: request.pipeline,
                    };
                    log::error!("❌ {}", fatal);
                    let _ = self.fatal.try_send(fatal);
                    break;
                }
            };

            let response = CrankResponse {
                request,
                worker: self.id,
                attempts,
                result,
            };
            if self.responses.send(response).is_err() {
                // Decision core is gone
                break;
            }
        }

        log::debug!("Worker {} stopped", self.id);
    }

    /// Submit `request`, retrying it until it succeeds or the backoff runs out
    async fn execute(
        &self,
        request: &CrankRequest,
        backoff: &mut ExponentialBackoff,
    ) -> Outcome {
        let params = request.params(self.settings.payer);

        loop {
            log::debug!(
                "🔧 Worker {} cranking {} period_start={} (attempt {})",
                self.id,
                request.pipeline,
                request.period.period.start,
                backoff.attempts() + 1
            );

            let err = match self.submit(params).await {
                Attempt::Submitted(signature) => {
                    return Outcome::Done {
                        attempts: backoff.attempts() + 1,
                        result: Ok(signature),
                    }
                }
                Attempt::Failed(e) => e,
                Attempt::Panicked => return Outcome::Panicked,
                Attempt::Canceled => return Outcome::Canceled,
            };

            let delay = match backoff.next_delay() {
                Ok(delay) => delay,
                Err(exceeded) => {
                    return Outcome::Done {
                        attempts: exceeded.attempts + 1,
                        result: Err(err),
                    }
                }
            };
            log::debug!(
                "Crank of {} failed ({}), retrying in {:?}",
                request.pipeline,
                err,
                delay
            );

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Outcome::Canceled,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One submission, on its own task so a panicking submitter is contained
    async fn submit(&self, params: CrankParams) -> Attempt {
        let submitter = self.submitter.clone();
        let mut task = tokio::spawn(async move { submitter.crank(&params).await });

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                task.abort();
                Attempt::Canceled
            }
            joined = &mut task => match joined {
                Ok(Ok(signature)) => Attempt::Submitted(signature),
                Ok(Err(e)) => Attempt::Failed(e),
                Err(e) => {
                    log::error!("❌ Submitter '{}' panicked: {}", self.submitter.name(), e);
                    Attempt::Panicked
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::Period;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(n: u8) -> Pubkey {
        Pubkey::new_from_array([n; 32])
    }

    fn request(start: u64) -> CrankRequest {
        CrankRequest {
            pipeline: key(1),
            data: PipelineData {
                controller: key(2),
                vault: key(3),
                fee_vault: key(4),
            },
            period: PeriodWithPayout {
                period: Period::new(start, 100),
                payout: key(5),
            },
            slot: 250,
        }
    }

    fn settings(max_retries: u32) -> WorkerSettings {
        WorkerSettings {
            payer: key(6),
            backoff_initial: Duration::from_millis(1),
            backoff_max: Duration::from_millis(5),
            max_retries,
        }
    }

    /// Fails the first `fail_first` submissions, then succeeds
    struct FlakySubmitter {
        calls: AtomicUsize,
        fail_first: usize,
    }

    impl FlakySubmitter {
        fn new(fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail_first,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CrankSubmitter for FlakySubmitter {
        async fn crank(&self, _params: &CrankParams) -> Result<Signature, SubmitError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.fail_first {
                return Err(SubmitError::Network("connection refused".to_string()));
            }
            Ok(Signature::default())
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    struct StuckSubmitter;

    #[async_trait]
    impl CrankSubmitter for StuckSubmitter {
        async fn crank(&self, _params: &CrankParams) -> Result<Signature, SubmitError> {
            std::future::pending().await
        }

        fn name(&self) -> &'static str {
            "stuck"
        }
    }

    struct PanickingSubmitter;

    #[async_trait]
    impl CrankSubmitter for PanickingSubmitter {
        async fn crank(&self, _params: &CrankParams) -> Result<Signature, SubmitError> {
            panic!("keypair file unreadable")
        }

        fn name(&self) -> &'static str {
            "panicking"
        }
    }

    struct Harness {
        requests: mpsc::Sender<CrankRequest>,
        responses: mpsc::UnboundedReceiver<CrankResponse>,
        fatal: mpsc::Receiver<WorkerError>,
        cancel: CancellationToken,
        pool: WorkerPool,
    }

    fn spawn_pool(count: usize, max_retries: u32, submitter: Arc<dyn CrankSubmitter>) -> Harness {
        let (req_tx, req_rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        let (resp_tx, resp_rx) = mpsc::unbounded_channel();
        let (fatal_tx, fatal_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let pool = WorkerPool::spawn(
            count,
            settings(max_retries),
            submitter,
            req_rx,
            resp_tx,
            fatal_tx,
            cancel.clone(),
        );
        Harness {
            requests: req_tx,
            responses: resp_rx,
            fatal: fatal_rx,
            cancel,
            pool,
        }
    }

    #[test]
    fn test_params_use_request_accounts() {
        let params = request(100).params(key(6));
        assert_eq!(params.payer, key(6));
        assert_eq!(params.vault, key(3));
        assert_eq!(params.fee_vault, key(4));
        assert_eq!(params.period.period.start, 100);
    }

    #[tokio::test]
    async fn test_one_response_per_request() {
        let submitter = Arc::new(crate::submit::DryRunSubmitter::new());
        let mut h = spawn_pool(2, 3, submitter.clone());

        for start in [100, 200, 300] {
            h.requests.send(request(start)).await.unwrap();
        }

        let mut starts = Vec::new();
        for _ in 0..3 {
            let response = h.responses.recv().await.unwrap();
            assert!(response.result.is_ok());
            assert_eq!(response.attempts, 1);
            starts.push(response.request.period.period.start);
        }
        starts.sort();
        assert_eq!(starts, vec![100, 200, 300]);
        assert_eq!(submitter.sent(), 3);

        h.cancel.cancel();
        h.pool.join().await;
    }

    #[tokio::test]
    async fn test_failed_submission_is_retried_within_the_request() {
        let submitter = FlakySubmitter::new(2);
        let mut h = spawn_pool(1, 3, submitter.clone());

        h.requests.send(request(100)).await.unwrap();

        let response = h.responses.recv().await.unwrap();
        assert!(response.result.is_ok());
        assert_eq!(response.attempts, 3);
        assert_eq!(submitter.calls(), 3);

        h.cancel.cancel();
        h.pool.join().await;
    }

    #[tokio::test]
    async fn test_spent_retry_budget_answers_and_keeps_working() {
        let submitter = FlakySubmitter::new(usize::MAX);
        let mut h = spawn_pool(1, 1, submitter.clone());

        for start in [100, 200, 300] {
            h.requests.send(request(start)).await.unwrap();
            let response = h.responses.recv().await.unwrap();
            assert_eq!(response.request.period.period.start, start);
            assert_eq!(response.attempts, 2);
            assert_eq!(
                response.result,
                Err(SubmitError::Network("connection refused".to_string()))
            );
        }

        // Each request had its own budget and nothing was fatal
        assert_eq!(submitter.calls(), 6);
        assert!(h.fatal.try_recv().is_err());

        h.cancel.cancel();
        h.pool.join().await;
    }

    #[tokio::test]
    async fn test_panicking_submitter_is_fatal() {
        let mut h = spawn_pool(1, 3, Arc::new(PanickingSubmitter));

        h.requests.send(request(100)).await.unwrap();

        let fatal = tokio::time::timeout(Duration::from_secs(1), h.fatal.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            fatal,
            WorkerError::SubmitterPanicked {
                worker: 0,
                pipeline: key(1)
            }
        );

        // Worker exited on its own without answering
        h.pool.join().await;
        assert!(h.responses.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_cancellation_suppresses_response() {
        let mut h = spawn_pool(1, 3, Arc::new(StuckSubmitter));

        h.requests.send(request(100)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), h.pool.join())
            .await
            .expect("workers stop on cancellation");
        assert!(h.responses.recv().await.is_none());
    }
}
