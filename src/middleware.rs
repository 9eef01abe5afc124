//! Tower middleware running the caller protocol of [`Herd`] around a service.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tower_layer::Layer;
use tower_service::Service;
use tracing::warn;

use crate::detector::Detector;
use crate::error::HerdError;
use crate::herd::Herd;
use crate::storage::Storage;
use crate::{Fingerprint, Fingerprinter, Status};

/// Why a request was not served.
#[derive(Debug)]
pub enum AdmissionError<E> {
    /// Another request with the same fingerprint is doing the work.
    Wait(Fingerprint),
    /// Evaluating the request failed (fail-closed mode).
    Failed(HerdError),
    /// The inner service failed.
    Inner(E),
}

impl<E> AdmissionError<E> {
    pub fn is_wait(&self) -> bool {
        matches!(self, Self::Wait(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Status reported to the caller for this rejection.
    pub fn status(&self) -> Option<Status> {
        match self {
            Self::Wait(_) => Some(Status::Wait),
            Self::Failed(_) => Some(Status::Failed),
            Self::Inner(_) => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for AdmissionError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wait(fp) => write!(f, "thundering herd in progress for '{}', retry later", fp),
            Self::Failed(e) => write!(f, "herd evaluation failed: {}", e),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for AdmissionError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Wait(_) => None,
            Self::Failed(e) => Some(e),
            Self::Inner(e) => Some(e),
        }
    }
}

/// A layer that guards a service with a [`Herd`].
pub struct HerdLayer<D, S> {
    herd: Arc<Herd<D, S>>,
    fail_open: bool,
}

impl<D, S> HerdLayer<D, S> {
    /// Create a layer; evaluation errors reject the request unless [`HerdLayer::fail_open`] is set.
    pub fn new(herd: Arc<Herd<D, S>>) -> Self {
        Self { herd, fail_open: false }
    }

    /// Serve requests whose evaluation failed instead of rejecting them.
    pub fn fail_open(mut self) -> Self {
        self.fail_open = true;
        self
    }
}

impl<D, S> Clone for HerdLayer<D, S> {
    fn clone(&self) -> Self {
        Self { herd: self.herd.clone(), fail_open: self.fail_open }
    }
}

impl<Svc, D, S> Layer<Svc> for HerdLayer<D, S> {
    type Service = HerdService<Svc, D, S>;

    fn layer(&self, service: Svc) -> Self::Service {
        HerdService { inner: service, herd: self.herd.clone(), fail_open: self.fail_open }
    }
}

/// Middleware service that admits requests according to their herd status.
pub struct HerdService<Svc, D, S> {
    inner: Svc,
    herd: Arc<Herd<D, S>>,
    fail_open: bool,
}

impl<Svc: Clone, D, S> Clone for HerdService<Svc, D, S> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), herd: self.herd.clone(), fail_open: self.fail_open }
    }
}

impl<Svc, D, S, Req> Service<Req> for HerdService<Svc, D, S>
where
    Svc: Service<Req> + Clone + Send + 'static,
    Svc::Future: Send + 'static,
    Svc::Response: Send + 'static,
    Svc::Error: Send + 'static,
    D: Detector + 'static,
    S: Storage + 'static,
    Req: Fingerprinter + Send + 'static,
{
    type Response = Svc::Response;
    type Error = AdmissionError<Svc::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(AdmissionError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let herd = self.herd.clone();
        let fail_open = self.fail_open;
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let fingerprint = req.fingerprint();

        Box::pin(async move {
            match herd.evaluate_fingerprint(&fingerprint).await {
                Ok(Status::Process) => {
                    // Releases the record if this future is dropped before the winner finishes.
                    let claim = ClaimGuard::new(herd.clone(), fingerprint.clone());
                    match inner.call(req).await {
                        Ok(response) => {
                            match herd.request_done_fingerprint(&fingerprint).await {
                                Ok(()) => claim.disarm(),
                                Err(e) => {
                                    warn!(target: "herdgate::middleware", error = %e, "failed to mark request as done, releasing record");
                                }
                            }
                            Ok(response)
                        }
                        Err(e) => {
                            claim.release().await;
                            Err(AdmissionError::Inner(e))
                        }
                    }
                }
                Ok(Status::Wait) => Err(AdmissionError::Wait(fingerprint)),
                Ok(_) => inner.call(req).await.map_err(AdmissionError::Inner),
                Err(e) if fail_open => {
                    warn!(target: "herdgate::middleware", error = %e, "herd evaluation failed, serving anyway");
                    inner.call(req).await.map_err(AdmissionError::Inner)
                }
                Err(e) => Err(AdmissionError::Failed(e)),
            }
        })
    }
}

/// Owns the winner's claim until `request_done` or `cleanup` has gone through.
///
/// Dropped while still armed, it spawns `cleanup` on the current Tokio runtime so
/// the record does not stay in flight forever.
struct ClaimGuard<D, S>
where
    D: Detector + 'static,
    S: Storage + 'static,
{
    herd: Option<Arc<Herd<D, S>>>,
    fingerprint: Fingerprint,
}

impl<D, S> ClaimGuard<D, S>
where
    D: Detector + 'static,
    S: Storage + 'static,
{
    fn new(herd: Arc<Herd<D, S>>, fingerprint: Fingerprint) -> Self {
        Self { herd: Some(herd), fingerprint }
    }

    fn disarm(mut self) {
        self.herd = None;
    }

    /// Run `cleanup` inline; stays armed if it fails, so drop retries once in the background.
    async fn release(mut self) {
        let Some(herd) = self.herd.clone() else { return };
        match herd.cleanup_fingerprint(&self.fingerprint).await {
            Ok(()) => self.herd = None,
            Err(e) => {
                warn!(target: "herdgate::middleware", error = %e, "failed to remove fingerprint");
            }
        }
    }
}

impl<D, S> Drop for ClaimGuard<D, S>
where
    D: Detector + 'static,
    S: Storage + 'static,
{
    fn drop(&mut self) {
        let Some(herd) = self.herd.take() else { return };
        let fingerprint = self.fingerprint.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = herd.cleanup_fingerprint(&fingerprint).await {
                        warn!(target: "herdgate::middleware", error = %e, "failed to release abandoned claim");
                    }
                });
            }
            Err(_) => {
                warn!(target: "herdgate::middleware", fingerprint = %fingerprint, "no runtime to release abandoned claim");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;
    use crate::storage::InMemoryStorage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::{service_fn, ServiceExt};

    struct AlwaysHerd;

    #[async_trait]
    impl Detector for AlwaysHerd {
        async fn cool_down(&self, _: &Fingerprint) -> Result<(), BackendError> {
            Ok(())
        }
        async fn is_cool_down(&self, _: &Fingerprint) -> Result<bool, BackendError> {
            Ok(false)
        }
        async fn is_thundering_herd(&self, _: &Fingerprint) -> Result<bool, BackendError> {
            Ok(true)
        }
    }

    struct Unreachable;

    #[async_trait]
    impl Detector for Unreachable {
        async fn cool_down(&self, _: &Fingerprint) -> Result<(), BackendError> {
            Err("unreachable".into())
        }
        async fn is_cool_down(&self, _: &Fingerprint) -> Result<bool, BackendError> {
            Err("unreachable".into())
        }
        async fn is_thundering_herd(&self, _: &Fingerprint) -> Result<bool, BackendError> {
            Err("unreachable".into())
        }
    }

    #[derive(Debug)]
    struct Req(&'static str);

    impl Fingerprinter for Req {
        fn fingerprint(&self) -> Fingerprint {
            Fingerprint::from(self.0)
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(&'static str);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    #[tokio::test]
    async fn winner_is_served_and_marks_done() {
        let storage = InMemoryStorage::new();
        let herd = Arc::new(Herd::new(AlwaysHerd, storage.clone()));
        let svc = HerdLayer::new(herd.clone())
            .layer(service_fn(|req: Req| async move { Ok::<_, TestError>(req.0.len()) }));

        assert_eq!(svc.clone().oneshot(Req("abc")).await.unwrap(), 3);
        assert!(storage.processed(&Fingerprint::from("abc")).await.unwrap());
        // processed record: later requests pass through
        assert_eq!(svc.oneshot(Req("abc")).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn others_are_told_to_wait_while_in_flight() {
        let storage = InMemoryStorage::new();
        storage.store(&Fingerprint::from("abc"), false).await.unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let svc = HerdLayer::new(Arc::new(Herd::new(AlwaysHerd, storage))).layer(service_fn(
            move |_req: Req| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, TestError>(())
                }
            },
        ));

        let err = svc.oneshot(Req("abc")).await.unwrap_err();
        assert!(err.is_wait());
        assert_eq!(err.status(), Some(Status::Wait));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_winner_cleans_up() {
        let storage = InMemoryStorage::new();
        let svc = HerdLayer::new(Arc::new(Herd::new(AlwaysHerd, storage.clone())))
            .layer(service_fn(|_req: Req| async move { Err::<(), _>(TestError("backend down")) }));

        let err = svc.oneshot(Req("abc")).await.unwrap_err();
        assert_eq!(err.into_inner(), Some(TestError("backend down")));
        assert!(!storage.exists(&Fingerprint::from("abc")).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_winner_releases_the_record() {
        let storage = InMemoryStorage::new();
        let herd = Arc::new(Herd::new(AlwaysHerd, storage.clone()));
        let svc = HerdLayer::new(herd.clone()).layer(service_fn(|_req: Req| async move {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            Ok::<_, TestError>(())
        }));

        // the caller gives up while the winner is still working
        let abandoned = tokio::time::timeout(std::time::Duration::from_millis(50), svc.oneshot(Req("abc"))).await;
        assert!(abandoned.is_err());

        // let the background release run
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!storage.exists(&Fingerprint::from("abc")).await.unwrap());
        assert_eq!(herd.evaluate(&Fingerprint::from("abc")).await.unwrap(), Status::Process);
    }

    #[tokio::test]
    async fn evaluation_errors_fail_closed_by_default() {
        let herd = Arc::new(Herd::new(Unreachable, InMemoryStorage::new()));
        let inner = service_fn(|_req: Req| async move { Ok::<_, TestError>("served") });

        let closed = HerdLayer::new(herd.clone()).layer(inner);
        let err = closed.oneshot(Req("x")).await.unwrap_err();
        assert!(err.is_failed());
        assert!(err.to_string().contains("unreachable"));

        let open = HerdLayer::new(herd).fail_open().layer(inner);
        assert_eq!(open.oneshot(Req("x")).await.unwrap(), "served");
    }
}
