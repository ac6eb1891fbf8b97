//! The companion link: a bounded bind/retry state machine over the
//! platform IPC seams.

use crate::ipc::{BindingEvents, CompanionBinder, CompanionService, RemoteError, StateCallback};
use crate::state::{ServiceState, StateReport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use veil_bus::{StateBus, StateStream};
use veil_trust::TrustVerifier;

/// Delay between bind attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Consecutive failed bind attempts tolerated before the link gives up.
const MAX_BIND_ATTEMPTS: u32 = 3;

struct LinkShared {
    service: Option<Arc<dyn CompanionService>>,
    callback: Option<Arc<dyn StateCallback>>,
    bound: bool,
    failed_attempts: u32,
    retry_task: Option<JoinHandle<()>>,
}

struct LinkInner {
    binder: Arc<dyn CompanionBinder>,
    verifier: TrustVerifier,
    package_id: String,
    stopped: AtomicBool,
    shared: Mutex<LinkShared>,
    // Serializes the connect sequence; the shared lock stays fine-grained so
    // platform callbacks delivered mid-sequence cannot deadlock.
    bind_gate: Mutex<()>,
    bus: StateBus<ServiceState>,
    runtime: Handle,
}

/// Manages the binding to the companion state service.
///
/// Subscribing to [`state_stream`](CompanionLink::state_stream) cold-starts
/// the connect sequence; dropping the last stream stops the link and
/// releases the binding. Must be created within a tokio runtime, which the
/// link uses for its retry timer.
pub struct CompanionLink {
    inner: Arc<LinkInner>,
}

impl CompanionLink {
    pub fn new(
        binder: Arc<dyn CompanionBinder>,
        verifier: TrustVerifier,
        package_id: impl Into<String>,
    ) -> Self {
        let inner = Arc::new(LinkInner {
            binder,
            verifier,
            package_id: package_id.into(),
            stopped: AtomicBool::new(false),
            shared: Mutex::new(LinkShared {
                service: None,
                callback: None,
                bound: false,
                failed_attempts: 0,
                retry_task: None,
            }),
            bind_gate: Mutex::new(()),
            bus: StateBus::with_initial(ServiceState::Idle),
            runtime: Handle::current(),
        });

        // Stop when the last subscriber cancels; this is the link's only
        // cancellation-triggered cleanup path.
        let weak = Arc::downgrade(&inner);
        inner.bus.set_on_idle(move || {
            if let Some(link) = weak.upgrade() {
                debug!("companion link: no subscribers left, stopping");
                link.stop();
            }
        });

        Self { inner }
    }

    /// Subscribe to the link's state stream.
    ///
    /// The first subscription triggers the connect sequence if the link is
    /// not already bound and not stopped. The stream ends after a terminal
    /// state; a stream obtained after `stop()` yields the last state and
    /// ends immediately.
    pub fn state_stream(&self) -> StateStream<ServiceState> {
        let stream = self.inner.bus.subscribe();
        if !self.inner.stopped.load(Ordering::SeqCst) {
            self.inner.check_and_bind();
        }
        stream
    }

    /// Stop the link: cancel any pending retry, unregister the callback and
    /// release the binding (both best-effort), and end the state stream.
    /// Idempotent.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Whether the link has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }
}

impl LinkInner {
    /// Run the pre-bind checks and request a bind. Invoked on fresh
    /// subscription and from the retry timer.
    fn check_and_bind(self: &Arc<Self>) {
        let _gate = self.bind_gate.lock().unwrap();
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        // A terminal state ended the stream; no transitions happen after it
        // until a fresh link is created.
        if self.bus.is_completed() {
            return;
        }
        if self.shared.lock().unwrap().bound {
            return;
        }

        if !self.verifier.is_installed(&self.package_id) {
            warn!("companion link: package {} not installed", self.package_id);
            self.finish(ServiceState::NotInstalled);
            return;
        }

        if !self.verifier.verify_signature(&self.package_id) {
            warn!(
                "companion link: package {} failed trust verification",
                self.package_id
            );
            self.finish(ServiceState::TrustFailed(format!(
                "package {} failed signature verification",
                self.package_id
            )));
            return;
        }

        if !self.binder.endpoint_available() {
            warn!(
                "companion link: state service endpoint not advertised by {}",
                self.package_id
            );
            self.finish(ServiceState::UpgradeRequired);
            return;
        }

        self.bus.publish(ServiceState::Connecting);

        let events: Arc<dyn BindingEvents> = Arc::new(LinkEvents {
            link: Arc::downgrade(self),
        });
        if let Err(e) = self.binder.request_bind(events) {
            warn!("companion link: bind request failed: {e}");
            self.schedule_reconnect();
        }
    }

    /// Bind completed: store the service handle and register our callback.
    fn on_connected(self: &Arc<Self>, service: Arc<dyn CompanionService>) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        info!("companion link: connected to companion state service");

        let callback: Arc<dyn StateCallback> = Arc::new(LinkCallback {
            link: Arc::downgrade(self),
        });
        {
            let mut shared = self.shared.lock().unwrap();
            shared.service = Some(Arc::clone(&service));
            shared.callback = Some(Arc::clone(&callback));
            shared.bound = true;
            // Only a successful connection resets the attempt counter.
            shared.failed_attempts = 0;
        }
        self.bus.publish(ServiceState::Connected);

        if let Err(e) = service.register_client(callback) {
            // The bind itself succeeded, so this stays on the retry path.
            warn!("companion link: failed to register client: {e}");
            self.release_binding();
            self.schedule_reconnect();
        }
    }

    /// The companion process died without an explicit stop; treated the
    /// same as a retryable binding failure.
    fn on_disconnected(self: &Arc<Self>) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        warn!("companion link: disconnected from companion state service");
        {
            let mut shared = self.shared.lock().unwrap();
            shared.service = None;
            shared.callback = None;
            shared.bound = false;
        }
        self.bus.publish(ServiceState::Disconnected);
        self.schedule_reconnect();
    }

    /// Count the failed attempt and either give up or arm the retry timer.
    fn schedule_reconnect(self: &Arc<Self>) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let mut shared = self.shared.lock().unwrap();
        shared.failed_attempts += 1;
        let failed = shared.failed_attempts;
        if failed >= MAX_BIND_ATTEMPTS {
            drop(shared);
            warn!("companion link: {MAX_BIND_ATTEMPTS} bind attempts failed, giving up");
            self.finish(ServiceState::RetriesExhausted);
            return;
        }

        info!("companion link: scheduling bind attempt {} of {MAX_BIND_ATTEMPTS}", failed + 1);
        if let Some(task) = shared.retry_task.take() {
            task.abort();
        }
        let link = Arc::clone(self);
        shared.retry_task = Some(self.runtime.spawn(async move {
            tokio::time::sleep(RECONNECT_DELAY).await;
            link.check_and_bind();
        }));
    }

    /// Drop the service handle and release the platform binding.
    fn release_binding(&self) {
        let was_bound = {
            let mut shared = self.shared.lock().unwrap();
            shared.service = None;
            shared.callback = None;
            std::mem::take(&mut shared.bound)
        };
        if was_bound {
            if let Err(e) = self.binder.unbind() {
                warn!("companion link: error releasing binding: {e}");
            }
        }
    }

    /// Emit a terminal state and end the stream. No further transitions
    /// until the link is explicitly recreated.
    fn finish(&self, state: ServiceState) {
        {
            let mut shared = self.shared.lock().unwrap();
            shared.failed_attempts = MAX_BIND_ATTEMPTS;
            if let Some(task) = shared.retry_task.take() {
                task.abort();
            }
        }
        self.bus.publish(state);
        self.bus.complete();
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("companion link: stopping");

        let (service, callback, was_bound, retry_task) = {
            let mut shared = self.shared.lock().unwrap();
            (
                shared.service.take(),
                shared.callback.take(),
                std::mem::take(&mut shared.bound),
                shared.retry_task.take(),
            )
        };

        if let Some(task) = retry_task {
            task.abort();
        }

        if let (Some(service), Some(callback)) = (service, callback) {
            match service.unregister_client(callback) {
                Ok(()) | Err(RemoteError::DeadObject) => {}
                Err(e) => error!("companion link: failed to unregister client: {e}"),
            }
        }

        if was_bound {
            if let Err(e) = self.binder.unbind() {
                warn!("companion link: error releasing binding: {e}");
            }
        }

        self.bus.complete();
    }
}

struct LinkEvents {
    link: Weak<LinkInner>,
}

impl BindingEvents for LinkEvents {
    fn on_connected(&self, service: Arc<dyn CompanionService>) {
        if let Some(link) = self.link.upgrade() {
            link.on_connected(service);
        }
    }

    fn on_disconnected(&self) {
        if let Some(link) = self.link.upgrade() {
            link.on_disconnected();
        }
    }
}

struct LinkCallback {
    link: Weak<LinkInner>,
}

impl StateCallback for LinkCallback {
    fn on_state_update(&self, payload: &str) {
        let Some(link) = self.link.upgrade() else {
            return;
        };
        match StateReport::parse(payload) {
            Ok(report) => link.bus.publish(ServiceState::Report(report)),
            Err(e) => {
                error!("companion link: failed to parse state payload: {e}");
                link.bus.publish(ServiceState::DataError(e.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{BindRequestError, UnbindError};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use veil_trust::{PackageRegistry, TrustedPackages, format_certificate_digest};

    const TEST_PACKAGE: &str = "org.example.relay";
    const TEST_CERT: &[u8] = b"relay-release-cert";

    struct MockRegistry {
        certificates: HashMap<String, Vec<u8>>,
    }

    impl PackageRegistry for MockRegistry {
        fn is_installed(&self, package_id: &str) -> bool {
            self.certificates.contains_key(package_id)
        }

        fn signing_certificate(&self, package_id: &str) -> Option<Vec<u8>> {
            self.certificates.get(package_id).cloned()
        }
    }

    fn verifier(installed: bool, trusted_cert: &[u8]) -> TrustVerifier {
        let mut certificates = HashMap::new();
        if installed {
            certificates.insert(TEST_PACKAGE.to_string(), TEST_CERT.to_vec());
        }
        let mut builtin = veil_trust::SignatureMap::new();
        builtin.insert(
            TEST_PACKAGE.to_string(),
            std::collections::BTreeSet::from([format_certificate_digest(trusted_cert)]),
        );
        TrustVerifier::new(
            Arc::new(MockRegistry { certificates }),
            Arc::new(TrustedPackages::with_entries(builtin)),
        )
    }

    #[derive(Default)]
    struct MockService {
        registered: Mutex<Option<Arc<dyn StateCallback>>>,
        register_failures: AtomicUsize,
        unregistered: AtomicUsize,
    }

    impl MockService {
        fn push(&self, payload: &str) {
            let callback = self.registered.lock().unwrap().clone();
            if let Some(callback) = callback {
                callback.on_state_update(payload);
            }
        }
    }

    impl CompanionService for MockService {
        fn register_client(&self, client: Arc<dyn StateCallback>) -> Result<(), RemoteError> {
            if self.register_failures.load(Ordering::SeqCst) > 0 {
                self.register_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(RemoteError::Failed("simulated register failure".into()));
            }
            *self.registered.lock().unwrap() = Some(client);
            Ok(())
        }

        fn unregister_client(&self, _client: Arc<dyn StateCallback>) -> Result<(), RemoteError> {
            self.unregistered.fetch_add(1, Ordering::SeqCst);
            *self.registered.lock().unwrap() = None;
            Ok(())
        }
    }

    struct MockBinder {
        endpoint: bool,
        auto_connect: bool,
        attempts: AtomicUsize,
        unbinds: AtomicUsize,
        events: Mutex<Option<Arc<dyn BindingEvents>>>,
        service: Arc<MockService>,
    }

    impl MockBinder {
        fn rejecting() -> Self {
            Self {
                endpoint: true,
                auto_connect: false,
                attempts: AtomicUsize::new(0),
                unbinds: AtomicUsize::new(0),
                events: Mutex::new(None),
                service: Arc::new(MockService::default()),
            }
        }

        fn connecting() -> Self {
            Self {
                auto_connect: true,
                ..Self::rejecting()
            }
        }

        fn bind_attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }

        fn disconnect(&self) {
            let events = self.events.lock().unwrap().clone();
            events.expect("no bind in flight").on_disconnected();
        }
    }

    impl CompanionBinder for MockBinder {
        fn endpoint_available(&self) -> bool {
            self.endpoint
        }

        fn request_bind(&self, events: Arc<dyn BindingEvents>) -> Result<(), BindRequestError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            *self.events.lock().unwrap() = Some(Arc::clone(&events));
            if self.auto_connect {
                events.on_connected(Arc::clone(&self.service) as Arc<dyn CompanionService>);
                Ok(())
            } else {
                Err(BindRequestError::Rejected)
            }
        }

        fn unbind(&self) -> Result<(), UnbindError> {
            self.unbinds.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn link_with(binder: &Arc<MockBinder>, verifier: TrustVerifier) -> CompanionLink {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("veil_companion=trace")
            .try_init();
        CompanionLink::new(
            Arc::clone(binder) as Arc<dyn CompanionBinder>,
            verifier,
            TEST_PACKAGE,
        )
    }

    async fn collect_until_end(stream: &mut StateStream<ServiceState>) -> Vec<ServiceState> {
        let mut states = Vec::new();
        while let Some(state) = stream.next().await {
            states.push(state);
        }
        states
    }

    #[tokio::test]
    async fn test_not_installed_is_terminal() {
        let binder = Arc::new(MockBinder::connecting());
        let link = link_with(&binder, verifier(false, TEST_CERT));

        let mut stream = link.state_stream();
        let states = collect_until_end(&mut stream).await;

        assert_eq!(
            states,
            vec![ServiceState::Idle, ServiceState::NotInstalled]
        );
        assert_eq!(binder.bind_attempts(), 0);
    }

    #[tokio::test]
    async fn test_trust_failure_short_circuits_bind() {
        let binder = Arc::new(MockBinder::connecting());
        let link = link_with(&binder, verifier(true, b"some-other-cert"));

        let mut stream = link.state_stream();
        let states = collect_until_end(&mut stream).await;

        assert!(matches!(states.last(), Some(ServiceState::TrustFailed(_))));
        assert_eq!(binder.bind_attempts(), 0, "bind must never be attempted");
    }

    #[tokio::test]
    async fn test_missing_endpoint_means_upgrade_required() {
        let binder = Arc::new(MockBinder {
            endpoint: false,
            ..MockBinder::connecting()
        });
        let link = link_with(&binder, verifier(true, TEST_CERT));

        let mut stream = link.state_stream();
        let states = collect_until_end(&mut stream).await;

        assert_eq!(states.last(), Some(&ServiceState::UpgradeRequired));
        assert_eq!(binder.bind_attempts(), 0);
    }

    #[tokio::test]
    async fn test_retry_bound_exhausts_after_three_failures() {
        let binder = Arc::new(MockBinder::rejecting());
        let link = link_with(&binder, verifier(true, TEST_CERT));

        let mut stream = link.state_stream();
        let states = collect_until_end(&mut stream).await;

        let exhausted = states
            .iter()
            .filter(|s| **s == ServiceState::RetriesExhausted)
            .count();
        assert_eq!(exhausted, 1);
        assert_eq!(binder.bind_attempts(), 3, "no fourth bind attempt");
    }

    #[tokio::test]
    async fn test_connects_and_reports_state() {
        let binder = Arc::new(MockBinder::connecting());
        let link = link_with(&binder, verifier(true, TEST_CERT));

        let mut stream = link.state_stream();
        assert_eq!(stream.next().await, Some(ServiceState::Idle));
        assert_eq!(stream.next().await, Some(ServiceState::Connecting));
        assert_eq!(stream.next().await, Some(ServiceState::Connected));

        binder
            .service
            .push(r#"{"schema":1,"data":{"appVersion":42,"running":true}}"#);
        assert_eq!(
            stream.next().await,
            Some(ServiceState::Report(StateReport {
                app_version: 42,
                running: Some(true),
            }))
        );
    }

    #[tokio::test]
    async fn test_malformed_payload_does_not_terminate_link() {
        let binder = Arc::new(MockBinder::connecting());
        let link = link_with(&binder, verifier(true, TEST_CERT));

        let mut stream = link.state_stream();
        for _ in 0..3 {
            stream.next().await; // Idle, Connecting, Connected
        }

        binder.service.push(r#"{"schema":99,"data":{}}"#);
        assert!(matches!(
            stream.next().await,
            Some(ServiceState::DataError(_))
        ));

        // The binding is still healthy and keeps delivering.
        binder
            .service
            .push(r#"{"schema":1,"data":{"appVersion":7}}"#);
        assert_eq!(
            stream.next().await,
            Some(ServiceState::Report(StateReport {
                app_version: 7,
                running: None,
            }))
        );
        assert!(!link.is_stopped());
    }

    #[tokio::test]
    async fn test_stream_survives_reconnect_cycle() {
        let binder = Arc::new(MockBinder::connecting());
        let link = link_with(&binder, verifier(true, TEST_CERT));

        let mut stream = link.state_stream();
        for _ in 0..3 {
            stream.next().await; // Idle, Connecting, Connected
        }

        binder.disconnect();
        assert_eq!(stream.next().await, Some(ServiceState::Disconnected));
        assert_eq!(stream.next().await, Some(ServiceState::Connecting));
        assert_eq!(stream.next().await, Some(ServiceState::Connected));
        assert_eq!(binder.bind_attempts(), 2);

        // The counter reset on reconnect, so a later disconnection still
        // gets its full retry budget rather than completing the stream.
        binder.disconnect();
        assert_eq!(stream.next().await, Some(ServiceState::Disconnected));
        assert_eq!(stream.next().await, Some(ServiceState::Connecting));
        assert_eq!(stream.next().await, Some(ServiceState::Connected));
        assert!(!link.is_stopped());
    }

    #[tokio::test]
    async fn test_register_failure_reenters_retry_path() {
        let binder = Arc::new(MockBinder::connecting());
        binder.service.register_failures.store(1, Ordering::SeqCst);
        let link = link_with(&binder, verifier(true, TEST_CERT));

        let mut stream = link.state_stream();
        for _ in 0..3 {
            stream.next().await; // Idle, Connecting, Connected
        }

        // First registration failed; the retry binds and registers again.
        assert_eq!(stream.next().await, Some(ServiceState::Connecting));
        assert_eq!(stream.next().await, Some(ServiceState::Connected));
        assert_eq!(binder.bind_attempts(), 2);
        assert!(binder.service.registered.lock().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let binder = Arc::new(MockBinder::connecting());
        let link = link_with(&binder, verifier(true, TEST_CERT));

        let mut stream = link.state_stream();
        for _ in 0..3 {
            stream.next().await;
        }

        link.stop();
        link.stop();

        assert!(link.is_stopped());
        assert_eq!(binder.service.unregistered.load(Ordering::SeqCst), 1);
        assert_eq!(binder.unbinds.load(Ordering::SeqCst), 1);
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_last_unsubscribe_stops_link() {
        let binder = Arc::new(MockBinder::connecting());
        let link = link_with(&binder, verifier(true, TEST_CERT));

        let stream = link.state_stream();
        assert!(!link.is_stopped());

        drop(stream);
        assert!(link.is_stopped());
        assert_eq!(binder.unbinds.load(Ordering::SeqCst), 1);
    }
}
