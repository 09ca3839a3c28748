//! Start/stop state machine behind the scanner button.
//!
//! The controller owns the active scanner handle and every in-flight scan
//! submission. Browser specifics sit behind [`CameraBackend`], [`Transport`]
//! and [`Surface`], and async work goes through a [`LocalSpawn`] executor, so
//! the same code runs under `wasm_bindgen_futures` and a `LocalPool`.

use std::{cell::RefCell, rc::Rc};

use futures::{
    channel::mpsc,
    future::{AbortHandle, Abortable, Aborted, LocalBoxFuture},
    task::{LocalSpawn, LocalSpawnExt},
    Future, StreamExt,
};

use crate::{
    config::{ScannerConfig, ScannerOptions},
    submit::{FormPost, Outcome, Response},
    ScanError,
};

pub type LocalResult<T> = LocalBoxFuture<'static, Result<T, ScanError>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Camera {
    pub id: String,
    pub label: String,
}

pub trait CameraBackend {
    type Scanner: Scanner;

    fn cameras(&self) -> LocalResult<Vec<Camera>>;

    /// Constructs a scanner bound to the video surface. Nothing is captured
    /// until [`Scanner::start`].
    fn scanner(&self, options: &ScannerOptions) -> Self::Scanner;
}

pub trait Scanner {
    /// Starts capture on `camera`. Decoded texts arrive on the receiver until
    /// [`Scanner::stop`] is called.
    fn start(&self, camera: &Camera) -> LocalResult<mpsc::UnboundedReceiver<String>>;

    fn stop(&self);
}

pub trait Transport {
    fn post(&self, post: FormPost) -> LocalResult<Response>;
}

pub trait Surface {
    /// Blocking user-facing message.
    fn alert(&self, message: &str);
    fn reload(&self);
    /// Controller state changed; re-render from [`Controller::view`].
    fn redraw(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Idle,
    Scanning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonFace {
    pub icon: &'static str,
    pub label: &'static str,
    pub class: &'static str,
}

pub const START_FACE: ButtonFace = ButtonFace {
    icon: "fas fa-play",
    label: "Start Scanner",
    class: "btn-primary",
};

pub const STOP_FACE: ButtonFace = ButtonFace {
    icon: "fas fa-stop",
    label: "Stop Scanner",
    class: "btn-danger",
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct View {
    pub mode: Mode,
    pub container_visible: bool,
    pub button: ButtonFace,
}

impl View {
    fn of(mode: Mode) -> Self {
        match mode {
            Mode::Idle => View {
                mode,
                container_visible: false,
                button: START_FACE,
            },
            Mode::Scanning => View {
                mode,
                container_visible: true,
                button: STOP_FACE,
            },
        }
    }
}

struct State<S> {
    mode: Mode,
    /// Bumped on every start and stop; async results from an older session
    /// are dropped.
    epoch: u64,
    scanner: Option<Rc<S>>,
    next_request: u64,
    inflight: Vec<(u64, AbortHandle)>,
}

struct Inner<B: CameraBackend, T, U, P> {
    backend: B,
    transport: T,
    surface: U,
    spawner: P,
    options: ScannerOptions,
    endpoint: String,
    csrf_token: String,
    state: RefCell<State<B::Scanner>>,
}

pub struct Controller<B: CameraBackend, T, U, P> {
    inner: Rc<Inner<B, T, U, P>>,
}

impl<B: CameraBackend, T, U, P> Clone for Controller<B, T, U, P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B, T, U, P> Controller<B, T, U, P>
where
    B: CameraBackend + 'static,
    T: Transport + 'static,
    U: Surface + 'static,
    P: LocalSpawn + 'static,
{
    /// `page_url` is the submission target unless the config names an
    /// endpoint.
    pub fn new(
        config: &ScannerConfig,
        page_url: String,
        backend: B,
        transport: T,
        surface: U,
        spawner: P,
    ) -> Self {
        Self {
            inner: Rc::new(Inner {
                backend,
                transport,
                surface,
                spawner,
                options: config.scanner_options(),
                endpoint: config.endpoint.clone().unwrap_or(page_url),
                csrf_token: config.csrf_token.clone(),
                state: RefCell::new(State {
                    mode: Mode::Idle,
                    epoch: 0,
                    scanner: None,
                    next_request: 0,
                    inflight: Vec::new(),
                }),
            }),
        }
    }

    pub fn view(&self) -> View {
        View::of(self.inner.state.borrow().mode)
    }

    pub fn toggle(&self) {
        let mode = self.inner.state.borrow().mode;
        match mode {
            Mode::Idle => self.start(),
            Mode::Scanning => self.stop(),
        }
    }

    fn start(&self) {
        let scanner = Rc::new(self.inner.backend.scanner(&self.inner.options));
        let epoch = {
            let mut state = self.inner.state.borrow_mut();
            state.mode = Mode::Scanning;
            state.epoch += 1;
            state.scanner = Some(scanner.clone());
            state.epoch
        };
        log::info!("starting scanner");
        self.inner.surface.redraw();

        let cameras = self.inner.backend.cameras();
        let this = self.clone();
        self.spawn(async move { this.run_session(epoch, scanner, cameras).await });
    }

    /// Returns to idle: cancels pending submissions, stops capture and
    /// restores the start button.
    pub fn stop(&self) {
        let (scanner, inflight) = {
            let mut state = self.inner.state.borrow_mut();
            state.mode = Mode::Idle;
            state.epoch += 1;
            (state.scanner.take(), std::mem::take(&mut state.inflight))
        };
        if !inflight.is_empty() {
            log::debug!("cancelling {} pending submission(s)", inflight.len());
        }
        for (_, handle) in inflight {
            handle.abort();
        }
        if let Some(scanner) = scanner {
            log::info!("stopping scanner");
            scanner.stop();
        }
        self.inner.surface.redraw();
    }

    fn is_current(&self, epoch: u64) -> bool {
        let state = self.inner.state.borrow();
        state.mode == Mode::Scanning && state.epoch == epoch
    }

    async fn run_session(
        self,
        epoch: u64,
        scanner: Rc<B::Scanner>,
        cameras: LocalResult<Vec<Camera>>,
    ) {
        let mut scans = match self.open_camera(epoch, &scanner, cameras).await {
            Ok(Some(scans)) => scans,
            Ok(None) => return,
            Err(e) => return self.camera_failed(epoch, &e),
        };

        while let Some(text) = scans.next().await {
            if !self.is_current(epoch) {
                break;
            }
            self.submit(text);
        }
        log::debug!("scan session {epoch} finished");
    }

    async fn open_camera(
        &self,
        epoch: u64,
        scanner: &B::Scanner,
        cameras: LocalResult<Vec<Camera>>,
    ) -> Result<Option<mpsc::UnboundedReceiver<String>>, ScanError> {
        let cameras = cameras.await?;
        if !self.is_current(epoch) {
            log::debug!("dropping camera list for stale session {epoch}");
            return Ok(None);
        }
        let camera = cameras.into_iter().next().ok_or(ScanError::NoCamera)?;
        log::info!("using camera {:?}", camera.label);

        let scans = scanner.start(&camera).await?;
        if !self.is_current(epoch) {
            scanner.stop();
            return Ok(None);
        }
        Ok(Some(scans))
    }

    fn camera_failed(&self, epoch: u64, e: &ScanError) {
        if !self.is_current(epoch) {
            return;
        }
        let message = match e {
            ScanError::NoCamera => "No cameras found.".to_owned(),
            other => {
                log::error!("camera error: {other}");
                format!("Camera error: {other}")
            }
        };
        self.inner.surface.alert(&message);
        self.stop();
    }

    fn submit(&self, text: String) {
        let post = match FormPost::scan(&self.inner.endpoint, &self.inner.csrf_token, &text) {
            Ok(post) => post,
            Err(e) => {
                log::warn!("could not encode scan: {e}");
                return;
            }
        };
        let (handle, registration) = AbortHandle::new_pair();
        let id = {
            let mut state = self.inner.state.borrow_mut();
            state.next_request += 1;
            let id = state.next_request;
            state.inflight.push((id, handle));
            id
        };
        log::debug!("submitting scan {id} to {}", post.url);

        let request = Abortable::new(self.inner.transport.post(post), registration);
        let this = self.clone();
        self.spawn(async move {
            let result = request.await;
            this.inner
                .state
                .borrow_mut()
                .inflight
                .retain(|(other, _)| *other != id);
            this.finish_submission(id, result);
        });
    }

    fn finish_submission(&self, id: u64, result: Result<Result<Response, ScanError>, Aborted>) {
        match result {
            Ok(Ok(response)) => match response.outcome() {
                Outcome::Accepted => {
                    log::info!("scan {id} accepted, reloading");
                    self.inner.surface.reload();
                }
                // no user feedback for rejected scans; the scanner keeps running
                Outcome::Rejected { status, message } => log::warn!(
                    "scan {id} rejected with status {status}: {}",
                    message.as_deref().unwrap_or("no message")
                ),
            },
            Ok(Err(e)) => log::warn!("scan {id} not delivered: {e}"),
            Err(Aborted) => log::debug!("scan {id} cancelled"),
        }
    }

    fn spawn(&self, task: impl Future<Output = ()> + 'static) {
        if let Err(e) = self.inner.spawner.spawn_local(task) {
            log::error!("failed to spawn scanner task: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, collections::VecDeque};

    use futures::{
        channel::oneshot,
        executor::{LocalPool, LocalSpawner},
        future::{self, FutureExt},
    };

    use super::*;

    #[derive(Default)]
    struct Harness {
        cameras: RefCell<Option<Result<Vec<Camera>, ScanError>>>,
        held_cameras: RefCell<Option<oneshot::Receiver<Result<Vec<Camera>, ScanError>>>>,
        start_error: RefCell<Option<ScanError>>,
        constructed: RefCell<Vec<ScannerOptions>>,
        started: RefCell<Vec<Camera>>,
        stops: Cell<usize>,
        feed: RefCell<Option<mpsc::UnboundedSender<String>>>,
        posts: RefCell<Vec<FormPost>>,
        replies: RefCell<VecDeque<oneshot::Sender<Result<Response, ScanError>>>>,
        alerts: RefCell<Vec<String>>,
        reloads: Cell<usize>,
        redraws: Cell<usize>,
    }

    impl Harness {
        fn scan(&self, text: &str) {
            let feed = self.feed.borrow();
            let feed = feed.as_ref().expect("scanner is not running");
            feed.unbounded_send(text.to_owned()).unwrap();
        }

        fn reply(&self, reply: Result<Response, ScanError>) {
            let tx = self.replies.borrow_mut().pop_front().expect("no pending post");
            let _ = tx.send(reply);
        }
    }

    #[derive(Clone)]
    struct Fake(Rc<Harness>);

    impl CameraBackend for Fake {
        type Scanner = Fake;

        fn cameras(&self) -> LocalResult<Vec<Camera>> {
            if let Some(rx) = self.0.held_cameras.borrow_mut().take() {
                return rx
                    .map(|r| r.unwrap_or_else(|_| Err(ScanError::CameraAccess("gone".into()))))
                    .boxed_local();
            }
            let result = self
                .0
                .cameras
                .borrow()
                .clone()
                .unwrap_or_else(|| Ok(vec![webcam()]));
            future::ready(result).boxed_local()
        }

        fn scanner(&self, options: &ScannerOptions) -> Fake {
            self.0.constructed.borrow_mut().push(options.clone());
            self.clone()
        }
    }

    impl Scanner for Fake {
        fn start(&self, camera: &Camera) -> LocalResult<mpsc::UnboundedReceiver<String>> {
            if let Some(e) = self.0.start_error.borrow_mut().take() {
                return future::ready(Err(e)).boxed_local();
            }
            self.0.started.borrow_mut().push(camera.clone());
            let (tx, rx) = mpsc::unbounded();
            *self.0.feed.borrow_mut() = Some(tx);
            future::ready(Ok(rx)).boxed_local()
        }

        fn stop(&self) {
            self.0.stops.set(self.0.stops.get() + 1);
            self.0.feed.borrow_mut().take();
        }
    }

    impl Transport for Fake {
        fn post(&self, post: FormPost) -> LocalResult<Response> {
            self.0.posts.borrow_mut().push(post);
            let (tx, rx) = oneshot::channel();
            self.0.replies.borrow_mut().push_back(tx);
            rx.map(|r| r.unwrap_or_else(|_| Err(ScanError::Transport("dropped".into()))))
                .boxed_local()
        }
    }

    impl Surface for Fake {
        fn alert(&self, message: &str) {
            self.0.alerts.borrow_mut().push(message.to_owned());
        }

        fn reload(&self) {
            self.0.reloads.set(self.0.reloads.get() + 1);
        }

        fn redraw(&self) {
            self.0.redraws.set(self.0.redraws.get() + 1);
        }
    }

    type TestController = Controller<Fake, Fake, Fake, LocalSpawner>;

    fn webcam() -> Camera {
        Camera {
            id: "cam-0".into(),
            label: "Integrated Webcam".into(),
        }
    }

    fn setup() -> (LocalPool, Rc<Harness>, TestController) {
        let pool = LocalPool::new();
        let harness = Rc::new(Harness::default());
        let fake = Fake(harness.clone());
        let config = ScannerConfig {
            csrf_token: "csrf-abc".into(),
            ..ScannerConfig::default()
        };
        let controller = Controller::new(
            &config,
            "https://attendance.example/events/7/".into(),
            fake.clone(),
            fake.clone(),
            fake,
            pool.spawner(),
        );
        (pool, harness, controller)
    }

    fn ok() -> Result<Response, ScanError> {
        Ok(Response {
            status: 200,
            body: r#"{"status": "success"}"#.into(),
        })
    }

    #[test]
    fn starts_idle() {
        let (_pool, harness, controller) = setup();
        let view = controller.view();
        assert_eq!(view.mode, Mode::Idle);
        assert!(!view.container_visible);
        assert_eq!(view.button, START_FACE);
        assert!(harness.constructed.borrow().is_empty());
    }

    #[test]
    fn toggle_shows_and_hides_container() {
        let (mut pool, harness, controller) = setup();

        controller.toggle();
        let view = controller.view();
        assert_eq!(view.mode, Mode::Scanning);
        assert!(view.container_visible);
        assert_eq!(view.button, STOP_FACE);

        pool.run_until_stalled();
        assert_eq!(harness.started.borrow().as_slice(), &[webcam()]);
        assert_eq!(
            harness.constructed.borrow()[0],
            ScannerOptions {
                video_id: "scanner".into(),
                scan_period: 5,
                refractory_period_ms: 5000,
                mirror: false
            }
        );

        controller.toggle();
        pool.run_until_stalled();
        let view = controller.view();
        assert_eq!(view.mode, Mode::Idle);
        assert!(!view.container_visible);
        assert_eq!(view.button, START_FACE);
        assert_eq!(harness.stops.get(), 1);
        assert!(harness.redraws.get() >= 2);
    }

    #[test]
    fn first_camera_is_used() {
        let (mut pool, harness, controller) = setup();
        let back = Camera {
            id: "cam-1".into(),
            label: "Back".into(),
        };
        *harness.cameras.borrow_mut() = Some(Ok(vec![webcam(), back]));

        controller.toggle();
        pool.run_until_stalled();
        assert_eq!(harness.started.borrow().as_slice(), &[webcam()]);
    }

    #[test]
    fn no_camera_alerts_and_returns_to_idle() {
        let (mut pool, harness, controller) = setup();
        *harness.cameras.borrow_mut() = Some(Ok(vec![]));

        controller.toggle();
        pool.run_until_stalled();

        assert_eq!(harness.alerts.borrow().as_slice(), &["No cameras found."]);
        assert_eq!(controller.view().mode, Mode::Idle);
        assert_eq!(controller.view().button, START_FACE);
        assert!(harness.started.borrow().is_empty());
        assert_eq!(harness.stops.get(), 1);
    }

    #[test]
    fn enumeration_error_alerts_with_message() {
        let (mut pool, harness, controller) = setup();
        *harness.cameras.borrow_mut() = Some(Err(ScanError::CameraAccess(
            "NotAllowedError: Permission denied".into(),
        )));

        controller.toggle();
        pool.run_until_stalled();

        assert_eq!(
            harness.alerts.borrow().as_slice(),
            &["Camera error: NotAllowedError: Permission denied"]
        );
        assert_eq!(controller.view().mode, Mode::Idle);
        assert!(!controller.view().container_visible);
    }

    #[test]
    fn camera_start_failure_is_a_camera_error() {
        let (mut pool, harness, controller) = setup();
        *harness.start_error.borrow_mut() =
            Some(ScanError::CameraAccess("NotReadableError: Device in use".into()));

        controller.toggle();
        pool.run_until_stalled();

        assert_eq!(
            harness.alerts.borrow().as_slice(),
            &["Camera error: NotReadableError: Device in use"]
        );
        assert_eq!(controller.view().mode, Mode::Idle);
    }

    #[test]
    fn scan_posts_form_to_page() {
        let (mut pool, harness, controller) = setup();
        controller.toggle();
        pool.run_until_stalled();

        harness.scan("MEMBER:42 & co");
        pool.run_until_stalled();

        let posts = harness.posts.borrow();
        assert_eq!(posts.len(), 1);
        let post = &posts[0];
        assert_eq!(post.url, "https://attendance.example/events/7/");
        assert_eq!(
            post.header("Content-Type"),
            Some("application/x-www-form-urlencoded")
        );
        assert_eq!(post.header("X-CSRFToken"), Some("csrf-abc"));
        let fields: Vec<(String, String)> = serde_urlencoded::from_str(&post.body).unwrap();
        assert_eq!(
            fields,
            vec![("scan_data".to_owned(), "MEMBER:42 & co".to_owned())]
        );
    }

    #[test]
    fn configured_endpoint_overrides_page_url() {
        let mut pool = LocalPool::new();
        let harness = Rc::new(Harness::default());
        let fake = Fake(harness.clone());
        let config = ScannerConfig {
            endpoint: Some("/attendance/scan/".into()),
            ..ScannerConfig::default()
        };
        let controller = Controller::new(
            &config,
            "https://attendance.example/".into(),
            fake.clone(),
            fake.clone(),
            fake,
            pool.spawner(),
        );
        controller.toggle();
        pool.run_until_stalled();
        harness.scan("x");
        pool.run_until_stalled();
        assert_eq!(harness.posts.borrow()[0].url, "/attendance/scan/");
    }

    #[test]
    fn ok_response_reloads_once() {
        let (mut pool, harness, controller) = setup();
        controller.toggle();
        pool.run_until_stalled();

        harness.scan("MEMBER:1");
        pool.run_until_stalled();
        harness.reply(ok());
        pool.run_until_stalled();

        assert_eq!(harness.reloads.get(), 1);
        assert!(harness.alerts.borrow().is_empty());
    }

    #[test]
    fn rejected_or_failed_response_is_silent() {
        let (mut pool, harness, controller) = setup();
        controller.toggle();
        pool.run_until_stalled();

        harness.scan("MEMBER:404");
        harness.scan("MEMBER:500");
        pool.run_until_stalled();
        harness.reply(Ok(Response {
            status: 400,
            body: r#"{"status": "error", "message": "Member not found"}"#.into(),
        }));
        harness.reply(Err(ScanError::Transport("network down".into())));
        pool.run_until_stalled();

        assert_eq!(harness.reloads.get(), 0);
        assert!(harness.alerts.borrow().is_empty());
        assert_eq!(controller.view().mode, Mode::Scanning);

        // still scanning: the next code goes out as usual
        harness.scan("MEMBER:2");
        pool.run_until_stalled();
        assert_eq!(harness.posts.borrow().len(), 3);
    }

    #[test]
    fn repeated_scans_are_not_debounced() {
        let (mut pool, harness, controller) = setup();
        controller.toggle();
        pool.run_until_stalled();

        harness.scan("MEMBER:5");
        harness.scan("MEMBER:5");
        pool.run_until_stalled();
        assert_eq!(harness.posts.borrow().len(), 2);
    }

    #[test]
    fn stop_cancels_pending_submission() {
        let (mut pool, harness, controller) = setup();
        controller.toggle();
        pool.run_until_stalled();

        harness.scan("MEMBER:9");
        pool.run_until_stalled();
        controller.toggle();
        pool.run_until_stalled();

        // the server answers after the user stopped scanning
        harness.reply(ok());
        pool.run_until_stalled();
        assert_eq!(harness.reloads.get(), 0);
        assert_eq!(controller.view().mode, Mode::Idle);
    }

    #[test]
    fn late_camera_list_is_ignored_after_stop() {
        let (mut pool, harness, controller) = setup();
        let (tx, rx) = oneshot::channel();
        *harness.held_cameras.borrow_mut() = Some(rx);

        controller.toggle();
        pool.run_until_stalled();
        controller.toggle();
        pool.run_until_stalled();

        tx.send(Ok(vec![])).unwrap();
        pool.run_until_stalled();

        assert!(harness.alerts.borrow().is_empty());
        assert!(harness.started.borrow().is_empty());
        assert_eq!(controller.view().mode, Mode::Idle);
    }

    #[test]
    fn restart_builds_a_fresh_scanner() {
        let (mut pool, harness, controller) = setup();
        for _ in 0..2 {
            controller.toggle();
            pool.run_until_stalled();
            controller.toggle();
            pool.run_until_stalled();
        }
        assert_eq!(harness.constructed.borrow().len(), 2);
        assert_eq!(harness.started.borrow().len(), 2);
        assert_eq!(harness.stops.get(), 2);
        assert_eq!(controller.view().button, START_FACE);
    }
}
