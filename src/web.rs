//! Browser implementations of the controller's seams.

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    sync::Arc,
};

use futures::{
    channel::mpsc,
    future::FutureExt,
    task::{LocalFutureObj, LocalSpawn, SpawnError},
};
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::JsFuture;

use crate::{
    config::ScannerOptions,
    controller::{Camera, CameraBackend, LocalResult, Scanner, Surface, Transport},
    decode::{decode_rgba, FrameGate, Refractory},
    submit::{FormPost, Response},
    ScanError,
};

fn js_message(value: &JsValue) -> String {
    if let Some(e) = value.dyn_ref::<web_sys::DomException>() {
        format!("{}: {}", e.name(), e.message())
    } else if let Some(e) = value.dyn_ref::<js_sys::Error>() {
        String::from(e.message())
    } else if let Some(s) = value.as_string() {
        s
    } else {
        format!("{value:?}")
    }
}

fn camera_error(value: JsValue) -> ScanError {
    ScanError::CameraAccess(js_message(&value))
}

fn transport_error(value: JsValue) -> ScanError {
    ScanError::Transport(js_message(&value))
}

fn media_devices() -> Result<web_sys::MediaDevices, ScanError> {
    web_sys::window()
        .ok_or_else(|| ScanError::CameraAccess("no window".into()))?
        .navigator()
        .media_devices()
        .map_err(camera_error)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WebCameras;

impl CameraBackend for WebCameras {
    type Scanner = WebScanner;

    fn cameras(&self) -> LocalResult<Vec<Camera>> {
        list_cameras().boxed_local()
    }

    fn scanner(&self, options: &ScannerOptions) -> WebScanner {
        WebScanner {
            inner: Rc::new(ScannerInner {
                options: options.clone(),
                session: RefCell::new(None),
            }),
        }
    }
}

async fn list_cameras() -> Result<Vec<Camera>, ScanError> {
    // devices stay hidden until the page holds camera access, so ask first;
    // a denial surfaces here as a camera error
    let access = get_stream("").await?;
    stop_tracks(&access);

    let devices = JsFuture::from(media_devices()?.enumerate_devices().map_err(camera_error)?)
        .await
        .map_err(camera_error)?;
    let devices: js_sys::Array = devices.dyn_into().map_err(camera_error)?;

    Ok(devices
        .iter()
        .filter_map(|d| d.dyn_into::<web_sys::MediaDeviceInfo>().ok())
        .filter(|d| d.kind() == web_sys::MediaDeviceKind::Videoinput)
        .enumerate()
        .map(|(i, d)| {
            let label = d.label();
            Camera {
                id: d.device_id(),
                label: if label.is_empty() {
                    format!("camera {i}")
                } else {
                    label
                },
            }
        })
        .collect())
}

/// Device ids are hidden until the user has granted camera access; an empty
/// id falls back to any camera.
async fn get_stream(device_id: &str) -> Result<web_sys::MediaStream, ScanError> {
    let mut constraints = web_sys::MediaStreamConstraints::new();
    if device_id.is_empty() {
        constraints.video(&JsValue::TRUE);
    } else {
        let mut track = web_sys::MediaTrackConstraints::new();
        track.device_id(&JsValue::from_str(device_id));
        constraints.video(&track);
    }
    log::info!("waiting for permission..");
    let stream = JsFuture::from(
        media_devices()?
            .get_user_media_with_constraints(&constraints)
            .map_err(camera_error)?,
    )
    .await
    .map_err(camera_error)?;
    stream.dyn_into().map_err(camera_error)
}

fn stop_tracks(stream: &web_sys::MediaStream) {
    for track in stream.get_tracks().iter() {
        if let Ok(track) = track.dyn_into::<web_sys::MediaStreamTrack>() {
            track.stop();
        }
    }
}

/// Whether the element still shows `ours`; another session may have bound
/// its own stream since.
fn still_bound<T: PartialEq + ?Sized>(current: Option<&T>, ours: &T) -> bool {
    current == Some(ours)
}

fn decode_frame(video: &web_sys::HtmlVideoElement) -> Result<Option<String>, JsValue> {
    let (width, height) = (video.video_width(), video.video_height());
    // no frame yet
    if width == 0 {
        return Ok(None);
    }

    let canvas = web_sys::OffscreenCanvas::new(width, height)?;
    let ctx: web_sys::OffscreenCanvasRenderingContext2d = canvas
        .get_context("2d")?
        .ok_or_else(|| JsValue::from_str("2d context unavailable"))?
        .dyn_into()?;

    ctx.draw_image_with_html_video_element_and_dw_and_dh(
        video,
        0.0,
        0.0,
        width as _,
        height as _,
    )?;

    let data = ctx.get_image_data(0.0, 0.0, width as _, height as _)?;
    Ok(decode_rgba(width, height, data.data().0))
}

/// Calls `f` on every animation frame until `running` is cleared.
fn frame_callback_loop<F>(running: Rc<Cell<bool>>, mut f: F)
where
    F: FnMut() + 'static,
{
    #[wasm_bindgen]
    extern "C" {
        // FIXME: should probably use requestVideoFrameCallback
        fn requestAnimationFrame(closure: &Closure<dyn FnMut()>) -> u32;
    }

    let closure = Rc::new(RefCell::new(None::<Closure<dyn FnMut()>>));
    *closure.borrow_mut() = Some({
        let closure = closure.clone();
        Closure::<dyn FnMut()>::new(move || {
            if !running.get() {
                // the closure can't be dropped while it is running
                let finished = closure.borrow_mut().take();
                wasm_bindgen_futures::spawn_local(async move { drop(finished) });
                return;
            }
            f();
            if let Some(next) = closure.borrow().as_ref() {
                requestAnimationFrame(next);
            }
        })
    });

    if let Some(first) = closure.borrow().as_ref() {
        requestAnimationFrame(first);
    };
}

struct Session {
    stream: web_sys::MediaStream,
    video: web_sys::HtmlVideoElement,
    /// What the element showed before this session bound its stream.
    replaced: Option<web_sys::MediaStream>,
    running: Rc<Cell<bool>>,
    feed: Rc<RefCell<Option<mpsc::UnboundedSender<String>>>>,
}

impl Session {
    fn close(self) {
        self.running.set(false);
        self.feed.borrow_mut().take();
        stop_tracks(&self.stream);

        let current = self.video.src_object().map(JsValue::from);
        if still_bound(current.as_ref(), AsRef::<JsValue>::as_ref(&self.stream)) {
            let restored = self.replaced.filter(|s| s.active());
            self.video.set_src_object(restored.as_ref());
        }
    }
}

struct ScannerInner {
    options: ScannerOptions,
    session: RefCell<Option<Session>>,
}

/// QR scanner bound to the `<video>` element named in its options.
#[derive(Clone)]
pub struct WebScanner {
    inner: Rc<ScannerInner>,
}

impl Scanner for WebScanner {
    fn start(&self, camera: &Camera) -> LocalResult<mpsc::UnboundedReceiver<String>> {
        let inner = self.inner.clone();
        let device_id = camera.id.clone();
        async move {
            let video: web_sys::HtmlVideoElement = web_sys::window()
                .and_then(|w| w.document())
                .and_then(|d| d.get_element_by_id(&inner.options.video_id))
                .ok_or_else(|| {
                    ScanError::CameraAccess(format!("no #{} element", inner.options.video_id))
                })?
                .dyn_into()
                .map_err(|_| {
                    ScanError::CameraAccess(format!("#{} is not a video", inner.options.video_id))
                })?;

            let stream = get_stream(&device_id).await?;
            let replaced = video.src_object();
            video.set_src_object(Some(&stream));

            let (tx, rx) = mpsc::unbounded();
            let feed = Rc::new(RefCell::new(Some(tx)));
            let running = Rc::new(Cell::new(true));

            frame_callback_loop(running.clone(), {
                let video = video.clone();
                let feed = feed.clone();
                let mut gate = FrameGate::new(inner.options.scan_period);
                let mut refractory = Refractory::new(inner.options.refractory_period_ms);
                move || {
                    if !gate.tick() {
                        return;
                    }
                    match decode_frame(&video) {
                        Ok(Some(text)) if refractory.admit(&text, js_sys::Date::now()) => {
                            if let Some(feed) = feed.borrow().as_ref() {
                                let _ = feed.unbounded_send(text);
                            }
                        }
                        Ok(_) => {}
                        Err(e) => log::debug!("frame skipped: {}", js_message(&e)),
                    }
                }
            });

            let previous = inner.session.borrow_mut().replace(Session {
                stream,
                video,
                replaced,
                running,
                feed,
            });
            if let Some(previous) = previous {
                previous.close();
            }
            Ok(rx)
        }
        .boxed_local()
    }

    fn stop(&self) {
        if let Some(session) = self.inner.session.borrow_mut().take() {
            session.close();
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FetchTransport;

impl Transport for FetchTransport {
    fn post(&self, post: FormPost) -> LocalResult<Response> {
        send(post).boxed_local()
    }
}

async fn send(post: FormPost) -> Result<Response, ScanError> {
    let headers = web_sys::Headers::new().map_err(transport_error)?;
    for (name, value) in &post.headers {
        headers.set(name, value).map_err(transport_error)?;
    }

    let mut init = web_sys::RequestInit::new();
    init.method("POST")
        .headers(&headers)
        .body(Some(&JsValue::from_str(&post.body)));
    let request =
        web_sys::Request::new_with_str_and_init(&post.url, &init).map_err(transport_error)?;

    let window = web_sys::window().ok_or_else(|| ScanError::Transport("no window".into()))?;
    let response: web_sys::Response = JsFuture::from(window.fetch_with_request(&request))
        .await
        .map_err(transport_error)?
        .dyn_into()
        .map_err(transport_error)?;

    let body = match response.text() {
        Ok(text) => JsFuture::from(text)
            .await
            .ok()
            .and_then(|v| v.as_string())
            .unwrap_or_default(),
        Err(_) => String::new(),
    };
    Ok(Response {
        status: response.status(),
        body,
    })
}

/// Window-level effects plus the component's re-render hook.
pub struct WindowSurface {
    redraw: Arc<dyn Fn() + Send + Sync>,
}

impl WindowSurface {
    pub fn new(redraw: Arc<dyn Fn() + Send + Sync>) -> Self {
        Self { redraw }
    }
}

impl Surface for WindowSurface {
    fn alert(&self, message: &str) {
        let shown = web_sys::window().map(|w| w.alert_with_message(message));
        if !matches!(shown, Some(Ok(()))) {
            log::error!("could not show alert: {message}");
        }
    }

    fn reload(&self) {
        if let Some(Err(e)) = web_sys::window().map(|w| w.location().reload()) {
            log::error!("reload failed: {}", js_message(&e));
        }
    }

    fn redraw(&self) {
        (self.redraw)()
    }
}

/// Runs controller tasks on the browser's microtask queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct WasmSpawner;

impl LocalSpawn for WasmSpawner {
    fn spawn_local_obj(&self, future: LocalFutureObj<'static, ()>) -> Result<(), SpawnError> {
        wasm_bindgen_futures::spawn_local(future);
        Ok(())
    }
}

/// The current page, where scans are posted by default.
pub fn page_url() -> String {
    web_sys::window()
        .and_then(|w| w.location().href().ok())
        .unwrap_or_default()
}
