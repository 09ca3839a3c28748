#![allow(non_snake_case)]

use dioxus::prelude::*;

pub mod config;
pub mod controller;
pub mod decode;
mod error;
pub mod submit;
pub mod web;

pub use config::ScannerConfig;
pub use controller::{ButtonFace, Controller, Mode, View};
pub use error::ScanError;

use web::{FetchTransport, WasmSpawner, WebCameras, WindowSurface};

pub type WebController = Controller<WebCameras, FetchTransport, WindowSurface, WasmSpawner>;

#[derive(Props, PartialEq)]
pub struct ScannerToggleProps {
    pub config: ScannerConfig,
}

/// Start/stop button with the camera preview underneath. Decoded codes are
/// posted back to the page, which reloads once the server accepts one.
pub fn ScannerToggle(cx: Scope<ScannerToggleProps>) -> Element {
    let config = &cx.props.config;

    let controller = cx
        .use_hook(|| {
            WebController::new(
                config,
                web::page_url(),
                WebCameras,
                FetchTransport,
                WindowSurface::new(cx.schedule_update()),
                WasmSpawner,
            )
        })
        .clone();

    let view = controller.view();
    let display = if view.container_visible { "block" } else { "none" };
    let transform = if config.mirror { "scaleX(-1)" } else { "none" };
    let button_class = format!("btn {}", view.button.class);
    let icon = view.button.icon;
    let label = view.button.label;
    let button_id = &config.button_id;
    let container_id = &config.container_id;
    let video_id = &config.video_id;

    render! {
        button {
            id: "{button_id}",
            class: "{button_class}",
            r#type: "button",
            onclick: move |_| controller.toggle(),
            i { class: "{icon}" }
            " {label}"
        }
        div {
            id: "{container_id}",
            style: "display: {display}",
            video {
                id: "{video_id}",
                autoplay: true,
                "playsinline": "true",
                style: "transform: {transform}",
            }
        }
    }
}
