use dioxus_attendance_scanner::{ScannerConfig, ScannerToggle, ScannerToggleProps};
use log::LevelFilter;

fn main() {
    // Init debug
    dioxus_logger::init(LevelFilter::Info).expect("failed to init logger");
    console_error_panic_hook::set_once();

    let Some(document) = web_sys::window().and_then(|w| w.document()) else {
        return;
    };

    let config = ScannerConfig::from_document(&document).unwrap_or_else(|e| {
        log::error!("{e}, using defaults");
        ScannerConfig::default()
    });

    // pages without a scanner mount point are left alone
    if document.get_element_by_id(&config.root_id).is_none() {
        log::debug!("no #{} on this page", config.root_id);
        return;
    }

    log::info!("starting scanner toggle");
    let root = config.root_id.clone();
    dioxus_web::launch_with_props(
        ScannerToggle,
        ScannerToggleProps { config },
        dioxus_web::Config::new().rootname(root),
    );
}
