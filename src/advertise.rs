//! `_hap._tcp` service advertisement.
//!
//! zeroconf services are `!Send`, so the service lives on its own thread and
//! is re-registered whenever the paired flag changes.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use hap_core::AccessoryConfig;
use tokio::sync::watch;
use zeroconf::prelude::*;
use zeroconf::{MdnsService, ServiceRegistration, ServiceType, TxtRecord};

const SERVICE_NAME: &str = "hap";
const SERVICE_PROTOCOL: &str = "tcp";
const PROTOCOL_VERSION: &str = "1.1";
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// What the accessory announces about itself.
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub name: String,
    pub port: u16,
    pub device_id: String,
    pub model: String,
    pub config_number: u32,
    pub category: u16,
}

impl Advertisement {
    pub fn new(config: &AccessoryConfig, device_id: &str, port: u16) -> Self {
        Self {
            name: config.name.clone(),
            port,
            device_id: device_id.to_string(),
            model: config.model.clone(),
            config_number: config.config_number,
            category: config.category,
        }
    }

    /// TXT keys in announcement order. `sf` is 1 until a controller pairs.
    pub fn txt_entries(&self, paired: bool) -> Vec<(&'static str, String)> {
        vec![
            ("c#", self.config_number.to_string()),
            ("ff", "0".to_string()),
            ("id", self.device_id.clone()),
            ("md", self.model.clone()),
            ("pv", PROTOCOL_VERSION.to_string()),
            ("s#", "1".to_string()),
            ("sf", if paired { "0" } else { "1" }.to_string()),
            ("ci", self.category.to_string()),
        ]
    }
}

/// Advertise on a dedicated thread until the paired channel closes.
pub fn spawn(
    advertisement: Advertisement,
    paired: watch::Receiver<bool>,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("hap-advertise".to_string())
        .spawn(move || run(advertisement, paired))
}

fn run(advertisement: Advertisement, mut paired: watch::Receiver<bool>) {
    loop {
        let is_paired = *paired.borrow_and_update();
        if let Err(e) = publish_until_changed(&advertisement, is_paired, &mut paired) {
            tracing::error!(error = %e, "Service advertisement failed");
            return;
        }
        if paired.has_changed().is_err() {
            tracing::debug!("Advertisement stopped");
            return;
        }
        tracing::info!(paired = *paired.borrow(), "Re-announcing accessory");
    }
}

/// Register the service and poll it until the paired flag changes or its
/// sender goes away.
fn publish_until_changed(
    advertisement: &Advertisement,
    is_paired: bool,
    paired: &mut watch::Receiver<bool>,
) -> zeroconf::Result<()> {
    let service_type = ServiceType::new(SERVICE_NAME, SERVICE_PROTOCOL)?;
    let mut service = MdnsService::new(service_type, advertisement.port);
    let mut txt = TxtRecord::new();
    for (key, value) in advertisement.txt_entries(is_paired) {
        txt.insert(key, &value)?;
    }
    service.set_name(&advertisement.name);
    service.set_txt_record(txt);
    service.set_registered_callback(Box::new(on_service_registered));

    let event_loop = service.register()?;
    loop {
        event_loop.poll(POLL_INTERVAL)?;
        match paired.has_changed() {
            Ok(false) => {}
            Ok(true) | Err(_) => return Ok(()),
        }
    }
}

fn on_service_registered(
    result: zeroconf::Result<ServiceRegistration>,
    _context: Option<Arc<dyn Any>>,
) {
    match result {
        Ok(registration) => tracing::info!(
            name = %registration.name(),
            "Accessory advertised as _{}._{}",
            SERVICE_NAME,
            SERVICE_PROTOCOL
        ),
        Err(e) => tracing::warn!(error = %e, "Service registration failed"),
    }
}
