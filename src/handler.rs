//! The accessory's own request handler: an information-only accessory
//! database plus firmware upload acknowledgement.

use async_trait::async_trait;
use hap_core::error::Result;
use hap_core::AccessoryConfig;
use hap_transport::{EventSender, Request, RequestBody, RequestHandler, Response};
use serde_json::json;

pub struct AccessoryHandler {
    name: String,
    model: String,
    device_id: String,
}

impl AccessoryHandler {
    pub fn new(config: &AccessoryConfig, device_id: &str) -> Self {
        Self {
            name: config.name.clone(),
            model: config.model.clone(),
            device_id: device_id.to_string(),
        }
    }

    /// A single accessory exposing the Accessory Information service.
    fn accessories(&self) -> serde_json::Value {
        json!({
            "accessories": [{
                "aid": 1,
                "services": [{
                    "type": "3E",
                    "iid": 1,
                    "characteristics": [
                        { "type": "14", "iid": 2, "perms": ["pw"], "format": "bool" },
                        { "type": "20", "iid": 3, "perms": ["pr"], "format": "string", "value": "hap-accessory" },
                        { "type": "21", "iid": 4, "perms": ["pr"], "format": "string", "value": self.model },
                        { "type": "23", "iid": 5, "perms": ["pr"], "format": "string", "value": self.name },
                        { "type": "30", "iid": 6, "perms": ["pr"], "format": "string", "value": self.device_id },
                        { "type": "52", "iid": 7, "perms": ["pr"], "format": "string", "value": env!("CARGO_PKG_VERSION") },
                    ],
                }],
            }],
        })
    }
}

#[async_trait]
impl RequestHandler for AccessoryHandler {
    async fn handle(&self, request: Request, _events: EventSender) -> Result<Response> {
        if let RequestBody::Firmware { len } = request.body {
            tracing::info!(len, path = %request.path(), "Firmware image received");
            return Ok(Response::empty(204));
        }

        match (request.head.method.as_str(), request.path()) {
            ("GET", "/accessories") => Ok(Response::json(200, self.accessories().to_string())),
            ("PUT", "/characteristics") => {
                tracing::info!(body = %String::from_utf8_lossy(request.bytes()), "Characteristic write");
                Ok(Response::empty(204))
            }
            (method, path) => {
                tracing::debug!(method, path, "No handler for request");
                Ok(Response::empty(404))
            }
        }
    }
}
