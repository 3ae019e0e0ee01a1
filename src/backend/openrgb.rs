use crate::backend::{BackendError, RgbBackend, RgbColor, RgbDevice};
use async_trait::async_trait;
use openrgb::data::Color;
use openrgb::OpenRGB;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{info, warn};

type SdkClient = OpenRGB<TcpStream>;

/// Lighting backend talking to an OpenRGB SDK server over TCP.
pub struct OpenRgbClient {
    addr: String,
    client_name: String,
    client: Mutex<Option<SdkClient>>,
}

impl OpenRgbClient {
    pub fn new(host: &str, port: u16, client_name: impl Into<String>) -> Self {
        Self {
            addr: format!("{host}:{port}"),
            client_name: client_name.into(),
            client: Mutex::new(None),
        }
    }
}

fn sdk_color(color: RgbColor) -> Color {
    Color {
        r: color.r,
        g: color.g,
        b: color.b,
    }
}

#[async_trait]
impl RgbBackend for OpenRgbClient {
    async fn connect(&self) -> Result<(), BackendError> {
        let stream = TcpStream::connect(&self.addr).await?;
        let client = OpenRGB::new(stream)
            .await
            .map_err(|err| BackendError::Protocol(format!("openrgb handshake failed: {err}")))?;
        client
            .set_name(self.client_name.as_str())
            .await
            .map_err(|err| BackendError::Protocol(err.to_string()))?;
        *self.client.lock().await = Some(client);
        info!(addr = %self.addr, "connected to openrgb server");
        Ok(())
    }

    async fn scan_devices(&self) -> Result<Vec<RgbDevice>, BackendError> {
        let mut slot = self.client.lock().await;
        let answer = match slot.as_ref() {
            Some(client) => client.get_controller_count().await,
            None => return Err(BackendError::NotConnected),
        };
        let count = match answer {
            Ok(count) => count,
            Err(err) => {
                // a server that cannot answer the count has gone away
                warn!(error = %err, "openrgb connection lost");
                *slot = None;
                return Err(BackendError::Io(err.to_string()));
            }
        };

        let client = slot.as_ref().ok_or(BackendError::NotConnected)?;
        let mut devices = Vec::with_capacity(count as usize);
        for index in 0..count {
            match client.get_controller(index).await {
                Ok(controller) => devices.push(RgbDevice {
                    name: controller.name.clone(),
                    index,
                    led_count: controller.leds.len(),
                    modes: controller.modes.iter().map(|m| m.name.clone()).collect(),
                }),
                Err(err) => warn!(index, error = %err, "skipping unreadable controller"),
            }
        }
        Ok(devices)
    }

    async fn set_color(&self, index: u32, color: RgbColor) -> Result<(), BackendError> {
        let slot = self.client.lock().await;
        let client = slot.as_ref().ok_or(BackendError::NotConnected)?;

        let controller = client
            .get_controller(index)
            .await
            .map_err(|err| BackendError::Request(format!("controller {index}: {err}")))?;
        let colors = vec![sdk_color(color); controller.leds.len()];
        client
            .update_leds(index, colors)
            .await
            .map_err(|err| BackendError::Request(format!("controller {index}: {err}")))
    }
}
