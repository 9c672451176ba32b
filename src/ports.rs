//! Port traits — the boundary between the rule engine and its device
//! collaborators.
//!
//! The LED/GPIO/device-power drivers, and the HTTP client that fires
//! webhooks, live outside this crate. The action dispatcher consumes
//! them through these traits, so the engine core never touches hardware
//! or sockets directly. [`NullPorts`] provides logging no-op adapters
//! for tests and bring-up.

use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Device-power verbs accepted by the power controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PowerVerb {
    PowerOn,
    PowerOff,
    ForceOff,
    Reset,
    Recovery,
}

/// HTTP methods supported for webhook actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
}

/// LED pixel index meaning "every pixel on the device".
pub const LED_PIXEL_ALL: u8 = 0xFF;

/// LED control subtypes; the dispatcher derives the post-render settle
/// delay from this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LedOp {
    /// Set a single pixel (or all, with [`LED_PIXEL_ALL`]).
    #[default]
    Set,
    /// Fill the whole device.
    Fill,
    /// Start a named effect.
    Effect,
    /// Turn the device off.
    Clear,
}

/// Driver for addressable LED devices.
#[async_trait]
pub trait LedPort: Send + Sync {
    /// Applies a control operation to the device with alias `device`.
    /// `pixel` uses [`LED_PIXEL_ALL`] as the fill sentinel.
    async fn apply(
        &self,
        device: &str,
        op: LedOp,
        pixel: u8,
        rgb: (u8, u8, u8),
        effect: Option<&str>,
        duration_ms: u32,
    ) -> Result<()>;
}

/// Driver for raw GPIO lines.
#[async_trait]
pub trait GpioPort: Send + Sync {
    /// Drives `pin` to `level`; with `pulse_ms` the line reverts after
    /// the pulse width.
    async fn write(&self, pin: u8, level: bool, pulse_ms: Option<u32>) -> Result<()>;
}

/// Driver for managed device power rails.
#[async_trait]
pub trait DevicePowerPort: Send + Sync {
    async fn control(&self, device: &str, verb: PowerVerb) -> Result<()>;
}

/// Outbound HTTP client used for webhook actions. Returns the response
/// status code; transport failures are errors.
#[async_trait]
pub trait WebhookPort: Send + Sync {
    async fn send(&self, url: &str, method: HttpMethod, body: &str) -> Result<u16>;
}

/// Aggregated collaborator handles consumed by the dispatcher.
#[derive(Clone)]
pub struct Ports {
    pub led: Arc<dyn LedPort>,
    pub gpio: Arc<dyn GpioPort>,
    pub device: Arc<dyn DevicePowerPort>,
    pub webhook: Arc<dyn WebhookPort>,
}

impl Default for Ports {
    fn default() -> Self {
        let null = Arc::new(NullPorts);
        Self {
            led: null.clone(),
            gpio: null.clone(),
            device: null.clone(),
            webhook: null,
        }
    }
}

/// Logging no-op adapter for every port.
pub struct NullPorts;

#[async_trait]
impl LedPort for NullPorts {
    async fn apply(
        &self,
        device: &str,
        op: LedOp,
        pixel: u8,
        rgb: (u8, u8, u8),
        effect: Option<&str>,
        duration_ms: u32,
    ) -> Result<()> {
        info!(
            "led[{device}] {op:?} pixel={pixel} rgb={rgb:?} effect={effect:?} duration={duration_ms}ms"
        );
        Ok(())
    }
}

#[async_trait]
impl GpioPort for NullPorts {
    async fn write(&self, pin: u8, level: bool, pulse_ms: Option<u32>) -> Result<()> {
        info!("gpio[{pin}] level={level} pulse={pulse_ms:?}");
        Ok(())
    }
}

#[async_trait]
impl DevicePowerPort for NullPorts {
    async fn control(&self, device: &str, verb: PowerVerb) -> Result<()> {
        info!("device[{device}] {verb:?}");
        Ok(())
    }
}

#[async_trait]
impl WebhookPort for NullPorts {
    async fn send(&self, url: &str, method: HttpMethod, body: &str) -> Result<u16> {
        info!("webhook {method:?} {url} ({} byte body)", body.len());
        Ok(200)
    }
}
