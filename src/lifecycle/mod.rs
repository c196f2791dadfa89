//! # Lifecycle Certificates
//!
//! Announces the gateway to the cloud with three control messages:
//!
//! ```text
//! <prefix>/<account>/<client>/MQTT/BIRTH   inventory, on connect
//! <prefix>/<account>/<client>/MQTT/DC      uptime + name, before disconnect
//! <prefix>/<account>/<client>/MQTT/APPS    birth shape, when apps change
//! ```
//!
//! Lifecycle publishes are serialized and each one waits (bounded, best
//! effort) for its acknowledgment so the certificates leave in order. A
//! missing acknowledgment is logged, never returned as an error.

pub mod birth;
pub mod pending_ack;

pub use birth::{
    BirthContext, ConfiguredDevice, DeviceInfoProvider, DeviceProfile, ModemIdentity,
};
pub use pending_ack::{AckEvent, PendingAck};

use crate::error::CloudError;
use crate::payload::{Payload, Position};
use crate::router::CloudContext;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Advertised when compression is enabled
const ACCEPTED_COMPRESSION: &str = "gzip";

pub struct LifecycleAnnouncer {
    context: Arc<CloudContext>,
    device: Arc<dyn DeviceInfoProvider>,
    pending: PendingAck,
    modem: Mutex<Option<ModemIdentity>>,
    position: Mutex<Option<Position>>,
}

impl LifecycleAnnouncer {
    pub fn new(context: Arc<CloudContext>, device: Arc<dyn DeviceInfoProvider>) -> Self {
        Self {
            context,
            device,
            pending: PendingAck::new(),
            modem: Mutex::new(None),
            position: Mutex::new(None),
        }
    }

    pub fn pending(&self) -> &PendingAck {
        &self.pending
    }

    /// Remembers the modem identity for later certificates
    pub fn set_modem_identity(&self, identity: ModemIdentity) {
        *self.modem.lock() = Some(identity);
    }

    pub fn set_position(&self, position: Position) {
        *self.position.lock() = Some(position);
    }

    /// Current inventory with the last known modem identity and fix folded in
    pub fn profile(&self) -> DeviceProfile {
        let mut profile = self.device.profile();
        if let Some(modem) = self.modem.lock().clone() {
            profile.modem = modem;
        }
        if let Some(position) = self.position.lock().clone() {
            profile.position = Some(position);
        }
        profile
    }

    pub async fn publish_birth(&self, application_ids: &[String]) -> Result<(), CloudError> {
        let payload = self.birth_shaped(application_ids);
        let suffix = self.context.options.topic.birth_suffix.clone();
        self.publish_lifecycle(&suffix, &payload).await
    }

    pub async fn publish_disconnect(&self) -> Result<(), CloudError> {
        let payload = birth::disconnect_payload(&self.profile());
        let suffix = self.context.options.topic.disconnect_suffix.clone();
        self.publish_lifecycle(&suffix, &payload).await
    }

    pub async fn publish_app_list(&self, application_ids: &[String]) -> Result<(), CloudError> {
        let payload = self.birth_shaped(application_ids);
        let suffix = self.context.options.topic.apps_suffix.clone();
        self.publish_lifecycle(&suffix, &payload).await
    }

    fn birth_shaped(&self, application_ids: &[String]) -> Payload {
        let accept_encoding = self
            .context
            .options
            .payload
            .compress
            .then_some(ACCEPTED_COMPRESSION);
        birth::birth_payload(
            &self.profile(),
            &BirthContext {
                application_ids,
                payload_encoding: self.context.codec.name(),
                accept_encoding,
            },
        )
    }

    async fn publish_lifecycle(&self, suffix: &str, payload: &Payload) -> Result<(), CloudError> {
        let lifecycle = &self.context.options.lifecycle;
        if lifecycle.certificates_disabled() {
            debug!("Lifecycle certificates disabled, skipping {}", suffix);
            return Ok(());
        }

        let topic = self
            .context
            .topics
            .lifecycle_topic(self.context.client_id(), suffix);
        let bytes = self.context.codec.encode(payload)?;
        let release_on = if lifecycle.qos.is_confirmed() {
            AckEvent::Confirmed
        } else {
            AckEvent::Published
        };

        let _serialized = self.pending.serialize().await;
        self.pending.begin(&topic, release_on);
        let id = match self
            .context
            .transport
            .publish(&topic, bytes, lifecycle.qos, lifecycle.retain, lifecycle.priority)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                self.pending.reset();
                warn!("Failed to publish lifecycle message on {}: {}", topic, e);
                return Err(e.into());
            }
        };

        info!("Published lifecycle message #{} on {}", id, topic);
        if self
            .pending
            .wait(id, self.context.options.lifecycle_ack_timeout())
            .await
        {
            debug!("Lifecycle message #{} acknowledged", id);
        }
        Ok(())
    }
}
