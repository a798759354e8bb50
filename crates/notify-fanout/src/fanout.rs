//! Default routing from notification channels to connections

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tracing::debug;

use crate::broker::IncomingMessage;
use crate::channel::{ChannelRouter, ChannelScope};
use crate::connection::Payload;
use crate::dispatcher::{handler_fn, HandlerFn};
use crate::manager::ConnectionManager;

/// Handler that delivers each notification according to its channel:
/// user channels to that user's connections, role channels to the role
/// cohort, the system channel to everyone.
///
/// Clients receive the payload exactly as published. Malformed payloads fail
/// the handler; expired notifications are dropped.
pub fn fan_out_handler(router: ChannelRouter, manager: ConnectionManager) -> HandlerFn {
    handler_fn(move |msg: IncomingMessage| {
        let router = router.clone();
        let manager = manager.clone();
        async move {
            let target = router.parse_channel(&msg.channel)?;
            let notification = msg
                .notification()
                .with_context(|| format!("malformed notification on {}", msg.channel))?;

            if notification.is_expired_at(Utc::now()) {
                debug!(id = %notification.id, channel = %msg.channel, "Dropping expired notification");
                return Ok(());
            }

            let payload: Payload = Arc::from(msg.payload);
            let delivered = match target.scope {
                ChannelScope::User => manager.broadcast_to_user(&target.id, payload).await,
                ChannelScope::Role => manager.broadcast_to_role(&target.id, payload).await,
                ChannelScope::System => manager.broadcast_to_all(payload).await,
            };

            debug!(id = %notification.id, channel = %msg.channel, delivered, "Notification fanned out");
            Ok::<(), anyhow::Error>(())
        }
    })
}
