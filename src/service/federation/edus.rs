// =============================================================================
// Nucleon Matrix Federation Server - EDU Dispatch Module
// =============================================================================
//
// Project: Nucleon - High Performance Matrix Federation Server
// Author: Nucleon Development Team
// Date: 2025-10-19
// Version: 0.3.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Routing of ephemeral data units to the EDU and key servers. EDUs do
//   not participate in the per-room serialization; they are dispatched
//   inline while the transaction's PDU tasks run. A malformed EDU is
//   logged and skipped and never aborts the transaction.
//
// =============================================================================

use ruma::{OwnedEventId, OwnedRoomId, OwnedUserId, ServerName, UInt};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue as RawJsonValue;
use std::collections::BTreeMap;
use tracing::{debug, error, warn};

use super::Service;
use crate::metrics::METRICS;
use crate::service::eduserver::{
    CrossSigningKeyUpdate, InputCrossSigningKeyUpdateRequest, InputReceiptEventRequest,
    InputSendToDeviceEventRequest, InputTypingEventRequest,
};
use crate::service::keyserver::{DeviceListUpdateEvent, InputDeviceListUpdateRequest};

/// Typing notices remain valid this long on the receiving side.
const TYPING_TIMEOUT_MS: u64 = 30_000;

/// An ephemeral data unit as carried in a federation transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edu {
    pub edu_type: String,
    pub content: Box<RawJsonValue>,
}

#[derive(Debug, Deserialize)]
struct TypingPayload {
    room_id: OwnedRoomId,
    user_id: OwnedUserId,
    typing: bool,
}

#[derive(Debug, Deserialize)]
struct ToDeviceMessage {
    sender: OwnedUserId,
    #[serde(rename = "type")]
    event_type: String,
    messages: BTreeMap<OwnedUserId, BTreeMap<String, Box<RawJsonValue>>>,
}

#[derive(Debug, Deserialize)]
struct RoomReceipts {
    #[serde(rename = "m.read", default)]
    read: BTreeMap<OwnedUserId, UserReadReceipt>,
}

#[derive(Debug, Deserialize)]
struct UserReadReceipt {
    data: ReceiptData,
    event_ids: Vec<OwnedEventId>,
}

#[derive(Debug, Deserialize)]
struct ReceiptData {
    ts: UInt,
}

impl Service {
    /// Dispatch every EDU of a transaction by type.
    pub(super) async fn process_edus(&self, origin: &ServerName, edus: &[Edu]) {
        for edu in edus {
            METRICS.recv_edus.inc();
            match edu.edu_type.as_str() {
                "m.typing" => self.process_typing_edu(origin, edu).await,
                "m.direct_to_device" => self.process_to_device_edu(edu).await,
                "m.device_list_update" => self.process_device_list_update(edu).await,
                "m.receipt" => self.process_receipt_edu(origin, edu).await,
                "m.signing_key_update" => self.process_signing_key_update(edu).await,
                other => debug!(edu_type = other, "Unhandled EDU"),
            }
        }
    }

    async fn process_typing_edu(&self, origin: &ServerName, edu: &Edu) {
        let payload: TypingPayload = match serde_json::from_str(edu.content.get()) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to unmarshal typing event: {e}");
                return;
            }
        };
        if payload.user_id.server_name() != origin {
            warn!(
                "Dropping typing event where sender domain ({}) doesn't match origin ({origin})",
                payload.user_id.server_name()
            );
            return;
        }
        if let Err(e) = self
            .eduserver
            .input_typing_event(InputTypingEventRequest {
                user_id: payload.user_id,
                room_id: payload.room_id,
                typing: payload.typing,
                timeout_ms: TYPING_TIMEOUT_MS,
            })
            .await
        {
            error!("Failed to send typing event to edu server: {e}");
        }
    }

    async fn process_to_device_edu(&self, edu: &Edu) {
        let payload: ToDeviceMessage = match serde_json::from_str(edu.content.get()) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to unmarshal send-to-device events: {e}");
                return;
            }
        };
        for (user_id, by_user) in &payload.messages {
            for (device_id, message) in by_user {
                // TODO: check that the user and the device actually exist here
                if let Err(e) = self
                    .eduserver
                    .input_send_to_device_event(InputSendToDeviceEventRequest {
                        sender: payload.sender.clone(),
                        user_id: user_id.clone(),
                        device_id: device_id.clone(),
                        event_type: payload.event_type.clone(),
                        message: message.clone(),
                    })
                    .await
                {
                    error!(
                        sender = %payload.sender,
                        user_id = %user_id,
                        device_id = %device_id,
                        "Failed to send send-to-device event to edu server: {e}"
                    );
                }
            }
        }
    }

    async fn process_device_list_update(&self, edu: &Edu) {
        let payload: DeviceListUpdateEvent = match serde_json::from_str(edu.content.get()) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to unmarshal device list update event: {e}");
                return;
            }
        };
        let user_id = payload.user_id.clone();
        match self
            .keyserver
            .input_device_list_update(InputDeviceListUpdateRequest { event: payload })
            .await
        {
            Ok(response) => {
                if let Some(e) = response.error {
                    error!(user_id = %user_id, "failed to InputDeviceListUpdate: {e}");
                }
            }
            Err(e) => error!(user_id = %user_id, "failed to InputDeviceListUpdate: {e}"),
        }
    }

    async fn process_receipt_edu(&self, origin: &ServerName, edu: &Edu) {
        let payload: BTreeMap<OwnedRoomId, RoomReceipts> =
            match serde_json::from_str(edu.content.get()) {
                Ok(payload) => payload,
                Err(e) => {
                    error!("Failed to unmarshal receipt event: {e}");
                    return;
                }
            };

        for (room_id, receipts) in payload {
            for (user_id, mread) in receipts.read {
                if user_id.server_name() != origin {
                    warn!(
                        "Dropping receipt event where sender domain ({}) doesn't match origin ({origin})",
                        user_id.server_name()
                    );
                    continue;
                }
                if let Err(e) = self
                    .process_receipt_event(&user_id, &room_id, mread.data.ts, &mread.event_ids)
                    .await
                {
                    error!(
                        sender = %origin,
                        user_id = %user_id,
                        room_id = %room_id,
                        "Failed to send receipt event to edu server: {e}"
                    );
                }
            }
        }
    }

    /// Submit one read receipt per referenced event.
    async fn process_receipt_event(
        &self,
        user_id: &OwnedUserId,
        room_id: &OwnedRoomId,
        timestamp: UInt,
        event_ids: &[OwnedEventId],
    ) -> crate::Result<()> {
        for event_id in event_ids {
            self.eduserver
                .input_receipt_event(InputReceiptEventRequest {
                    user_id: user_id.clone(),
                    room_id: room_id.clone(),
                    event_id: event_id.clone(),
                    receipt_type: "m.read".to_owned(),
                    timestamp,
                })
                .await?;
        }
        Ok(())
    }

    async fn process_signing_key_update(&self, edu: &Edu) {
        let payload: CrossSigningKeyUpdate = match serde_json::from_str(edu.content.get()) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to unmarshal cross-signing update: {e}");
                return;
            }
        };
        if let Err(e) = self
            .eduserver
            .input_cross_signing_key_update(InputCrossSigningKeyUpdateRequest { update: payload })
            .await
        {
            error!("Failed to send signing key update to edu server: {e}");
        }
    }
}
