// =============================================================================
// Nucleon Matrix Federation Server - Federation Transaction Module
// =============================================================================
//
// Project: Nucleon - High Performance Matrix Federation Server
// Author: Nucleon Development Team
// Date: 2025-10-19
// Version: 0.3.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   The federation transaction ingress core. Remote servers deliver
//   batches of PDUs and EDUs via signed transaction requests; this
//   service deduplicates retransmissions, validates and parses each
//   event, serializes per-room work through lazily spawned workers,
//   dispatches ephemerals to the EDU and key servers and aggregates a
//   per-PDU result map for the wire response.
//
// =============================================================================

pub mod edus;
pub mod inflight;
pub mod queue;

pub use edus::Edu;

use ruma::{
    OwnedEventId, OwnedRoomId, OwnedServerName, OwnedTransactionId, ServerName, TransactionId,
};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue as RawJsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::{
    METRICS, METRICS_OUTCOME_FAIL, METRICS_OUTCOME_OK, METRICS_OUTCOME_REJECTED,
    METRICS_WORK_DIRECT,
};
use crate::service::eduserver::EduServerApi;
use crate::service::keyserver::{KeyServerApi, VerifyEventRequest};
use crate::service::pdu::{self, HeaderedPdu};
use crate::service::roomserver::{
    InputKind, InputRoomEvent, InputRoomEventsRequest, QueryRoomVersionForRoomRequest,
    QueryServerBannedFromRoomRequest, RoomserverApi,
};
use crate::{Error, Result};

use inflight::{FollowerOutcome, InflightTxns, TxnAdmission};
use queue::{InputTask, RoomWorker, RoomWorkers, TaskOutcome};

/// Transactions are limited in size; they can have at most 50 PDUs and
/// 100 EDUs.
/// https://spec.matrix.org/latest/server-server-api/#transactions
const MAX_PDUS_PER_TXN: usize = 50;
const MAX_EDUS_PER_TXN: usize = 100;

/// Once an event starts processing it gets this long, detached from the
/// originating request.
const PROCESS_EVENT_TIMEOUT: Duration = Duration::from_secs(300);

/// The result record for one PDU. An empty record means success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PduProcessResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The body of a 200 response to `/send`: one record per processed PDU,
/// returned wholesale regardless of individual failures.
#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionResults {
    pub pdus: BTreeMap<OwnedEventId, PduProcessResult>,
}

/// Outcome of one inbound `/send` request, mapped to the wire by the
/// route handler.
#[derive(Debug)]
pub enum TxnOutcome {
    /// HTTP 200 with the result map.
    Processed(Arc<TransactionResults>),
    /// HTTP 202: the leader ended without producing a response.
    Accepted,
    /// HTTP 408: gave up waiting on the leader.
    TimedOut,
    /// HTTP 400: envelope-level protocol violation.
    Rejected(Error),
}

/// The decoded transaction envelope.
#[derive(Debug, Deserialize)]
struct TransactionEvents {
    #[serde(default)]
    pdus: Vec<Box<RawJsonValue>>,
    #[serde(default)]
    edus: Vec<Edu>,
}

/// The federation transaction ingress service.
pub struct Service {
    server_name: OwnedServerName,
    inflight: InflightTxns,
    workers: RoomWorkers,
    pub roomserver: Arc<dyn RoomserverApi>,
    pub eduserver: Arc<dyn EduServerApi>,
    pub keyserver: Arc<dyn KeyServerApi>,
}

impl Service {
    pub fn build(
        server_name: OwnedServerName,
        roomserver: Arc<dyn RoomserverApi>,
        eduserver: Arc<dyn EduServerApi>,
        keyserver: Arc<dyn KeyServerApi>,
    ) -> Arc<Self> {
        Arc::new(Self {
            server_name,
            inflight: InflightTxns::new(),
            workers: RoomWorkers::new(),
            roomserver,
            eduserver,
            keyserver,
        })
    }

    /// Handle one `/send` submission.
    ///
    /// If this origin already submitted this transaction ID and the work is
    /// still taking place, the caller attaches to it instead of processing
    /// again. The leader's work runs on a detached task: once admitted, a
    /// transaction always runs to completion so its result can be served to
    /// retries, even if the submitting connection goes away.
    pub async fn receive_transaction(
        self: &Arc<Self>,
        origin: OwnedServerName,
        txn_id: OwnedTransactionId,
        body: Vec<u8>,
        cancelled: CancellationToken,
    ) -> TxnOutcome {
        match self.inflight.admit(&origin, &txn_id) {
            TxnAdmission::Follower(rx) => match inflight::await_leader(rx).await {
                FollowerOutcome::Result(results) => TxnOutcome::Processed(results),
                FollowerOutcome::Ended => TxnOutcome::Accepted,
                FollowerOutcome::TimedOut => TxnOutcome::TimedOut,
            },
            TxnAdmission::Leader(guard) => {
                let service = Arc::clone(self);
                let task = tokio::spawn(async move {
                    let outcome = service
                        .run_leader(&origin, &txn_id, &body, cancelled)
                        .await;
                    if let TxnOutcome::Processed(results) = &outcome {
                        guard.publish(Arc::clone(results));
                    }
                    outcome
                });
                match task.await {
                    Ok(outcome) => outcome,
                    Err(e) => TxnOutcome::Rejected(Error::BadServerResponse(format!(
                        "transaction task failed: {e}"
                    ))),
                }
            }
        }
    }

    async fn run_leader(
        self: &Arc<Self>,
        origin: &ServerName,
        txn_id: &TransactionId,
        body: &[u8],
        cancelled: CancellationToken,
    ) -> TxnOutcome {
        let events: TransactionEvents = match serde_json::from_slice(body) {
            Ok(events) => events,
            Err(e) => {
                return TxnOutcome::Rejected(Error::NotJson(format!(
                    "The request body could not be decoded into valid JSON. {e}"
                )))
            }
        };

        if events.pdus.len() > MAX_PDUS_PER_TXN || events.edus.len() > MAX_EDUS_PER_TXN {
            return TxnOutcome::Rejected(Error::BadJson("max 50 pdus / 100 edus".to_owned()));
        }

        info!(
            "Received transaction {txn_id:?} from {origin:?} for {:?} containing {} PDUs, {} EDUs",
            self.server_name,
            events.pdus.len(),
            events.edus.len()
        );

        match self
            .process_transaction(origin, &events.pdus, &events.edus, cancelled)
            .await
        {
            Ok(results) => TxnOutcome::Processed(Arc::new(results)),
            Err(e) => {
                warn!("Transaction {txn_id:?} from {origin:?} failed: {e}");
                TxnOutcome::Rejected(e)
            }
        }
    }

    async fn process_transaction(
        self: &Arc<Self>,
        origin: &ServerName,
        pdus: &[Box<RawJsonValue>],
        edus: &[Edu],
        cancelled: CancellationToken,
    ) -> Result<TransactionResults> {
        let mut results = BTreeMap::new();
        let mut tasks: Vec<(OwnedEventId, oneshot::Receiver<TaskOutcome>)> = Vec::new();

        for raw_pdu in pdus {
            METRICS.recv_pdus.with_label_values(&["total"]).inc();

            #[derive(Deserialize)]
            struct EventHeader {
                room_id: OwnedRoomId,
            }
            // We don't know the event ID at this point, so failures here
            // cannot appear in the PDU results.
            let header: EventHeader = match serde_json::from_str(raw_pdu.get()) {
                Ok(header) => header,
                Err(e) => {
                    warn!("Transaction: Failed to extract room ID from event: {e}");
                    continue;
                }
            };

            let room_version = match self
                .roomserver
                .query_room_version_for_room(QueryRoomVersionForRoomRequest {
                    room_id: header.room_id.clone(),
                })
                .await
            {
                Ok(response) => response.room_version,
                Err(e) => {
                    warn!(
                        room_id = %header.room_id,
                        "Transaction: Failed to query room version for room: {e}"
                    );
                    continue;
                }
            };

            let object = match pdu::to_canonical_object(raw_pdu) {
                Ok(object) => object,
                Err(_) => {
                    // Room version 6 states that homeservers should strictly
                    // enforce canonical JSON on PDUs. A single bad PDU rejects
                    // the entire transaction.
                    return Err(Error::BadJson("PDU contains bad JSON".to_owned()));
                }
            };

            let event = match pdu::parse_incoming_pdu(&object, room_version) {
                Ok(event) => event,
                Err(e) => {
                    warn!(
                        "Transaction: Failed to parse event JSON of event {}: {e}",
                        raw_pdu.get()
                    );
                    continue;
                }
            };
            let event_id = event.pdu.event_id.clone();

            match self
                .roomserver
                .query_server_banned_from_room(QueryServerBannedFromRoomRequest {
                    server_name: origin.to_owned(),
                    room_id: event.pdu.room_id.clone(),
                })
                .await
            {
                Ok(response) if response.banned => {
                    results.insert(
                        event_id,
                        PduProcessResult {
                            error: Some("Forbidden by server ACLs".to_owned()),
                        },
                    );
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        room_id = %event.pdu.room_id,
                        "Transaction: Failed to check server ACLs for room: {e}"
                    );
                }
            }

            match self
                .keyserver
                .verify_event(VerifyEventRequest {
                    origin: origin.to_owned(),
                    room_version: event.room_version.clone(),
                    event: event.json.clone(),
                })
                .await
            {
                Ok(response) => {
                    if let Some(verify_error) = response.error {
                        warn!(
                            event_id = %event_id,
                            "Transaction: Couldn't validate signature of event: {verify_error}"
                        );
                        results.insert(
                            event_id,
                            PduProcessResult {
                                error: Some(verify_error),
                            },
                        );
                        continue;
                    }
                }
                Err(e) => {
                    warn!(
                        event_id = %event_id,
                        "Transaction: Couldn't validate signature of event: {e}"
                    );
                    results.insert(
                        event_id,
                        PduProcessResult {
                            error: Some(e.to_string()),
                        },
                    );
                    continue;
                }
            }

            let worker = self.workers.get_or_create(&event.pdu.room_id);
            let (done, completion) = oneshot::channel();
            tasks.push((event_id, completion));
            worker.push(InputTask {
                origin: origin.to_owned(),
                event,
                cancelled: cancelled.child_token(),
                done,
            });
            if worker.try_claim() {
                tokio::spawn(run_worker(Arc::clone(self), worker));
            }
        }

        self.process_edus(origin, edus).await;

        for (event_id, completion) in tasks {
            match completion.await {
                Ok(outcome) if outcome.err.is_some() => {
                    results.insert(
                        event_id,
                        PduProcessResult {
                            // TODO: surface the task error string once remote
                            // retry behaviour tolerates non-empty records here
                            error: None,
                        },
                    );
                }
                _ => {
                    results.insert(event_id, PduProcessResult::default());
                }
            }
        }

        if !results.is_empty() {
            debug!(
                "Processed {} PDUs from {origin:?} in transaction",
                results.len()
            );
        }
        Ok(TransactionResults { pdus: results })
    }

    /// Execute one dequeued task: honor a pre-start cancellation, then run
    /// the event under a fresh deadline and record the outcome.
    async fn run_task(&self, task: InputTask) {
        if task.cancelled.is_cancelled() {
            METRICS.recv_pdus.with_label_values(&["expired"]).inc();
            let _ = task.done.send(TaskOutcome {
                err: Some(Error::RequestExpired),
                duration: Duration::ZERO,
            });
            return;
        }

        let start = Instant::now();
        // TODO: Is 5 minutes too long?
        let result = match tokio::time::timeout(
            PROCESS_EVENT_TIMEOUT,
            self.process_event(&task.origin, &task.event),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::ProcessingDeadlineExceeded),
        };
        let duration = start.elapsed();
        let micros = duration.as_micros() as f64;

        let err = match result {
            Ok(()) => {
                METRICS.recv_pdus.with_label_values(&["success"]).inc();
                METRICS
                    .process_event
                    .with_label_values(&[METRICS_WORK_DIRECT, METRICS_OUTCOME_OK])
                    .observe(micros);
                None
            }
            Err(Error::EventNotAllowed(reason)) => {
                METRICS
                    .process_event
                    .with_label_values(&[METRICS_WORK_DIRECT, METRICS_OUTCOME_REJECTED])
                    .observe(micros);
                warn!(
                    event_id = %task.event.pdu.event_id,
                    rejected = true,
                    "Failed to process incoming federation event, skipping: {reason}"
                );
                // Rejected failures stay silent.
                None
            }
            Err(e) => {
                METRICS
                    .process_event
                    .with_label_values(&[METRICS_WORK_DIRECT, METRICS_OUTCOME_FAIL])
                    .observe(micros);
                warn!(
                    event_id = %task.event.pdu.event_id,
                    rejected = false,
                    "Failed to process incoming federation event, skipping: {e}"
                );
                Some(e)
            }
        };

        let _ = task.done.send(TaskOutcome { err, duration });
    }

    /// Pass the event to the roomserver, which does the auth checks. No
    /// prev/auth-event recovery happens here; an auth rejection comes back
    /// as [`Error::EventNotAllowed`] for the worker to discard silently.
    async fn process_event(&self, origin: &ServerName, event: &HeaderedPdu) -> Result<()> {
        let response = self
            .roomserver
            .input_room_events(InputRoomEventsRequest {
                input_room_events: vec![InputRoomEvent {
                    kind: InputKind::New,
                    room_version: event.room_version.clone(),
                    event: event.json.clone(),
                    origin: origin.to_owned(),
                    send_to_other_servers: false,
                }],
            })
            .await?;

        if response.not_allowed {
            return Err(Error::EventNotAllowed(
                response
                    .error_msg
                    .unwrap_or_else(|| "event failed auth checks".to_owned()),
            ));
        }
        if let Some(error_msg) = response.error_msg {
            return Err(Error::BadServerResponse(error_msg));
        }
        Ok(())
    }
}

/// Drain one room's queue until it is observed empty, then exit. The park
/// in [`RoomWorker::next_task`] hands the respawn duty to the next
/// producer.
async fn run_worker(service: Arc<Service>, worker: Arc<RoomWorker>) {
    loop {
        let Some(task) = worker.next_task() else {
            return;
        };
        service.run_task(task).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::eduserver::{
        EduServerApi, InputCrossSigningKeyUpdateRequest, InputCrossSigningKeyUpdateResponse,
        InputReceiptEventRequest, InputReceiptEventResponse, InputSendToDeviceEventRequest,
        InputSendToDeviceEventResponse, InputTypingEventRequest, InputTypingEventResponse,
    };
    use crate::service::keyserver::{
        InputDeviceListUpdateRequest, InputDeviceListUpdateResponse, VerifyEventResponse,
    };
    use crate::service::roomserver::{
        InputRoomEventsResponse, QueryRoomVersionForRoomResponse,
        QueryServerBannedFromRoomResponse,
    };
    use async_trait::async_trait;
    use ruma::{server_name, RoomVersionId};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct MockRoomserver {
        /// Content-body markers of events given to input_room_events, in
        /// arrival order.
        submitted: StdMutex<Vec<String>>,
        input_calls: AtomicUsize,
        version_calls: AtomicUsize,
        banned_servers: StdMutex<Vec<String>>,
        /// When set, input_room_events blocks until released.
        gate: Option<Arc<Notify>>,
        reject_all: bool,
    }

    impl MockRoomserver {
        fn submitted(&self) -> Vec<String> {
            self.submitted.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RoomserverApi for MockRoomserver {
        async fn query_room_version_for_room(
            &self,
            _request: QueryRoomVersionForRoomRequest,
        ) -> Result<QueryRoomVersionForRoomResponse> {
            self.version_calls.fetch_add(1, Ordering::SeqCst);
            Ok(QueryRoomVersionForRoomResponse {
                room_version: RoomVersionId::V10,
            })
        }

        async fn query_server_banned_from_room(
            &self,
            request: QueryServerBannedFromRoomRequest,
        ) -> Result<QueryServerBannedFromRoomResponse> {
            let banned = self
                .banned_servers
                .lock()
                .unwrap()
                .contains(&request.server_name.as_str().to_owned());
            Ok(QueryServerBannedFromRoomResponse { banned })
        }

        async fn input_room_events(
            &self,
            request: InputRoomEventsRequest,
        ) -> Result<InputRoomEventsResponse> {
            self.input_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            for event in &request.input_room_events {
                let value: serde_json::Value =
                    serde_json::from_str(event.event.get()).expect("event json");
                let marker = value["content"]["body"]
                    .as_str()
                    .unwrap_or_default()
                    .to_owned();
                self.submitted.lock().unwrap().push(marker);
            }
            if self.reject_all {
                return Ok(InputRoomEventsResponse {
                    error_msg: Some("not allowed by auth rules".to_owned()),
                    not_allowed: true,
                });
            }
            Ok(InputRoomEventsResponse::default())
        }
    }

    #[derive(Default)]
    struct MockEduServer {
        typing: StdMutex<Vec<InputTypingEventRequest>>,
        receipts: StdMutex<Vec<InputReceiptEventRequest>>,
        to_device: StdMutex<Vec<InputSendToDeviceEventRequest>>,
        cross_signing: AtomicUsize,
    }

    #[async_trait]
    impl EduServerApi for MockEduServer {
        async fn input_typing_event(
            &self,
            request: InputTypingEventRequest,
        ) -> Result<InputTypingEventResponse> {
            self.typing.lock().unwrap().push(request);
            Ok(InputTypingEventResponse::default())
        }

        async fn input_send_to_device_event(
            &self,
            request: InputSendToDeviceEventRequest,
        ) -> Result<InputSendToDeviceEventResponse> {
            self.to_device.lock().unwrap().push(request);
            Ok(InputSendToDeviceEventResponse::default())
        }

        async fn input_receipt_event(
            &self,
            request: InputReceiptEventRequest,
        ) -> Result<InputReceiptEventResponse> {
            self.receipts.lock().unwrap().push(request);
            Ok(InputReceiptEventResponse::default())
        }

        async fn input_cross_signing_key_update(
            &self,
            _request: InputCrossSigningKeyUpdateRequest,
        ) -> Result<InputCrossSigningKeyUpdateResponse> {
            self.cross_signing.fetch_add(1, Ordering::SeqCst);
            Ok(InputCrossSigningKeyUpdateResponse::default())
        }
    }

    #[derive(Default)]
    struct MockKeyServer {
        /// Senders whose events fail verification.
        bad_signers: StdMutex<Vec<String>>,
        device_list_updates: AtomicUsize,
    }

    #[async_trait]
    impl KeyServerApi for MockKeyServer {
        async fn verify_event(&self, request: VerifyEventRequest) -> Result<VerifyEventResponse> {
            let value: serde_json::Value =
                serde_json::from_str(request.event.get()).expect("event json");
            let sender = value["sender"].as_str().unwrap_or_default();
            let failed = self
                .bad_signers
                .lock()
                .unwrap()
                .iter()
                .any(|s| s == sender);
            Ok(VerifyEventResponse {
                error: failed.then(|| format!("no valid signature from {sender}")),
            })
        }

        async fn input_device_list_update(
            &self,
            _request: InputDeviceListUpdateRequest,
        ) -> Result<InputDeviceListUpdateResponse> {
            self.device_list_updates.fetch_add(1, Ordering::SeqCst);
            Ok(InputDeviceListUpdateResponse::default())
        }
    }

    struct TestHarness {
        service: Arc<Service>,
        roomserver: Arc<MockRoomserver>,
        eduserver: Arc<MockEduServer>,
        keyserver: Arc<MockKeyServer>,
    }

    fn harness_with(roomserver: MockRoomserver, keyserver: MockKeyServer) -> TestHarness {
        let roomserver = Arc::new(roomserver);
        let eduserver = Arc::new(MockEduServer::default());
        let keyserver = Arc::new(keyserver);
        let service = Service::build(
            server_name!("nucleon.example").to_owned(),
            roomserver.clone(),
            eduserver.clone(),
            keyserver.clone(),
        );
        TestHarness {
            service,
            roomserver,
            eduserver,
            keyserver,
        }
    }

    fn harness() -> TestHarness {
        harness_with(MockRoomserver::default(), MockKeyServer::default())
    }

    fn pdu(room: &str, sender: &str, marker: &str) -> serde_json::Value {
        serde_json::json!({
            "room_id": room,
            "sender": sender,
            "type": "m.room.message",
            "origin_server_ts": 1_700_000_000_000u64,
            "content": { "body": marker },
        })
    }

    fn txn_body(pdus: Vec<serde_json::Value>, edus: Vec<serde_json::Value>) -> Vec<u8> {
        serde_json::json!({ "pdus": pdus, "edus": edus })
            .to_string()
            .into_bytes()
    }

    async fn send(
        harness: &TestHarness,
        origin: &str,
        txn_id: &str,
        body: Vec<u8>,
    ) -> TxnOutcome {
        harness
            .service
            .receive_transaction(
                origin.try_into().expect("server name"),
                txn_id.into(),
                body,
                CancellationToken::new(),
            )
            .await
    }

    #[tokio::test]
    async fn test_empty_transaction_yields_empty_result_map() {
        let harness = harness();
        match send(&harness, "remote.example", "t-empty", txn_body(vec![], vec![])).await {
            TxnOutcome::Processed(results) => assert!(results.pdus.is_empty()),
            other => panic!("expected Processed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_oversized_transaction_is_rejected() {
        let harness = harness();
        let pdus: Vec<_> = (0..51)
            .map(|i| pdu("!a:remote.example", "@alice:remote.example", &format!("m{i}")))
            .collect();
        match send(&harness, "remote.example", "t-big", txn_body(pdus, vec![])).await {
            TxnOutcome::Rejected(Error::BadJson(msg)) => {
                assert_eq!(msg, "max 50 pdus / 100 edus")
            }
            other => panic!("expected BadJson rejection, got {other:?}"),
        }
        assert_eq!(harness.roomserver.version_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_garbage_body_is_not_json() {
        let harness = harness();
        match send(&harness, "remote.example", "t-garbage", b"not json".to_vec()).await {
            TxnOutcome::Rejected(Error::NotJson(_)) => {}
            other => panic!("expected NotJson rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_successful_pdu_flows_to_roomserver() {
        let harness = harness();
        let body = txn_body(
            vec![pdu("!a:remote.example", "@alice:remote.example", "hello")],
            vec![],
        );
        match send(&harness, "remote.example", "t-ok", body).await {
            TxnOutcome::Processed(results) => {
                assert_eq!(results.pdus.len(), 1);
                let record = results.pdus.values().next().expect("one record");
                assert!(record.error.is_none());
            }
            other => panic!("expected Processed, got {other:?}"),
        }
        assert_eq!(harness.roomserver.submitted(), ["hello"]);
    }

    #[tokio::test]
    async fn test_per_room_fifo_order_is_preserved() {
        let harness = harness();
        let body = txn_body(
            vec![
                pdu("!ordered:remote.example", "@alice:remote.example", "first"),
                pdu("!ordered:remote.example", "@alice:remote.example", "second"),
            ],
            vec![],
        );
        match send(&harness, "remote.example", "t-order", body).await {
            TxnOutcome::Processed(results) => assert_eq!(results.pdus.len(), 2),
            other => panic!("expected Processed, got {other:?}"),
        }
        assert_eq!(harness.roomserver.submitted(), ["first", "second"]);
    }

    #[tokio::test]
    async fn test_acl_banned_origin_is_reported_and_never_submitted() {
        let roomserver = MockRoomserver {
            banned_servers: StdMutex::new(vec!["banned.example".to_owned()]),
            ..Default::default()
        };
        let harness = harness_with(roomserver, MockKeyServer::default());
        let body = txn_body(
            vec![pdu("!acl:remote.example", "@eve:banned.example", "blocked")],
            vec![],
        );
        match send(&harness, "banned.example", "t-acl", body).await {
            TxnOutcome::Processed(results) => {
                let record = results.pdus.values().next().expect("one record");
                assert_eq!(record.error.as_deref(), Some("Forbidden by server ACLs"));
            }
            other => panic!("expected Processed, got {other:?}"),
        }
        assert_eq!(
            harness.roomserver.input_calls.load(Ordering::SeqCst),
            0,
            "banned events must never reach the roomserver"
        );
    }

    #[tokio::test]
    async fn test_bad_signature_is_reported_and_never_submitted() {
        let keyserver = MockKeyServer {
            bad_signers: StdMutex::new(vec!["@mallory:remote.example".to_owned()]),
            ..Default::default()
        };
        let harness = harness_with(MockRoomserver::default(), keyserver);
        let body = txn_body(
            vec![pdu("!sig:remote.example", "@mallory:remote.example", "forged")],
            vec![],
        );
        match send(&harness, "remote.example", "t-sig", body).await {
            TxnOutcome::Processed(results) => {
                let record = results.pdus.values().next().expect("one record");
                let error = record.error.as_deref().expect("a verification error");
                assert!(error.contains("@mallory:remote.example"));
            }
            other => panic!("expected Processed, got {other:?}"),
        }
        assert_eq!(harness.roomserver.input_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rejected_events_are_silently_discarded() {
        let roomserver = MockRoomserver {
            reject_all: true,
            ..Default::default()
        };
        let harness = harness_with(roomserver, MockKeyServer::default());
        let body = txn_body(
            vec![pdu("!rej:remote.example", "@alice:remote.example", "nope")],
            vec![],
        );
        match send(&harness, "remote.example", "t-rej", body).await {
            TxnOutcome::Processed(results) => {
                let record = results.pdus.values().next().expect("one record");
                assert!(
                    record.error.is_none(),
                    "auth rejections must not surface an error"
                );
            }
            other => panic!("expected Processed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bad_canonical_json_aborts_whole_transaction() {
        let harness = harness();
        let mut bad = pdu("!bad:remote.example", "@alice:remote.example", "x");
        bad["content"] = serde_json::json!({ "weight": 2.5 });
        let body = txn_body(
            vec![
                pdu("!bad:remote.example", "@alice:remote.example", "fine"),
                bad,
            ],
            vec![],
        );
        match send(&harness, "remote.example", "t-canon", body).await {
            TxnOutcome::Rejected(Error::BadJson(msg)) => {
                assert_eq!(msg, "PDU contains bad JSON")
            }
            other => panic!("expected BadJson rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unparseable_pdu_is_skipped_without_result_entry() {
        let harness = harness();
        // Valid canonical JSON, but missing the sender field.
        let body = txn_body(
            vec![
                serde_json::json!({
                    "room_id": "!skip:remote.example",
                    "type": "m.room.message",
                    "origin_server_ts": 1_700_000_000_000u64,
                    "content": {},
                }),
                pdu("!skip:remote.example", "@alice:remote.example", "kept"),
            ],
            vec![],
        );
        match send(&harness, "remote.example", "t-skip", body).await {
            TxnOutcome::Processed(results) => {
                assert_eq!(results.pdus.len(), 1, "only the parseable PDU has a record");
            }
            other => panic!("expected Processed, got {other:?}"),
        }
        assert_eq!(harness.roomserver.submitted(), ["kept"]);
    }

    #[tokio::test]
    async fn test_concurrent_retransmission_processes_once() {
        let gate = Arc::new(Notify::new());
        let roomserver = MockRoomserver {
            gate: Some(gate.clone()),
            ..Default::default()
        };
        let harness = harness_with(roomserver, MockKeyServer::default());

        let body = txn_body(
            vec![pdu("!dedup:remote.example", "@alice:remote.example", "once")],
            vec![],
        );

        let service = harness.service.clone();
        let first_body = body.clone();
        let first = tokio::spawn(async move {
            service
                .receive_transaction(
                    "remote.example".try_into().expect("server name"),
                    "t-dedup".into(),
                    first_body,
                    CancellationToken::new(),
                )
                .await
        });

        // Wait until the leader is parked inside the roomserver call, then
        // attach a second submission of the same transaction.
        while harness.roomserver.input_calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let second = {
            let service = harness.service.clone();
            let body = body.clone();
            tokio::spawn(async move {
                service
                    .receive_transaction(
                        "remote.example".try_into().expect("server name"),
                        "t-dedup".into(),
                        body,
                        CancellationToken::new(),
                    )
                    .await
            })
        };

        // Let the follower reach its wait, then release the leader.
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.notify_waiters();

        let first = first.await.expect("leader task");
        let second = second.await.expect("follower task");

        let (TxnOutcome::Processed(a), TxnOutcome::Processed(b)) = (first, second) else {
            panic!("both submissions must observe the processed result");
        };
        assert_eq!(*a, *b, "leader and follower bodies must match");
        assert_eq!(
            harness.roomserver.input_calls.load(Ordering::SeqCst),
            1,
            "the processor must run exactly once"
        );
    }

    #[tokio::test]
    async fn test_cancelled_request_expires_queued_tasks() {
        let harness = harness();
        let cancelled = CancellationToken::new();
        cancelled.cancel();

        let body = txn_body(
            vec![pdu("!exp:remote.example", "@alice:remote.example", "late")],
            vec![],
        );
        let outcome = harness
            .service
            .receive_transaction(
                "remote.example".try_into().expect("server name"),
                "t-exp".into(),
                body,
                cancelled,
            )
            .await;

        match outcome {
            TxnOutcome::Processed(results) => {
                assert_eq!(results.pdus.len(), 1, "expired tasks still get a record");
            }
            other => panic!("expected Processed, got {other:?}"),
        }
        assert_eq!(
            harness.roomserver.input_calls.load(Ordering::SeqCst),
            0,
            "expired tasks must not reach the roomserver"
        );
    }

    #[tokio::test]
    async fn test_typing_edu_with_foreign_sender_is_dropped() {
        let harness = harness();
        let edus = vec![
            serde_json::json!({
                "edu_type": "m.typing",
                "content": {
                    "room_id": "!a:remote.example",
                    "user_id": "@alice:remote.example",
                    "typing": true,
                }
            }),
            serde_json::json!({
                "edu_type": "m.typing",
                "content": {
                    "room_id": "!a:remote.example",
                    "user_id": "@impostor:other.example",
                    "typing": true,
                }
            }),
        ];
        match send(&harness, "remote.example", "t-typing", txn_body(vec![], edus)).await {
            TxnOutcome::Processed(_) => {}
            other => panic!("expected Processed, got {other:?}"),
        }
        let typing = harness.eduserver.typing.lock().unwrap();
        assert_eq!(typing.len(), 1, "only the origin's own user may type");
        assert_eq!(typing[0].user_id.as_str(), "@alice:remote.example");
        assert_eq!(typing[0].timeout_ms, 30_000);
    }

    #[tokio::test]
    async fn test_receipt_edu_fans_out_per_event_and_checks_origin() {
        let harness = harness();
        let edus = vec![serde_json::json!({
            "edu_type": "m.receipt",
            "content": {
                "!a:remote.example": {
                    "m.read": {
                        "@alice:remote.example": {
                            "data": { "ts": 1_700_000_000_123u64 },
                            "event_ids": ["$one", "$two"],
                        },
                        "@impostor:other.example": {
                            "data": { "ts": 1_700_000_000_456u64 },
                            "event_ids": ["$three"],
                        },
                    }
                }
            }
        })];
        match send(&harness, "remote.example", "t-receipt", txn_body(vec![], edus)).await {
            TxnOutcome::Processed(_) => {}
            other => panic!("expected Processed, got {other:?}"),
        }
        let receipts = harness.eduserver.receipts.lock().unwrap();
        assert_eq!(receipts.len(), 2, "one receipt per event, impostor dropped");
        assert!(receipts
            .iter()
            .all(|r| r.user_id.as_str() == "@alice:remote.example"));
    }

    #[tokio::test]
    async fn test_to_device_and_key_edus_are_forwarded() {
        let harness = harness();
        let edus = vec![
            serde_json::json!({
                "edu_type": "m.direct_to_device",
                "content": {
                    "sender": "@alice:remote.example",
                    "type": "m.room_key_request",
                    "message_id": "m1",
                    "messages": {
                        "@bob:nucleon.example": {
                            "DEVICE1": { "action": "request" },
                            "DEVICE2": { "action": "request" },
                        }
                    }
                }
            }),
            serde_json::json!({
                "edu_type": "m.device_list_update",
                "content": {
                    "user_id": "@alice:remote.example",
                    "device_id": "DEVICE9",
                    "stream_id": 7,
                }
            }),
            serde_json::json!({
                "edu_type": "m.signing_key_update",
                "content": { "user_id": "@alice:remote.example" }
            }),
            serde_json::json!({
                "edu_type": "m.presence",
                "content": { "push": [] }
            }),
        ];
        match send(&harness, "remote.example", "t-edus", txn_body(vec![], edus)).await {
            TxnOutcome::Processed(_) => {}
            other => panic!("expected Processed, got {other:?}"),
        }
        assert_eq!(harness.eduserver.to_device.lock().unwrap().len(), 2);
        assert_eq!(
            harness.keyserver.device_list_updates.load(Ordering::SeqCst),
            1
        );
        assert_eq!(harness.eduserver.cross_signing.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_edu_content_never_aborts() {
        let harness = harness();
        let edus = vec![
            serde_json::json!({ "edu_type": "m.typing", "content": { "typing": "yes" } }),
            serde_json::json!({
                "edu_type": "m.typing",
                "content": {
                    "room_id": "!a:remote.example",
                    "user_id": "@alice:remote.example",
                    "typing": false,
                }
            }),
        ];
        match send(&harness, "remote.example", "t-bad-edu", txn_body(vec![], edus)).await {
            TxnOutcome::Processed(results) => assert!(results.pdus.is_empty()),
            other => panic!("expected Processed, got {other:?}"),
        }
        assert_eq!(
            harness.eduserver.typing.lock().unwrap().len(),
            1,
            "the well-formed EDU after the malformed one is still dispatched"
        );
    }

    #[tokio::test]
    async fn test_replay_after_completion_processes_again_with_same_results() {
        let harness = harness();
        let body = txn_body(
            vec![pdu("!replay:remote.example", "@alice:remote.example", "again")],
            vec![],
        );
        let first = send(&harness, "remote.example", "t-replay", body.clone()).await;
        let second = send(&harness, "remote.example", "t-replay", body).await;
        let (TxnOutcome::Processed(a), TxnOutcome::Processed(b)) = (first, second) else {
            panic!("both replays must process");
        };
        assert_eq!(*a, *b, "replaying an identical transaction is idempotent");
        assert_eq!(harness.roomserver.input_calls.load(Ordering::SeqCst), 2);
    }
}
