use crate::config::ParcelConfig;
use crate::ids::{DeviceId, MessageId};
use crate::message_dispatcher::MessageDispatcher;
use crate::parcel::{split_into_parcels, CompressionAlgorithm};
use crate::parcel_sink::ParcelSink;
use crate::receipt::{Receipt, ReceiptStatus};
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, trace, warn};

/// One queued application message, bound for a single target device.
///
/// Parcels are derived deterministically from the payload when the message is
///  sent, so retransmission always works with a byte-identical parcel set.
pub struct OutgoingMessage {
    pub target_device_id: DeviceId,
    pub msg_id: MessageId,
    pub payload: Vec<u8>,
    /// compression tag to carry in the header parcel; the payload itself is
    ///  treated as opaque bytes either way
    pub compression: Option<CompressionAlgorithm>,
    pub retry_count: u32,
}

impl OutgoingMessage {
    pub fn new(target_device_id: DeviceId, payload: Vec<u8>) -> OutgoingMessage {
        OutgoingMessage {
            target_device_id,
            msg_id: MessageId::new(),
            payload,
            compression: None,
            retry_count: 0,
        }
    }

    pub fn compressed(target_device_id: DeviceId, payload: Vec<u8>, algorithm: CompressionAlgorithm) -> OutgoingMessage {
        OutgoingMessage {
            compression: Some(algorithm),
            ..OutgoingMessage::new(target_device_id, payload)
        }
    }
}

/// Fully-encoded frames of a dispatched message, retained for a while after
///  the synchronous send cycle so that delayed `missing` requests can still be
///  serviced without re-running the pipeline.
struct SentMessageRecord {
    target_device_id: DeviceId,
    data_frames: Vec<Vec<u8>>,
    sent_at: Instant,
}

struct SendPipelineInner {
    queues: FxHashMap<DeviceId, VecDeque<OutgoingMessage>>,
    /// one entry per device with a running sender loop - the per-device busy
    ///  flag that guarantees mutual exclusion of send loops
    active_loops: FxHashMap<DeviceId, JoinHandle<()>>,
    pending_receipts: FxHashMap<MessageId, (DeviceId, oneshot::Sender<Receipt>)>,
    sent_records: FxHashMap<MessageId, SentMessageRecord>,
}

/// Per-destination FIFO of outgoing messages plus the machinery for one send:
///  splitting into parcels, pacing the burst, waiting for the receipt, and
///  selective / full retransmission.
#[derive(Clone)]
pub struct SendPipeline {
    config: Arc<ParcelConfig>,
    sink: Arc<dyn ParcelSink>,
    dispatcher: Arc<dyn MessageDispatcher>,
    inner: Arc<RwLock<SendPipelineInner>>,
}

impl SendPipeline {
    pub fn new(
        config: Arc<ParcelConfig>,
        sink: Arc<dyn ParcelSink>,
        dispatcher: Arc<dyn MessageDispatcher>,
    ) -> SendPipeline {
        SendPipeline {
            config,
            sink,
            dispatcher,
            inner: Arc::new(RwLock::new(SendPipelineInner {
                queues: FxHashMap::default(),
                active_loops: FxHashMap::default(),
                pending_receipts: FxHashMap::default(),
                sent_records: FxHashMap::default(),
            })),
        }
    }

    /// Accept a message into the per-device queue. Returns acceptance, not
    ///  delivery confirmation. Spawns the device's sender loop if none is
    ///  running.
    pub async fn enqueue(&self, message: OutgoingMessage) -> bool {
        if message.payload.len() > self.config.max_message_size {
            warn!("rejecting message {} for {}: payload of {} bytes exceeds the maximum of {}",
                message.msg_id, message.target_device_id, message.payload.len(), self.config.max_message_size);
            return false;
        }

        let device = message.target_device_id.clone();
        let mut inner = self.inner.write().await;

        debug!("queueing message {} of {} bytes for {}", message.msg_id, message.payload.len(), device);
        inner.queues.entry(device.clone()).or_default().push_back(message);

        if !inner.active_loops.contains_key(&device) {
            let this = self.clone();
            let loop_device = device.clone();
            let handle = tokio::spawn(async move {
                this.run_queue(loop_device).await;
            });
            inner.active_loops.insert(device, handle);
        }
        true
    }

    pub async fn queue_len(&self, device: &DeviceId) -> usize {
        self.inner.read().await
            .queues.get(device)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    pub async fn is_sending(&self, device: &DeviceId) -> bool {
        self.inner.read().await
            .active_loops.contains_key(device)
    }

    /// Drops everything this pipeline holds for one device: queued messages,
    ///  the running sender loop, pending receipt waits and retained sent
    ///  records.
    pub async fn cancel_device(&self, device: &DeviceId) {
        let mut inner = self.inner.write().await;
        let dropped = inner.queues.remove(device).map(|q| q.len()).unwrap_or(0);
        if let Some(handle) = inner.active_loops.remove(device) {
            handle.abort();
        }
        inner.pending_receipts.retain(|_, entry| &entry.0 != device);
        inner.sent_records.retain(|_, record| &record.target_device_id != device);
        debug!("cancelled device {}: dropped {} queued messages", device, dropped);
    }

    /// The single sender loop for one device. Exactly one of these runs per
    ///  device at a time; it exits (and clears its busy flag) when the queue
    ///  drains.
    async fn run_queue(&self, device: DeviceId) {
        loop {
            let next = {
                let mut inner = self.inner.write().await;
                match inner.queues.get_mut(&device).and_then(|q| q.pop_front()) {
                    Some(message) => Some(message),
                    None => {
                        // remove queue and busy flag in the same critical
                        //  section as the failed pop, so a concurrent enqueue
                        //  either sees the flag or spawns a fresh loop
                        inner.queues.remove(&device);
                        inner.active_loops.remove(&device);
                        None
                    }
                }
            };

            let Some(mut message) = next else {
                trace!("queue for {} drained - sender loop exiting", device);
                return;
            };

            self.send_with_retries(&mut message).await;
        }
    }

    async fn send_with_retries(&self, message: &mut OutgoingMessage) {
        while message.retry_count < self.config.max_retries {
            match self.send_once(message).await {
                Ok(true) => {
                    debug!("message {} delivered to {}", message.msg_id, message.target_device_id);
                    return;
                }
                Ok(false) => {
                    message.retry_count += 1;
                    debug!("send attempt for message {} to {} failed ({}/{} attempts used)",
                        message.msg_id, message.target_device_id, message.retry_count, self.config.max_retries);
                }
                Err(e) => {
                    warn!("message {} to {} cannot be sent: {:#}", message.msg_id, message.target_device_id, e);
                    break;
                }
            }
        }

        warn!("dropping message {} to {} after exhausting its retry budget",
            message.msg_id, message.target_device_id);
        self.dispatcher.on_send_failed(message.target_device_id.clone(), message.msg_id).await;
    }

    /// One full send attempt: initial burst plus up to `max_resend_cycles`
    ///  receiver-driven resend cycles. `Ok(true)` means the receiver confirmed
    ///  the message complete; `Ok(false)` means the attempt failed and counts
    ///  against the message-level retry budget.
    async fn send_once(&self, message: &OutgoingMessage) -> anyhow::Result<bool> {
        let (header, data_parcels) = split_into_parcels(
            message.msg_id,
            &message.payload,
            self.config.max_parcel_payload,
            message.compression,
        )?;

        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        let header_frame = buf.to_vec();

        let data_frames = data_parcels.iter()
            .map(|parcel| {
                let mut buf = BytesMut::new();
                parcel.ser(&mut buf);
                buf.to_vec()
            })
            .collect::<Vec<_>>();

        // store the record before any byte leaves the process, so known-sent
        //  parcels can be replayed even if this attempt dies half-way
        {
            let mut inner = self.inner.write().await;
            inner.sent_records.insert(message.msg_id, SentMessageRecord {
                target_device_id: message.target_device_id.clone(),
                data_frames: data_frames.clone(),
                sent_at: Instant::now(),
            });
        }

        let total = data_frames.len() as u32;
        let mut parcels_to_send: Vec<u32> = (0..total).collect();
        let mut resend_header = true;

        for cycle in 0..=self.config.max_resend_cycles {
            let receipt_rx = self.register_pending(message).await;

            trace!("burst for message {} (cycle {}): header={}, {} data parcels",
                message.msg_id, cycle, resend_header, parcels_to_send.len());
            self.send_burst(
                &message.target_device_id,
                resend_header.then_some(header_frame.as_slice()),
                &parcels_to_send,
                &data_frames,
            ).await;

            let receipt = match timeout(self.config.receipt_timeout, receipt_rx).await {
                Ok(Ok(receipt)) => receipt,
                Ok(Err(_)) => {
                    // our sender half was dropped, e.g. by cancel_device
                    debug!("pending wait for message {} was cancelled", message.msg_id);
                    return Ok(false);
                }
                Err(_) => {
                    debug!("no receipt for message {} from {} within {:?}",
                        message.msg_id, message.target_device_id, self.config.receipt_timeout);
                    self.remove_pending(message.msg_id).await;
                    return Ok(false);
                }
            };

            // keep the record fresh for delayed retransmission requests
            self.touch_sent_record(message.msg_id).await;

            match receipt.status {
                ReceiptStatus::Complete => {
                    return Ok(true);
                }
                ReceiptStatus::Missing(missing) => {
                    let sanitized = missing.into_iter()
                        .filter(|&parcel_num| parcel_num < total)
                        .collect::<Vec<_>>();
                    if sanitized.is_empty() {
                        warn!("receiver reported message {} missing without any valid indices - failing the attempt", message.msg_id);
                        return Ok(false);
                    }
                    debug!("receiver is missing {} parcels of message {} - selective resend", sanitized.len(), message.msg_id);
                    parcels_to_send = sanitized;
                    resend_header = false;
                }
                ReceiptStatus::ChecksumFailed => {
                    // integrity failure voids all partial-ack assumptions
                    warn!("receiver reports checksum failure for message {} - full resend", message.msg_id);
                    parcels_to_send = (0..total).collect();
                    resend_header = true;
                }
            }
        }

        debug!("message {} exhausted its resend cycle budget of {}", message.msg_id, self.config.max_resend_cycles);
        Ok(false)
    }

    /// Streams one burst through the transport callback: parcels paced by the
    ///  inter-parcel delay, with a listen window after every
    ///  `parcels_before_pause` parcels so the peer gets channel time. A failed
    ///  parcel write is logged and simply left out of the burst - the
    ///  receiver's `missing` report recovers it.
    async fn send_burst(
        &self,
        to: &DeviceId,
        header_frame: Option<&[u8]>,
        parcels_to_send: &[u32],
        data_frames: &[Vec<u8>],
    ) {
        let mut sent_since_pause = 0u32;

        if let Some(frame) = header_frame {
            self.send_single(to, frame, "header parcel").await;
            sent_since_pause += 1;
            sleep(self.config.inter_parcel_delay).await;
        }

        for &parcel_num in parcels_to_send {
            if sent_since_pause >= self.config.parcels_before_pause {
                trace!("listen window for {}", to);
                sleep(self.config.listen_window).await;
                sent_since_pause = 0;
            }

            self.send_single(to, &data_frames[parcel_num as usize], "data parcel").await;
            sent_since_pause += 1;
            sleep(self.config.inter_parcel_delay).await;
        }
    }

    async fn send_single(&self, to: &DeviceId, frame: &[u8], what: &str) {
        if let Err(e) = self.sink.send_to(to.clone(), frame).await {
            warn!("failed to send {} to {}: {:#} - leaving recovery to retransmission", what, to, e);
        }
    }

    async fn register_pending(&self, message: &OutgoingMessage) -> oneshot::Receiver<Receipt> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.write().await;
        if inner.pending_receipts
            .insert(message.msg_id, (message.target_device_id.clone(), tx))
            .is_some()
        {
            warn!("replacing a stale pending receipt wait for message {}", message.msg_id);
        }
        rx
    }

    async fn remove_pending(&self, msg_id: MessageId) {
        self.inner.write().await
            .pending_receipts.remove(&msg_id);
    }

    async fn touch_sent_record(&self, msg_id: MessageId) {
        if let Some(record) = self.inner.write().await.sent_records.get_mut(&msg_id) {
            record.sent_at = Instant::now();
        }
    }

    /// Entry point for receipts arriving from the wire. A pending send
    ///  operation waiting on this message id is resolved directly; a `missing`
    ///  receipt with no pending wait is a delayed retransmission request
    ///  serviced from retention.
    pub async fn on_receipt(&self, from: DeviceId, receipt: Receipt) {
        let pending = {
            let mut inner = self.inner.write().await;
            // the device check happens under the same guard as the removal so
            //  the entry is never absent while a genuine receipt arrives
            match inner.pending_receipts.get(&receipt.msg_id) {
                Some((target, _)) if target != &from => {
                    warn!("receipt for message {} came from {} but the message was sent to {} - ignoring",
                        receipt.msg_id, from, target);
                    return;
                }
                Some(_) => inner.pending_receipts.remove(&receipt.msg_id),
                None => None,
            }
        };

        if let Some((_, tx)) = pending {
            trace!("resolving pending wait for message {}", receipt.msg_id);
            // the waiting side may have timed out concurrently
            let _ = tx.send(receipt);
            return;
        }

        match receipt.status {
            ReceiptStatus::Missing(parcels) => {
                self.replay_from_retention(from, receipt.msg_id, parcels).await;
            }
            _ => {
                debug!("receipt for message {} from {} has no pending wait - ignoring", receipt.msg_id, from);
            }
        }
    }

    async fn replay_from_retention(&self, from: DeviceId, msg_id: MessageId, parcels: Vec<u32>) {
        let frames = {
            let inner = self.inner.read().await;
            match inner.sent_records.get(&msg_id) {
                Some(record) if record.target_device_id == from => {
                    Some(parcels.iter()
                        .filter_map(|&parcel_num| record.data_frames.get(parcel_num as usize).cloned())
                        .collect::<Vec<_>>())
                }
                Some(record) => {
                    warn!("retransmission request for message {} from {}, but it was sent to {} - ignoring",
                        msg_id, from, record.target_device_id);
                    None
                }
                None => {
                    warn!("cannot retransmit message {} for {}: not in retention", msg_id, from);
                    None
                }
            }
        };

        let Some(frames) = frames else {
            return;
        };

        debug!("delayed retransmission of {} parcels of message {} to {}", frames.len(), msg_id, from);

        // this is reached from the transport's receive path, which must not
        //  block, so the paced replay runs in its own task
        let this = self.clone();
        tokio::spawn(async move {
            for frame in &frames {
                this.send_single(&from, frame, "retransmitted parcel").await;
                sleep(this.config.inter_parcel_delay).await;
            }
        });
    }

    /// Housekeeping sweep: drop sent-message records older than the retention
    ///  window.
    pub async fn expire_sent_records(&self) {
        let now = Instant::now();
        let retention = self.config.sent_message_retention;

        self.inner.write().await
            .sent_records.retain(|msg_id, record| {
                let keep = now.duration_since(record.sent_at) < retention;
                if !keep {
                    debug!("sent-message record {} aged out of retention", msg_id);
                }
                keep
            });
    }
}
