use crate::config::ParcelConfig;
use crate::ids::{DeviceId, MessageId};
use crate::message_dispatcher::MessageDispatcher;
use crate::parcel::{payload_checksum, CompressionAlgorithm, DataParcel, HeaderParcel, ParcelFlags};
use crate::parcel_sink::ParcelSink;
use crate::receipt::Receipt;
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Metadata from the header parcel, fixed once the header has been seen.
#[derive(Copy, Clone, Debug)]
struct IncomingHeader {
    total_parcels: u32,
    expected_checksum: u32,
    #[allow(dead_code)]
    flags: ParcelFlags,
    compression: Option<CompressionAlgorithm>,
}

/// Accumulator for one in-flight incoming message.
///
/// Created on the first parcel seen for an unknown message id - header or
///  data. Data parcels arriving before the header are buffered here until a
///  header shows up; without a header the message can never complete and is
///  eventually abandoned by housekeeping.
struct IncomingMessage {
    msg_id: MessageId,
    source_device_id: DeviceId,
    header: Option<IncomingHeader>,
    parcels: FxHashMap<u32, Vec<u8>>,
    /// updated on every *accepted* parcel - duplicates do not count as progress
    last_parcel_at: Instant,
    /// rate limit for proactive missing-parcel requests
    last_missing_request_at: Option<Instant>,
}

impl IncomingMessage {
    fn new(msg_id: MessageId, source_device_id: DeviceId) -> IncomingMessage {
        IncomingMessage {
            msg_id,
            source_device_id,
            header: None,
            parcels: FxHashMap::default(),
            last_parcel_at: Instant::now(),
            last_missing_request_at: None,
        }
    }

    /// complete ⇔ the header is known and every index in `[0, total)` has
    ///  arrived. Out-of-range and duplicate parcels are never stored, so the
    ///  map size is the count of distinct received indices.
    fn is_complete(&self) -> bool {
        match &self.header {
            Some(header) => self.parcels.len() as u32 == header.total_parcels,
            None => false,
        }
    }

    fn missing_parcels(&self) -> Vec<u32> {
        match &self.header {
            Some(header) => (0..header.total_parcels)
                .filter(|parcel_num| !self.parcels.contains_key(parcel_num))
                .collect(),
            None => Vec::new(),
        }
    }

    /// concatenates the data parcels in index order. Must only be called on a
    ///  complete message.
    fn reassemble(mut self) -> (IncomingHeader, Vec<u8>) {
        let header = self.header.expect("reassembling a message without a header");
        let mut payload = Vec::new();
        for parcel_num in 0..header.total_parcels {
            let chunk = self.parcels.remove(&parcel_num)
                .expect("complete message is missing a parcel");
            payload.extend_from_slice(&chunk);
        }
        (header, payload)
    }
}

type PerDeviceBuffers = FxHashMap<DeviceId, FxHashMap<MessageId, IncomingMessage>>;

/// Per-source, per-message reassembly: accumulates parcels, detects
///  completeness, verifies the payload checksum and emits receipts plus the
///  completed-message event.
#[derive(Clone)]
pub struct ReassemblyBuffer {
    config: Arc<ParcelConfig>,
    sink: Arc<dyn ParcelSink>,
    dispatcher: Arc<dyn MessageDispatcher>,
    inner: Arc<RwLock<PerDeviceBuffers>>,
}

impl ReassemblyBuffer {
    pub fn new(
        config: Arc<ParcelConfig>,
        sink: Arc<dyn ParcelSink>,
        dispatcher: Arc<dyn MessageDispatcher>,
    ) -> ReassemblyBuffer {
        ReassemblyBuffer {
            config,
            sink,
            dispatcher,
            inner: Arc::new(RwLock::new(FxHashMap::default())),
        }
    }

    pub async fn on_header(&self, source: DeviceId, header: HeaderParcel) {
        let max_parcels = self.config.max_message_size.div_ceil(self.config.max_parcel_payload);
        if header.total_parcels as usize > max_parcels {
            warn!("header for message {} from {} declares {} parcels but at most {} fit the maximum message size - dropping",
                header.msg_id, source, header.total_parcels, max_parcels);
            if let Some(per_device) = self.inner.write().await.get_mut(&source) {
                per_device.remove(&header.msg_id);
            }
            return;
        }

        let mut guard = self.inner.write().await;
        let per_device = guard.entry(source.clone()).or_default();
        let message = per_device.entry(header.msg_id)
            .or_insert_with(|| IncomingMessage::new(header.msg_id, source.clone()));

        if message.header.is_some() {
            debug!("duplicate header for message {} from {} - ignoring", header.msg_id, source);
            return;
        }

        // data buffered before the header may turn out to be out of range
        let buffered_before = message.parcels.len();
        message.parcels.retain(|&parcel_num, _| parcel_num < header.total_parcels);
        if message.parcels.len() != buffered_before {
            warn!("dropped {} buffered parcels of message {} that are outside the declared range of {}",
                buffered_before - message.parcels.len(), header.msg_id, header.total_parcels);
        }

        trace!("header for message {} from {}: {} data parcels expected", header.msg_id, source, header.total_parcels);
        message.header = Some(IncomingHeader {
            total_parcels: header.total_parcels,
            expected_checksum: header.checksum,
            flags: header.flags,
            compression: header.compression,
        });
        message.last_parcel_at = Instant::now();

        let completed = Self::take_if_complete(&mut guard, &source, header.msg_id);
        drop(guard);
        if let Some(message) = completed {
            self.finalize(message).await;
        }
    }

    pub async fn on_data(&self, source: DeviceId, parcel: DataParcel) {
        let mut guard = self.inner.write().await;
        let per_device = guard.entry(source.clone()).or_default();
        let message = per_device.entry(parcel.msg_id)
            .or_insert_with(|| {
                debug!("data parcel for message {} from {} arrived before its header - buffering", parcel.msg_id, source);
                IncomingMessage::new(parcel.msg_id, source.clone())
            });

        if let Some(header) = &message.header {
            if parcel.parcel_num >= header.total_parcels {
                warn!("data parcel {} of message {} from {} is outside the declared range of {} - discarding",
                    parcel.parcel_num, parcel.msg_id, source, header.total_parcels);
                return;
            }
        }

        if message.parcels.contains_key(&parcel.parcel_num) {
            trace!("duplicate data parcel {} of message {} from {} - ignoring", parcel.parcel_num, parcel.msg_id, source);
            return;
        }

        message.parcels.insert(parcel.parcel_num, parcel.payload);
        message.last_parcel_at = Instant::now();

        let completed = Self::take_if_complete(&mut guard, &source, parcel.msg_id);
        drop(guard);
        if let Some(message) = completed {
            self.finalize(message).await;
        }
    }

    /// Removes the message from the buffers if it is complete. This is the
    ///  only part that runs under the lock - the checksum gate and the
    ///  resulting receipt / event I/O happen in [ReassemblyBuffer::finalize]
    ///  after the guard is dropped, so a slow transport write or application
    ///  callback never stalls frames from other devices.
    fn take_if_complete(buffers: &mut PerDeviceBuffers, source: &DeviceId, msg_id: MessageId) -> Option<IncomingMessage> {
        let per_device = buffers.get_mut(source)?;
        let complete = per_device.get(&msg_id)
            .map(|m| m.is_complete())
            .unwrap_or(false);
        if !complete {
            return None;
        }

        let message = per_device.remove(&msg_id);
        if per_device.is_empty() {
            buffers.remove(source);
        }
        message
    }

    /// Terminal handling of a complete message: run the checksum gate and
    ///  answer either way - receipt + completed event on a match,
    ///  `checksumFailed` receipt on a mismatch (the next attempt starts fresh
    ///  with a new header).
    async fn finalize(&self, message: IncomingMessage) {
        let msg_id = message.msg_id;
        let source_device_id = message.source_device_id.clone();
        let (header, payload) = message.reassemble();

        if payload_checksum(&payload) == header.expected_checksum {
            debug!("message {} from {} complete: {} bytes", msg_id, source_device_id, payload.len());
            self.send_receipt(&source_device_id, Receipt::complete(msg_id)).await;
            self.dispatcher.on_message_completed(source_device_id, msg_id, header.compression, payload).await;
        }
        else {
            warn!("message {} from {} reassembled but failed checksum verification - requesting a full resend",
                msg_id, source_device_id);
            self.send_receipt(&source_device_id, Receipt::checksum_failed(msg_id)).await;
        }
    }

    async fn send_receipt(&self, to: &DeviceId, receipt: Receipt) {
        let mut buf = BytesMut::new();
        receipt.ser(&mut buf);
        if let Err(e) = self.sink.send_to(to.clone(), &buf).await {
            warn!("failed to send receipt for message {} to {}: {:#}", receipt.msg_id, to, e);
        }
    }

    /// Housekeeping sweep over all devices: abandon incomplete messages that
    ///  stalled for longer than the incomplete-message timeout, and nudge the
    ///  sender of messages that stalled for longer than the missing-parcel
    ///  request delay (rate limited per message, so a lossy link is not
    ///  flooded with requests).
    pub async fn sweep(&self) {
        let now = Instant::now();
        let mut nudges: Vec<(DeviceId, Receipt)> = Vec::new();

        {
            let mut guard = self.inner.write().await;
            for (device, per_device) in guard.iter_mut() {
                per_device.retain(|msg_id, message| {
                    let idle = now.duration_since(message.last_parcel_at);
                    if idle >= self.config.incomplete_message_timeout {
                        warn!("incoming message {} from {} abandoned after {:?} without progress - discarding",
                            msg_id, device, idle);
                        return false;
                    }
                    true
                });

                for (msg_id, message) in per_device.iter_mut() {
                    let idle = now.duration_since(message.last_parcel_at);
                    if idle < self.config.missing_parcel_request_delay {
                        continue;
                    }
                    let requested_recently = message.last_missing_request_at
                        .map(|at| now.duration_since(at) < self.config.missing_parcel_request_delay)
                        .unwrap_or(false);
                    if requested_recently {
                        continue;
                    }
                    let missing = message.missing_parcels();
                    if missing.is_empty() {
                        // headerless orphan - nothing to request, abandonment will get it
                        continue;
                    }
                    message.last_missing_request_at = Some(now);
                    debug!("message {} from {} stalled - proactively requesting {} missing parcels",
                        msg_id, device, missing.len());
                    nudges.push((device.clone(), Receipt::missing(*msg_id, missing)));
                }
            }
            guard.retain(|_, per_device| !per_device.is_empty());
        }

        for (device, receipt) in nudges {
            self.send_receipt(&device, receipt).await;
        }
    }

    pub async fn open_message_count(&self, device: &DeviceId) -> usize {
        self.inner.read().await
            .get(device)
            .map(|per_device| per_device.len())
            .unwrap_or(0)
    }

    /// Drops all incoming state for one device.
    pub async fn cancel_device(&self, device: &DeviceId) {
        if let Some(dropped) = self.inner.write().await.remove(device) {
            debug!("cancelled device {}: dropped {} incomplete incoming messages", device, dropped.len());
        }
    }
}
