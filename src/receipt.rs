use crate::frame::FrameKind;
use crate::ids::MessageId;
use anyhow::{bail, Context};
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use bytes_varint::{VarIntSupport, VarIntSupportMut};

/// Acknowledgment for one message, sent from receiver to sender over the same
///  raw byte channel as the parcels.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Receipt {
    pub msg_id: MessageId,
    pub status: ReceiptStatus,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub enum ReceiptStatus {
    /// all parcels received and the payload checksum matched
    Complete,
    /// the listed data parcel indices are still outstanding
    Missing(Vec<u32>),
    /// all parcels received but the reassembled payload failed checksum
    ///  verification - partial-ack assumptions are void, a full resend is needed
    ChecksumFailed,
}

const STATUS_COMPLETE: u8 = 0;
const STATUS_MISSING: u8 = 1;
const STATUS_CHECKSUM_FAILED: u8 = 2;

impl Receipt {
    pub fn complete(msg_id: MessageId) -> Receipt {
        Receipt { msg_id, status: ReceiptStatus::Complete }
    }

    pub fn missing(msg_id: MessageId, parcels: Vec<u32>) -> Receipt {
        Receipt { msg_id, status: ReceiptStatus::Missing(parcels) }
    }

    pub fn checksum_failed(msg_id: MessageId) -> Receipt {
        Receipt { msg_id, status: ReceiptStatus::ChecksumFailed }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(FrameKind::Receipt.into());
        buf.put_slice(self.msg_id.as_bytes());
        match &self.status {
            ReceiptStatus::Complete => {
                buf.put_u8(STATUS_COMPLETE);
            }
            ReceiptStatus::Missing(parcels) => {
                buf.put_u8(STATUS_MISSING);
                buf.put_usize_varint(parcels.len());
                for &parcel_num in parcels {
                    buf.put_u32(parcel_num);
                }
            }
            ReceiptStatus::ChecksumFailed => {
                buf.put_u8(STATUS_CHECKSUM_FAILED);
            }
        }
    }

    /// NB: the frame kind byte is consumed by the caller before dispatching here
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Receipt> {
        if buf.remaining() < 16 {
            bail!("buffer too short for a message id");
        }
        let mut raw_id = [0u8; 16];
        buf.copy_to_slice(&mut raw_id);
        let msg_id = MessageId::from_bytes(raw_id);

        let status = match buf.try_get_u8()? {
            STATUS_COMPLETE => ReceiptStatus::Complete,
            STATUS_MISSING => {
                let num_parcels = buf.try_get_usize_varint()?;
                let mut parcels = Vec::with_capacity(num_parcels.min(1024));
                for _ in 0..num_parcels {
                    parcels.push(buf.try_get_u32()?);
                }
                ReceiptStatus::Missing(parcels)
            }
            STATUS_CHECKSUM_FAILED => ReceiptStatus::ChecksumFailed,
            other => return Err(anyhow::anyhow!("unknown receipt status {}", other))
                .context("deserializing receipt"),
        };

        Ok(Receipt { msg_id, status })
    }
}
