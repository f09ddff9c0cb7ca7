use crate::frame::FrameKind;
use crate::ids::MessageId;
use anyhow::{bail, Context};
use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Checksum over the full reassembled payload (not per parcel). This is
///  integrity-against-corruption, not security, so CRC-32 is sufficient.
const PAYLOAD_CRC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

pub fn payload_checksum(payload: &[u8]) -> u32 {
    PAYLOAD_CRC.checksum(payload)
}

bitflags! {
    /// Flags carried in the header parcel. Only the compression bit is
    ///  assigned so far, the rest of the byte must be zero.
    #[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
    pub struct ParcelFlags: u8 {
        const COMPRESSED = 0x01;
    }
}

/// Tag for the compression applied to the payload by the layer above. The
///  payload is opaque to this protocol, the tag just travels end-to-end with
///  the message so the receiving application knows how to unpack it.
#[derive(Copy, Clone, Eq, PartialEq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum CompressionAlgorithm {
    Gzip = 1,
    Deflate = 2,
}

/// The single metadata parcel of a message. It is logically 'first' and
///  carries no payload bytes of its own.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct HeaderParcel {
    pub msg_id: MessageId,
    /// number of *data* parcels that follow
    pub total_parcels: u32,
    pub checksum: u32,
    pub flags: ParcelFlags,
    /// meaningful iff `flags` contains `COMPRESSED`
    pub compression: Option<CompressionAlgorithm>,
}

impl HeaderParcel {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(FrameKind::Header.into());
        buf.put_slice(self.msg_id.as_bytes());
        buf.put_u32(self.total_parcels);
        buf.put_u32(self.checksum);
        // the wire flag is derived from `compression` so an inconsistently
        //  populated struct cannot produce an undecodable frame
        let mut flags = self.flags;
        flags.set(ParcelFlags::COMPRESSED, self.compression.is_some());
        buf.put_u8(flags.bits());
        if let Some(algorithm) = self.compression {
            buf.put_u8(algorithm.into());
        }
    }

    /// NB: the frame kind byte is consumed by the caller before dispatching here
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<HeaderParcel> {
        let msg_id = get_msg_id(buf)?;
        let total_parcels = buf.try_get_u32()?;
        let checksum = buf.try_get_u32()?;
        let raw_flags = buf.try_get_u8()?;
        let flags = ParcelFlags::from_bits(raw_flags)
            .with_context(|| format!("unknown bits in parcel flags {:#04x}", raw_flags))?;

        let compression = if flags.contains(ParcelFlags::COMPRESSED) {
            let raw = buf.try_get_u8()?;
            let algorithm = CompressionAlgorithm::try_from(raw)
                .with_context(|| format!("unknown compression algorithm {}", raw))?;
            Some(algorithm)
        }
        else {
            None
        };

        Ok(HeaderParcel {
            msg_id,
            total_parcels,
            checksum,
            flags,
            compression,
        })
    }
}

/// One chunk of payload. `parcel_num` is the zero-based slot in the
///  reassembled message, the payload runs to the end of the frame since the
///  transport preserves frame boundaries.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct DataParcel {
    pub msg_id: MessageId,
    pub parcel_num: u32,
    pub payload: Vec<u8>,
}

impl DataParcel {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(FrameKind::Data.into());
        buf.put_slice(self.msg_id.as_bytes());
        buf.put_u32(self.parcel_num);
        buf.put_slice(&self.payload);
    }

    /// NB: the frame kind byte is consumed by the caller before dispatching here
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<DataParcel> {
        let msg_id = get_msg_id(buf)?;
        let parcel_num = buf.try_get_u32()?;
        let payload = buf.copy_to_bytes(buf.remaining()).to_vec();
        Ok(DataParcel {
            msg_id,
            parcel_num,
            payload,
        })
    }
}

fn get_msg_id(buf: &mut impl Buf) -> anyhow::Result<MessageId> {
    if buf.remaining() < 16 {
        bail!("buffer too short for a message id");
    }
    let mut raw = [0u8; 16];
    buf.copy_to_slice(&mut raw);
    Ok(MessageId::from_bytes(raw))
}

/// Split a payload into its parcel set.
///
/// This derivation is deterministic: the same payload and chunk size always
///  produce a byte-identical parcel set, which is what makes selective
///  retransmission work without re-encoding drift.
pub fn split_into_parcels(
    msg_id: MessageId,
    payload: &[u8],
    max_chunk_size: usize,
    compression: Option<CompressionAlgorithm>,
) -> anyhow::Result<(HeaderParcel, Vec<DataParcel>)> {
    assert!(max_chunk_size > 0);

    let data_parcels = payload
        .chunks(max_chunk_size)
        .enumerate()
        .map(|(parcel_num, chunk)| DataParcel {
            msg_id,
            parcel_num: parcel_num as u32,
            payload: chunk.to_vec(),
        })
        .collect::<Vec<_>>();

    let total_parcels: u32 = data_parcels.len().try_into()
        .context("payload splits into more parcels than fit a u32 index")?;

    let flags = if compression.is_some() {
        ParcelFlags::COMPRESSED
    }
    else {
        ParcelFlags::empty()
    };

    let header = HeaderParcel {
        msg_id,
        total_parcels,
        checksum: payload_checksum(payload),
        flags,
        compression,
    };

    Ok((header, data_parcels))
}
