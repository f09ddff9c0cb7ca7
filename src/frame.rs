use anyhow::Context;
use bytes::Buf;
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Every frame on the wire starts with a single discriminator byte so that
///  receipts and the two parcel shapes can be told apart without speculative
///  parsing. Unknown values are a decode error, the receive path logs and
///  drops such frames.
#[derive(Copy, Clone, Eq, PartialEq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum FrameKind {
    Header = 1,
    Data = 2,
    Receipt = 3,
}

impl FrameKind {
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<FrameKind> {
        let raw = buf.try_get_u8()?;
        FrameKind::try_from(raw)
            .with_context(|| format!("unknown frame kind {}", raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case::header(1, Some(FrameKind::Header))]
    #[case::data(2, Some(FrameKind::Data))]
    #[case::receipt(3, Some(FrameKind::Receipt))]
    #[case::zero(0, None)]
    #[case::unknown(17, None)]
    fn test_deser(#[case] raw: u8, #[case] expected: Option<FrameKind>) {
        let actual = FrameKind::deser(&mut &[raw][..]).ok();
        assert_eq!(actual, expected);
    }

    #[rstest]
    fn test_deser_empty() {
        assert!(FrameKind::deser(&mut &[][..]).is_err());
    }
}
