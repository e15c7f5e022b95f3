//! Identification & Maintenance records.
//!
//! I&M0 is served for record index 0x8000 and is exactly 54 bytes:
//!
//! | Field | Size |
//! |---|---|
//! | vendor id | 2 |
//! | order id | 20 |
//! | serial number | 16 |
//! | hardware revision | 2 |
//! | software revision | 4 (prefix + V.R.P) |
//! | revision counter | 2 |
//! | profile id | 2 |
//! | profile specific type | 2 |
//! | I&M version | 2 |
//! | I&M supported | 2 |
//!
//! The hardware revision is fixed at 0x0001; identity must not drift
//! with board-detection confidence.

use bitflags::bitflags;
use static_assertions::const_assert_eq;

use wt_common::consts::VENDOR_ID;

/// Serialized I&M0 record length.
pub const IM0_LEN: usize = 54;

const_assert_eq!(2 + 20 + 16 + 2 + 4 + 2 + 2 + 2 + 2 + 2, IM0_LEN);

/// Record index serving I&M0.
pub const IM0_INDEX: u16 = 0x8000;
/// First unsupported I&M index (I&M1).
pub const IM1_INDEX: u16 = 0x8001;
/// Last unsupported I&M index (I&M4).
pub const IM4_INDEX: u16 = 0x8004;

bitflags! {
    /// I&M supported mask. Only I&M0 is served, so no bits are set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ImSupported: u16 {
        const IM1 = 0x0002;
        const IM2 = 0x0004;
        const IM3 = 0x0008;
        const IM4 = 0x0010;
    }
}

/// I&M0 content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Im0 {
    pub vendor_id: u16,
    /// Order id, space-padded to 20 bytes.
    pub order_id: [u8; 20],
    /// Serial number, space-padded to 16 bytes.
    pub serial: [u8; 16],
    pub hardware_revision: u16,
    /// Software revision: prefix character plus (functional,
    /// bugfix, internal) in `V m.n.p` ordering.
    pub sw_prefix: u8,
    pub sw_functional: u8,
    pub sw_bugfix: u8,
    pub sw_internal: u8,
    pub revision_counter: u16,
    pub profile_id: u16,
    pub profile_specific_type: u16,
    pub im_version: u16,
    pub im_supported: ImSupported,
}

/// Space-pad a string into a fixed field, truncating over-long input.
fn padded<const N: usize>(text: &str) -> [u8; N] {
    let mut out = [b' '; N];
    for (dst, src) in out.iter_mut().zip(text.bytes()) {
        *dst = src;
    }
    out
}

impl Im0 {
    /// The device's I&M0 identity.
    pub fn new(order_id: &str, serial: &str, sw: (u8, u8, u8)) -> Self {
        Self {
            vendor_id: VENDOR_ID,
            order_id: padded(order_id),
            serial: padded(serial),
            hardware_revision: 0x0001,
            sw_prefix: b'V',
            sw_functional: sw.0,
            sw_bugfix: sw.1,
            sw_internal: sw.2,
            revision_counter: 0,
            profile_id: 0,
            profile_specific_type: 0,
            // I&M version 1.1.
            im_version: 0x0101,
            im_supported: ImSupported::empty(),
        }
    }

    /// Serialise to the 54-byte wire layout, big-endian fields.
    pub fn to_bytes(&self) -> [u8; IM0_LEN] {
        let mut out = [0u8; IM0_LEN];
        let mut at = 0usize;

        let mut put = |bytes: &[u8], at: &mut usize| {
            out[*at..*at + bytes.len()].copy_from_slice(bytes);
            *at += bytes.len();
        };

        put(&self.vendor_id.to_be_bytes(), &mut at);
        put(&self.order_id, &mut at);
        put(&self.serial, &mut at);
        put(&self.hardware_revision.to_be_bytes(), &mut at);
        put(
            &[
                self.sw_prefix,
                self.sw_functional,
                self.sw_bugfix,
                self.sw_internal,
            ],
            &mut at,
        );
        put(&self.revision_counter.to_be_bytes(), &mut at);
        put(&self.profile_id.to_be_bytes(), &mut at);
        put(&self.profile_specific_type.to_be_bytes(), &mut at);
        put(&self.im_version.to_be_bytes(), &mut at);
        put(&self.im_supported.bits().to_be_bytes(), &mut at);
        debug_assert_eq!(at, IM0_LEN);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn im0() -> Im0 {
        Im0::new("WT-RTU-8S8A", "WT0001-2024-0042", (1, 0, 0))
    }

    #[test]
    fn serialises_to_exactly_54_bytes() {
        assert_eq!(im0().to_bytes().len(), IM0_LEN);
    }

    #[test]
    fn vendor_id_leads_big_endian() {
        let bytes = im0().to_bytes();
        assert_eq!(bytes[0], 0x04);
        assert_eq!(bytes[1], 0x93);
    }

    #[test]
    fn order_id_is_space_padded() {
        let bytes = im0().to_bytes();
        let order = &bytes[2..22];
        assert!(order.starts_with(b"WT-RTU-8S8A"));
        assert!(order.ends_with(b" "));
    }

    #[test]
    fn hardware_revision_is_fixed() {
        let bytes = im0().to_bytes();
        // After vendor(2) + order(20) + serial(16).
        assert_eq!(&bytes[38..40], &[0x00, 0x01]);
    }

    #[test]
    fn software_revision_is_ordered() {
        let bytes = im0().to_bytes();
        assert_eq!(&bytes[40..44], &[b'V', 1, 0, 0]);
    }

    #[test]
    fn over_long_fields_truncate() {
        let im = Im0::new(
            "AN-ORDER-ID-LONGER-THAN-TWENTY-BYTES",
            "A-SERIAL-NUMBER-LONGER-THAN-SIXTEEN",
            (9, 9, 9),
        );
        assert_eq!(im.order_id.len(), 20);
        assert_eq!(im.serial.len(), 16);
        assert_eq!(&im.order_id, b"AN-ORDER-ID-LONGER-T");
    }
}
