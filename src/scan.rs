//! Advertising report delivery.

use crate::cursor::ReadCursor;
use crate::types::{AddrKind, BdAddr};
use crate::Address;

/// A batch of advertising reports from the controller.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanReport {
    pub(crate) extended: bool,
    pub(crate) num_reports: u8,
    pub(crate) data: Vec<u8>,
}

impl ScanReport {
    pub(crate) fn new(extended: bool, num_reports: u8, data: &[u8]) -> Self {
        Self {
            extended,
            num_reports,
            data: data.to_vec(),
        }
    }

    /// Whether this came from an LE Extended Advertising Report.
    pub fn is_extended(&self) -> bool {
        self.extended
    }

    /// Parse the individual reports.
    pub fn iter(&self) -> ScanReportIter<'_> {
        ScanReportIter {
            extended: self.extended,
            remaining: self.num_reports,
            data: &self.data,
        }
    }
}

/// A single advertisement.
#[derive(Debug, Clone, PartialEq)]
pub struct AdvReport<'d> {
    /// Event type bits as reported by the controller.
    pub event_kind: u16,
    /// Advertiser address.
    pub address: Address,
    /// AD structures.
    pub data: &'d [u8],
    /// Received signal strength, dBm, 127 when unavailable.
    pub rssi: i8,
}

/// Iterator over the reports in a [`ScanReport`].
pub struct ScanReportIter<'d> {
    extended: bool,
    remaining: u8,
    data: &'d [u8],
}

impl<'d> Iterator for ScanReportIter<'d> {
    type Item = AdvReport<'d>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let mut r = ReadCursor::new(self.data);
        let report = if self.extended {
            let event_kind: u16 = r.read().ok()?;
            let kind = AddrKind(r.read::<u8>().ok()?);
            let addr: BdAddr = r.read().ok()?;
            // primary/secondary phy, sid, tx power
            r.skip(4).ok()?;
            let rssi: u8 = r.read().ok()?;
            // periodic interval, direct address
            r.skip(9).ok()?;
            let len: u8 = r.read().ok()?;
            let data = r.read_slice(len as usize).ok()?;
            AdvReport {
                event_kind,
                address: Address { kind, addr },
                data,
                rssi: rssi as i8,
            }
        } else {
            let event_kind: u8 = r.read().ok()?;
            let kind = AddrKind(r.read::<u8>().ok()?);
            let addr: BdAddr = r.read().ok()?;
            let len: u8 = r.read().ok()?;
            let data = r.read_slice(len as usize).ok()?;
            let rssi: u8 = r.read().ok()?;
            AdvReport {
                event_kind: event_kind as u16,
                address: Address { kind, addr },
                data,
                rssi: rssi as i8,
            }
        };
        self.data = {
            let consumed = self.data.len() - r.available();
            &self.data[consumed..]
        };
        Some(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_reports_parse_in_sequence() {
        let mut data = vec![
            0x00, 0x01, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, 2, 0xAA, 0xBB, 0xC8u8,
        ];
        data.extend_from_slice(&[0x03, 0x00, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01, 0, 0xD0]);
        let report = ScanReport::new(false, 2, &data);
        let mut it = report.iter();

        let first = it.next().unwrap();
        assert_eq!(first.address.kind, AddrKind::RANDOM);
        assert_eq!(first.address.addr.to_string(), "11:22:33:44:55:66");
        assert_eq!(first.data, &[0xAA, 0xBB]);
        assert_eq!(first.rssi, -56);

        let second = it.next().unwrap();
        assert_eq!(second.event_kind, 3);
        assert!(second.data.is_empty());
        assert!(it.next().is_none());
    }
}
