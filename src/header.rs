//! Zero-copy access to the header fields of interleaved-FEC packets.
//!
//! A FEC packet is itself an RTP packet; the structures in this module view the RTP *payload* of
//! such a packet, which holds the FEC header followed by the payload-recovery bytes.
//!
//! ## Header data format
//!
//! ```plain
//! syntax fec_header() {
//!     E                           u1
//!     L                           u1
//!     P recovery                  u1
//!     X recovery                  u1
//!     CC recovery                 u4
//!     M recovery                  u1
//!     PT recovery                 u7
//!     SN base                     u16
//!     TS recovery                 u32
//!     Length recovery             u16
//!     Columns                     u8
//!     Rows                        u8
//!     SN recovery                 u16
//!     Mask                        u8
//!     Count                       u8
//!     if (E) {
//!         Media depth hint        u16
//!         FEC depth hint          u16
//!     }
//! }
//! ```
//!
//! The four trailing bytes are only present when the `E` flag is set ('extended' layout).  The
//! encoder in this crate always emits the extended layout; the 16-byte legacy layout is
//! recognised by [`FecHeader::header_len`] but rejected by [`FecHeader::from_bytes`].

use rtp_rs::RtpReader;
use rtp_rs::Seq;
use std::cmp;
use std::fmt;

/// Errors which may occur when trying to parse FEC header data
#[derive(Debug)]
pub enum FecHeaderError {
    /// The given buffer is too short to contain the FEC headers
    BufferTooShort(usize),
    /// The `E` (extended) flag is set to `0`; only the extended layout is accepted
    ExtensionFlagNotSet,
    /// the `columns` field unexpectedly had the value `0`
    ZeroColumns,
    /// the `rows` field unexpectedly had the value `0`
    ZeroRows,
}

/// The set of header values in an interleaved-FEC packet.
pub struct FecHeader<'buf> {
    buf: &'buf [u8],
}
impl<'buf> FecHeader<'buf> {
    /// Length in bytes of the legacy header layout, without the trailing depth-hint fields.
    pub const MIN_HEADER_LEN: usize = 16;

    /// Length in bytes of the extended header layout.
    pub const EXT_HEADER_LEN: usize = Self::MIN_HEADER_LEN + 4;

    /// wrap the given byte-slice in a `FecHeader` object, or return a `FecHeaderError` if the
    /// given slice does not represent a valid header.
    pub fn from_bytes(buf: &'buf [u8]) -> Result<FecHeader<'buf>, FecHeaderError> {
        if buf.len() < Self::MIN_HEADER_LEN {
            return Err(FecHeaderError::BufferTooShort(buf.len()));
        }
        let res = FecHeader { buf };
        if !res.extended() {
            return Err(FecHeaderError::ExtensionFlagNotSet);
        }
        if res.columns() == 0 {
            return Err(FecHeaderError::ZeroColumns);
        }
        if res.rows() == 0 {
            return Err(FecHeaderError::ZeroRows);
        }
        if buf.len() < res.header_len() {
            return Err(FecHeaderError::BufferTooShort(buf.len()));
        }
        Ok(res)
    }

    /// Returns a `FecHeader`, and the remaining payload-recovery data from the given slice
    /// immediately following the header.
    pub fn split_from_bytes(
        buf: &'buf [u8],
    ) -> Result<(FecHeader<'buf>, &'buf [u8]), FecHeaderError> {
        let len = Self::from_bytes(buf)?.header_len();
        let (buf, tail) = buf.split_at(len);
        Ok((FecHeader { buf }, tail))
    }

    /// Returns the length in bytes of the headers this object represents.
    pub fn header_len(&self) -> usize {
        if self.extended() {
            Self::EXT_HEADER_LEN
        } else {
            Self::MIN_HEADER_LEN
        }
    }

    /// Flag indicating if this header carries the trailing depth-hint fields (must be `true` for
    /// packets produced by this crate's encoder)
    pub fn extended(&self) -> bool {
        self.buf[0] & 0b1000_0000 != 0
    }

    /// The `L` flag; always `false` on packets produced by this crate's encoder
    pub fn long_mask(&self) -> bool {
        self.buf[0] & 0b0100_0000 != 0
    }

    /// Field allowing recovery of the _CSRC count_ of the media packet missing from the group
    pub fn cc_recovery(&self) -> u8 {
        self.buf[0] & 0b0000_1111
    }

    /// Field allowing recovery of the _marker_ flag of the media packet missing from the group
    pub fn marker_recovery(&self) -> bool {
        self.buf[1] & 0b1000_0000 != 0
    }

    /// Field allowing recovery of the _payload type_ of the media packet missing from the group
    pub fn pt_recovery(&self) -> u8 {
        self.buf[1] & 0b0111_1111
    }

    /// The sequence number of the first media packet covered by this FEC packet
    pub fn sn_base(&self) -> Seq {
        Seq::from(u16::from(self.buf[2]) << 8 | u16::from(self.buf[3]))
    }

    /// Used to recover the _timestamp_ field of the media packet missing from the group
    pub fn ts_recovery(&self) -> u32 {
        u32::from(self.buf[4]) << 24
            | u32::from(self.buf[5]) << 16
            | u32::from(self.buf[6]) << 8
            | u32::from(self.buf[7])
    }

    /// Used to recover the payload length of the media packet missing from the group
    pub fn length_recovery(&self) -> u16 {
        u16::from(self.buf[8]) << 8 | u16::from(self.buf[9])
    }

    /// The interleave stride: media packets covered by this FEC packet are `columns()` sequence
    /// numbers apart
    pub fn columns(&self) -> u8 {
        self.buf[10]
    }

    /// The number of media packets covered by this FEC packet
    pub fn rows(&self) -> u8 {
        self.buf[11]
    }

    /// Used to recover the _sequence number_ of the media packet missing from the group
    pub fn sn_recovery(&self) -> u16 {
        u16::from(self.buf[12]) << 8 | u16::from(self.buf[13])
    }

    /// Auxiliary mask byte; always zero on packets produced by this crate's encoder
    pub fn mask(&self) -> u8 {
        self.buf[14]
    }

    /// The number of media packets XORed into this FEC packet so far
    pub fn count(&self) -> u8 {
        self.buf[15]
    }

    /// Suggested reordering depth for the receiver's media-packet queue, or `0` if the header
    /// does not carry the extended fields
    pub fn media_depth_hint(&self) -> u16 {
        if self.extended() {
            u16::from(self.buf[16]) << 8 | u16::from(self.buf[17])
        } else {
            0
        }
    }

    /// Suggested reordering depth for the receiver's FEC-packet queue, or `0` if the header does
    /// not carry the extended fields
    pub fn fec_depth_hint(&self) -> u16 {
        if self.extended() {
            u16::from(self.buf[18]) << 8 | u16::from(self.buf[19])
        } else {
            0
        }
    }

    /// Iterator over the sequence numbers of the media packets covered by this FEC packet,
    /// starting from `sn_base()` and stepping by `columns()`.
    pub fn member_seqs(&self) -> impl Iterator<Item = Seq> {
        let base = u32::from(u16::from(self.sn_base()));
        let stride = u32::from(self.columns());
        (0..u32::from(self.rows())).map(move |i| {
            let mut sn = base + stride * i;
            // past the top of the sequence space, members continue from 1
            if sn > 0xffff {
                sn -= 0xffff;
            }
            Seq::from(sn as u16)
        })
    }

    /// `true` iff a media packet with the given sequence number would be covered by this FEC
    /// packet
    pub fn associates_with(&self, seq: Seq) -> bool {
        self.member_seqs().any(|s| s == seq)
    }
}

impl<'buf> fmt::Debug for FecHeader<'buf> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        f.debug_struct("FecHeader")
            .field("extended", &self.extended())
            .field("cc_recovery", &self.cc_recovery())
            .field("marker_recovery", &self.marker_recovery())
            .field("pt_recovery", &self.pt_recovery())
            .field("sn_base", &self.sn_base())
            .field("ts_recovery", &self.ts_recovery())
            .field("length_recovery", &self.length_recovery())
            .field("columns", &self.columns())
            .field("rows", &self.rows())
            .field("sn_recovery", &self.sn_recovery())
            .field("mask", &self.mask())
            .field("count", &self.count())
            .field("media_depth_hint", &self.media_depth_hint())
            .field("fec_depth_hint", &self.fec_depth_hint())
            .finish()
    }
}

/// Performs exclusive-or of every byte in `src` with the corresponding byte in `dst`, placing
/// the result in `dst`.
///
/// Panics if `src` and `dst` do not have the same length
pub(crate) fn xor(dst: &mut [u8], src: &[u8]) {
    assert_eq!(dst.len(), src.len());
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d ^= s
    }
}

/// Mutable view over the RTP payload of a FEC packet, in the extended layout.
///
/// The metadata fields that identify the group (`E` flag, SN base, columns, rows, depth hints)
/// have plain setters and are written once when a recovery record is created.  Every recovery
/// field instead has an XOR-folding mutator, never an overwriting one; folding a media packet in
/// a second time removes it again, which is what makes encoding and decoding the same operation.
pub struct FecPacketMut<'buf> {
    buf: &'buf mut [u8],
}
impl<'buf> FecPacketMut<'buf> {
    /// Panics if the buffer cannot hold the extended header layout.
    pub fn new(buf: &'buf mut [u8]) -> FecPacketMut<'buf> {
        assert!(buf.len() >= FecHeader::EXT_HEADER_LEN);
        FecPacketMut { buf }
    }

    /// Marks the header as using the extended layout.
    pub fn set_extended(&mut self) {
        self.buf[0] |= 0b1000_0000;
    }

    /// Writes the sequence number of the first media packet of the group.
    pub fn set_sn_base(&mut self, seq: Seq) {
        let s = u16::from(seq);
        self.buf[2] = (s >> 8) as u8;
        self.buf[3] = (s & 0xff) as u8;
    }

    /// Writes the interleave stride.
    pub fn set_columns(&mut self, columns: u8) {
        self.buf[10] = columns;
    }

    /// Writes the group size.
    pub fn set_rows(&mut self, rows: u8) {
        self.buf[11] = rows;
    }

    /// Writes the informational depth-hint fields of the extended layout.
    pub fn set_depth_hints(&mut self, media: u16, fec: u16) {
        self.buf[16] = (media >> 8) as u8;
        self.buf[17] = (media & 0xff) as u8;
        self.buf[18] = (fec >> 8) as u8;
        self.buf[19] = (fec & 0xff) as u8;
    }

    /// XORs the padding, extension and CSRC-count bits of the given RTP flag byte into the
    /// recovery fields; the version bits are not part of the recovery.
    pub fn xor_flags(&mut self, rtp_byte0: u8) {
        self.buf[0] ^= rtp_byte0 & 0b0011_1111;
    }

    /// XORs the given RTP marker/payload-type byte into the recovery fields.
    pub fn xor_marker_pt(&mut self, rtp_byte1: u8) {
        self.buf[1] ^= rtp_byte1;
    }

    /// XORs the given timestamp into the TS-recovery field.
    pub fn xor_timestamp(&mut self, ts: u32) {
        self.buf[4] ^= (ts >> 24) as u8;
        self.buf[5] ^= (ts >> 16 & 0xff) as u8;
        self.buf[6] ^= (ts >> 8 & 0xff) as u8;
        self.buf[7] ^= (ts & 0xff) as u8;
    }

    /// XORs the given payload length into the length-recovery field.
    pub fn xor_length(&mut self, len: u16) {
        self.buf[8] ^= (len >> 8) as u8;
        self.buf[9] ^= (len & 0xff) as u8;
    }

    /// XORs the given sequence number into the SN-recovery field.
    pub fn xor_sn(&mut self, seq: Seq) {
        let s = u16::from(seq);
        self.buf[12] ^= (s >> 8) as u8;
        self.buf[13] ^= (s & 0xff) as u8;
    }

    /// Adds one to the count field, saturating at `255`.
    pub fn increment_count(&mut self) {
        self.buf[15] = self.buf[15].saturating_add(1);
    }

    /// XOR-accumulates one whole media packet into this FEC packet: header recovery fields,
    /// payload-recovery bytes and the count field.
    ///
    /// The same operation serves the encoder (accumulating group members into a fresh record) and
    /// the decoder (folding received members out again, leaving the missing one).  A media
    /// payload longer than the payload-recovery region is folded only up to the region length.
    ///
    /// Panics if `source` is shorter than a minimal RTP header.
    pub fn fold_source(&mut self, seq: Seq, source: &[u8]) {
        assert!(source.len() >= RtpReader::MIN_HEADER_LEN);
        self.xor_flags(source[0]);
        self.xor_marker_pt(source[1]);
        let ts = u32::from(source[4]) << 24
            | u32::from(source[5]) << 16
            | u32::from(source[6]) << 8
            | u32::from(source[7]);
        self.xor_timestamp(ts);
        let payload = &source[RtpReader::MIN_HEADER_LEN..];
        self.xor_length(payload.len() as u16);
        self.xor_sn(seq);
        let region = &mut self.buf[FecHeader::EXT_HEADER_LEN..];
        if payload.len() > region.len() {
            log::warn!(
                "media payload of {} bytes exceeds the {} byte recovery region of the FEC packet",
                payload.len(),
                region.len()
            );
        }
        let n = cmp::min(region.len(), payload.len());
        xor(&mut region[..n], &payload[..n]);
        self.increment_count();
    }
}

/// Writer for the RTP header fields this crate fills in when emitting a FEC packet or a
/// reconstructed media packet.
pub struct RtpHeaderMut<'buf>(&'buf mut [u8]);
impl RtpHeaderMut<'_> {
    /// Panics if the buffer cannot hold a minimal RTP header.
    pub fn new(buf: &mut [u8]) -> RtpHeaderMut<'_> {
        assert!(buf.len() >= RtpReader::MIN_HEADER_LEN);
        RtpHeaderMut(buf)
    }
    pub fn set_version(&mut self, v: u8) {
        assert!(v <= 0b11);
        self.0[0] = self.0[0] & 0b0011_1111 | (v << 6);
    }
    pub fn set_padding(&mut self, padding: bool) {
        if padding {
            self.0[0] |= 0b0010_0000;
        } else {
            self.0[0] &= 0b1101_1111;
        }
    }
    pub fn set_extension(&mut self, extension: bool) {
        if extension {
            self.0[0] |= 0b0001_0000;
        } else {
            self.0[0] &= 0b1110_1111;
        }
    }
    pub fn set_csrc_count(&mut self, cc: u8) {
        assert!(cc <= 0b1111);
        self.0[0] = self.0[0] & 0b1111_0000 | cc;
    }
    pub fn set_marker(&mut self, mark: bool) {
        if mark {
            self.0[1] |= 0b1000_0000;
        } else {
            self.0[1] &= 0b0111_1111;
        }
    }
    pub fn set_payload_type(&mut self, pt: u8) {
        assert!(pt <= 0b0111_1111);
        self.0[1] = self.0[1] & 0b1000_0000 | pt;
    }
    pub fn set_sequence(&mut self, seq: Seq) {
        let s: u16 = seq.into();
        self.0[2] = (s >> 8) as u8;
        self.0[3] = (s & 0xff) as u8;
    }
    pub fn set_timestamp(&mut self, ts: u32) {
        self.0[4] = (ts >> 24) as u8;
        self.0[5] = (ts >> 16 & 0xff) as u8;
        self.0[6] = (ts >> 8 & 0xff) as u8;
        self.0[7] = (ts & 0xff) as u8;
    }
    pub fn set_ssrc(&mut self, ssrc: u32) {
        self.0[8] = (ssrc >> 24) as u8;
        self.0[9] = (ssrc >> 16 & 0xff) as u8;
        self.0[10] = (ssrc >> 8 & 0xff) as u8;
        self.0[11] = (ssrc & 0xff) as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::*;

    #[test]
    fn parse() {
        let data = hex!("80607bc30d5c28f1052405041a2b00040028000adeadbeef");
        let (header, payload) = FecHeader::split_from_bytes(&data[..]).unwrap();
        assert_eq!(header.header_len(), 20);
        assert!(header.extended());
        assert!(!header.long_mask());
        assert_eq!(header.cc_recovery(), 0);
        assert!(!header.marker_recovery());
        assert_eq!(header.pt_recovery(), 0x60);
        assert_eq!(header.sn_base(), Seq::from(0x7bc3u16));
        assert_eq!(header.ts_recovery(), 0x0d5c28f1);
        assert_eq!(header.length_recovery(), 0x0524);
        assert_eq!(header.columns(), 5);
        assert_eq!(header.rows(), 4);
        assert_eq!(header.sn_recovery(), 0x1a2b);
        assert_eq!(header.mask(), 0);
        assert_eq!(header.count(), 4);
        assert_eq!(header.media_depth_hint(), 40);
        assert_eq!(header.fec_depth_hint(), 10);
        assert_eq!(payload, &hex!("deadbeef")[..]);
    }

    #[test]
    fn rejects_bad_headers() {
        let short = hex!("80607bc3");
        assert!(matches!(
            FecHeader::from_bytes(&short[..]),
            Err(FecHeaderError::BufferTooShort(4))
        ));
        let legacy = hex!("00607bc30d5c28f1052405041a2b0004");
        assert!(matches!(
            FecHeader::from_bytes(&legacy[..]),
            Err(FecHeaderError::ExtensionFlagNotSet)
        ));
        let no_cols = hex!("80607bc30d5c28f1052400041a2b00040028000a");
        assert!(matches!(
            FecHeader::from_bytes(&no_cols[..]),
            Err(FecHeaderError::ZeroColumns)
        ));
        let no_rows = hex!("80607bc30d5c28f1052405001a2b00040028000a");
        assert!(matches!(
            FecHeader::from_bytes(&no_rows[..]),
            Err(FecHeaderError::ZeroRows)
        ));
    }

    #[test]
    fn membership_across_wrap() {
        // base 65530, stride 3, four rows
        let data = hex!("8000fffa000000000000030400000004000f000a");
        let header = FecHeader::from_bytes(&data[..]).unwrap();
        let members: Vec<u16> = header.member_seqs().map(u16::from).collect();
        assert_eq!(members, vec![65530, 65533, 1, 4]);
        for &m in &[65530u16, 65533, 1, 4] {
            assert!(header.associates_with(Seq::from(m)), "seq {}", m);
        }
        for &m in &[65531u16, 65529, 0, 3, 7] {
            assert!(!header.associates_with(Seq::from(m)), "seq {}", m);
        }
    }

    fn media_packet(seq: u16, ts: u32, payload: &[u8]) -> Vec<u8> {
        let mut pk = vec![0u8; RtpReader::MIN_HEADER_LEN + payload.len()];
        {
            let mut rtp = RtpHeaderMut::new(&mut pk[..]);
            rtp.set_version(2);
            rtp.set_payload_type(96);
            rtp.set_sequence(Seq::from(seq));
            rtp.set_timestamp(ts);
            rtp.set_ssrc(0x1234_5678);
        }
        pk[RtpReader::MIN_HEADER_LEN..].copy_from_slice(payload);
        pk
    }

    #[test]
    fn fold_is_self_inverse() {
        let a = media_packet(100, 9000, b"abcdefgh");
        let b = media_packet(101, 9090, b"ZYXWVUTSRQ");
        let mut buf = vec![0u8; FecHeader::EXT_HEADER_LEN + 10];
        {
            let mut fec = FecPacketMut::new(&mut buf[..]);
            fec.set_extended();
            fec.set_sn_base(Seq::from(100u16));
            fec.set_columns(1);
            fec.set_rows(2);
            fec.fold_source(Seq::from(100u16), &a[..]);
            fec.fold_source(Seq::from(101u16), &b[..]);
        }
        // folding `a` back out must leave exactly `b`'s fields
        {
            let mut fec = FecPacketMut::new(&mut buf[..]);
            fec.fold_source(Seq::from(100u16), &a[..]);
        }
        let header = FecHeader::from_bytes(&buf[..]).unwrap();
        assert_eq!(header.pt_recovery(), 96);
        assert_eq!(header.ts_recovery(), 9090);
        assert_eq!(header.length_recovery(), 10);
        assert_eq!(header.sn_recovery(), 101);
        assert_eq!(header.count(), 3);
        assert_eq!(&buf[FecHeader::EXT_HEADER_LEN..], &b"ZYXWVUTSRQ"[..]);
    }

    #[test]
    fn rtp_header_writer() {
        let mut buf = [0xffu8; 12];
        {
            let mut rtp = RtpHeaderMut::new(&mut buf[..]);
            rtp.set_version(2);
            rtp.set_padding(false);
            rtp.set_extension(false);
            rtp.set_csrc_count(0);
            rtp.set_marker(false);
            rtp.set_payload_type(33);
            rtp.set_sequence(Seq::from(0x0102u16));
            rtp.set_timestamp(0x0a0b0c0d);
            rtp.set_ssrc(0xdeadbeef);
        }
        let rtp = RtpReader::new(&buf[..]).unwrap();
        assert_eq!(rtp.payload_type(), 33);
        assert_eq!(rtp.sequence_number(), Seq::from(0x0102u16));
        assert_eq!(rtp.timestamp(), 0x0a0b0c0d);
        assert_eq!(rtp.ssrc(), 0xdeadbeef);
    }
}
