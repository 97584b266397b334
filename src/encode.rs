//! Production of FEC packets covering an outbound RTP stream.
//!
//! The [`Encoder`] assigns each outbound media packet to one of `columns` interleaved groups in
//! round-robin order and XOR-accumulates it into that group's in-progress [`RecoveryRecord`];
//! after `rows` packets a group's record is complete and is emitted as a wire-ready FEC packet
//! to be sent alongside the media stream.
//!
//! ```plain
//!  media packets, in send order      FEC packets emitted
//!
//!  P0  P1  P2                        R0 = P0^P3^P6^P9
//!  P3  P4  P5                        R1 = P1^P4^P7^P10
//!  P6  P7  P8                        R2 = P2^P5^P8^P11
//!  P9  P10 P11
//! ```

use crate::header::FecHeader;
use crate::header::FecPacketMut;
use crate::header::RtpHeaderMut;
use crate::FecGeometry;
use crate::FecGeometryError;
use log::warn;
use rtp_rs::RtpReader;
use rtp_rs::Seq;

/// Errors which may occur while feeding media packets to the [`Encoder`]
#[derive(Debug)]
pub enum FecEncodeError {
    /// The media packet does not carry a well-formed RTP header
    Rtp(rtp_rs::RtpHeaderError),
    /// The media packet's payload does not fit the 16-bit length-recovery field
    PayloadTooLarge(usize),
}
impl From<rtp_rs::RtpHeaderError> for FecEncodeError {
    fn from(v: rtp_rs::RtpHeaderError) -> Self {
        FecEncodeError::Rtp(v)
    }
}

/// One in-progress FEC packet, accumulating the media packets of a single interleaved group.
///
/// The record owns the wire-format buffer from the start: a blank RTP header, the FEC header
/// with its group metadata, and the payload-recovery region, which grows (zero-extended) if a
/// later group member carries a longer payload than any seen before.
pub struct RecoveryRecord {
    buf: Vec<u8>,
}
impl RecoveryRecord {
    /// Creates a record for the group whose first media packet is `source`, with sequence number
    /// `seq`, and accumulates that first packet into it.
    ///
    /// Panics if `source` is shorter than a minimal RTP header.
    pub fn new(seq: Seq, geometry: FecGeometry, source: &[u8]) -> RecoveryRecord {
        assert!(source.len() >= RtpReader::MIN_HEADER_LEN);
        let payload_len = source.len() - RtpReader::MIN_HEADER_LEN;
        let mut buf =
            vec![0u8; RtpReader::MIN_HEADER_LEN + FecHeader::EXT_HEADER_LEN + payload_len];
        {
            let mut fec = FecPacketMut::new(&mut buf[RtpReader::MIN_HEADER_LEN..]);
            fec.set_extended();
            fec.set_sn_base(seq);
            fec.set_columns(geometry.columns);
            fec.set_rows(geometry.rows);
            fec.set_depth_hints(geometry.media_depth_hint(), geometry.fec_depth_hint());
        }
        let mut record = RecoveryRecord { buf };
        record.add(seq, source);
        record
    }

    /// XOR-accumulates a further media packet of the same group into this record.
    ///
    /// If the packet's payload is longer than any accumulated so far, the payload-recovery
    /// region is zero-extended first, so the bytes already accumulated keep their value and the
    /// new tail is the plain content of the longer payload.
    ///
    /// Panics if `source` is shorter than a minimal RTP header.
    pub fn add(&mut self, seq: Seq, source: &[u8]) {
        assert!(source.len() >= RtpReader::MIN_HEADER_LEN);
        let wire_len = source.len() + FecHeader::EXT_HEADER_LEN;
        if wire_len > self.buf.len() {
            self.buf.resize(wire_len, 0);
        }
        let mut fec = FecPacketMut::new(&mut self.buf[RtpReader::MIN_HEADER_LEN..]);
        fec.fold_source(seq, source);
    }

    fn header(&self) -> FecHeader<'_> {
        // the record was created with valid extended headers, so re-parsing cannot fail
        FecHeader::from_bytes(&self.buf[RtpReader::MIN_HEADER_LEN..])
            .expect("recovery record headers invalid")
    }

    /// The number of media packets accumulated so far.
    pub fn count(&self) -> u8 {
        self.header().count()
    }

    /// `true` once all `rows` media packets of the group have been accumulated.
    pub fn is_complete(&self) -> bool {
        self.header().count() == self.header().rows()
    }

    /// Finalizes the record's own RTP header and returns the wire-format FEC packet.
    pub fn into_packet(mut self, seq: Seq, payload_type: u8, ssrc: u32, timestamp: u32) -> Vec<u8> {
        let mut rtp = RtpHeaderMut::new(&mut self.buf[..]);
        rtp.set_version(2);
        rtp.set_csrc_count(0);
        rtp.set_marker(false);
        rtp.set_payload_type(payload_type);
        rtp.set_sequence(seq);
        rtp.set_timestamp(timestamp);
        rtp.set_ssrc(ssrc);
        self.buf
    }
}

/// The encoding matrix controller: routes outbound media packets to their column's
/// [`RecoveryRecord`] and emits each record as it completes.
pub struct Encoder {
    geometry: FecGeometry,
    started: bool,
    /// Sequence number of the first media packet of the current encoding block
    base_seq: Seq,
    slots: Vec<Option<RecoveryRecord>>,
    fec_seq: Seq,
    payload_type: u8,
    ssrc: u32,
}
impl Encoder {
    /// Creates a controller with all column slots empty.
    ///
    /// Emitted FEC packets form their own RTP stream with the given payload type and SSRC.
    pub fn new(
        columns: u8,
        rows: u8,
        payload_type: u8,
        ssrc: u32,
    ) -> Result<Encoder, FecGeometryError> {
        let geometry = FecGeometry::new(columns, rows)?;
        Ok(Encoder {
            geometry,
            started: false,
            base_seq: Seq::from(0u16),
            slots: (0..columns).map(|_| None).collect(),
            fec_seq: Seq::from(0u16),
            payload_type,
            ssrc,
        })
    }

    pub fn geometry(&self) -> FecGeometry {
        self.geometry
    }

    /// Accumulates one outbound media packet, returning the completed FEC packet if this packet
    /// finished its column.
    ///
    /// The media packet is only read; the caller sends it on unchanged.
    pub fn push(&mut self, source: &[u8]) -> Result<Option<Vec<u8>>, FecEncodeError> {
        let rtp = RtpReader::new(source)?;
        if source.len() - RtpReader::MIN_HEADER_LEN > usize::from(u16::max_value()) {
            return Err(FecEncodeError::PayloadTooLarge(source.len()));
        }
        let seq = rtp.sequence_number();
        let timestamp = rtp.timestamp();
        if !self.started {
            self.started = true;
            self.base_seq = seq;
        }
        let block_len = self.geometry.block_len();
        let mut offset = seq - self.base_seq;
        if offset < 0 {
            warn!(
                "media sequence {:?} behind encoding block base {:?}, restarting matrix",
                seq, self.base_seq
            );
            self.restart(seq);
            offset = 0;
        }
        while offset >= i32::from(block_len) {
            self.advance_block();
            offset -= i32::from(block_len);
        }
        let column = offset as u16 % u16::from(self.geometry.columns);
        let slot = &mut self.slots[usize::from(column)];
        let record = match slot.take() {
            None => RecoveryRecord::new(seq, self.geometry, source),
            Some(mut record) => {
                record.add(seq, source);
                record
            }
        };
        if record.is_complete() {
            let fec_seq = self.fec_seq;
            self.fec_seq = self.fec_seq.next();
            Ok(Some(record.into_packet(
                fec_seq,
                self.payload_type,
                self.ssrc,
                timestamp,
            )))
        } else {
            *slot = Some(record);
            Ok(None)
        }
    }

    /// Moves the block base forward by one whole block.
    ///
    /// A slot still holding a partial record at this point covers media packets that never all
    /// arrived; an incomplete record cannot be emitted, so it is dropped.
    fn advance_block(&mut self) {
        for (column, slot) in self.slots.iter_mut().enumerate() {
            if let Some(record) = slot.take() {
                warn!(
                    "dropping incomplete recovery record for column {} ({} of {} packets) at \
                     block advance",
                    column,
                    record.count(),
                    self.geometry.rows
                );
            }
        }
        self.base_seq = self.base_seq + self.geometry.block_len();
    }

    fn restart(&mut self, base_seq: Seq) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.base_seq = base_seq;
    }
}
