//! Support for protecting RTP streams with interleaved single-parity Forward Error Correction:
//! an [`encode::Encoder`] that derives FEC packets from an outbound stream, and a [`Decoder`]
//! that buffers an inbound stream together with its FEC packets and reconstructs lost media
//! packets.
//!
//! Media packets are assigned round-robin to `columns` interleaved groups; each group
//! accumulates the XOR of `rows` packets' header fields and payloads into one FEC packet, so a
//! burst of up to `columns` consecutive losses costs each group at most one packet, and one
//! missing packet per group is recoverable.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, future_incompatible)]

pub mod encode;
pub mod header;
pub mod heap_pool;

use crate::header::FecHeader;
use crate::header::FecHeaderError;
use crate::header::FecPacketMut;
use crate::header::RtpHeaderMut;
use log::debug;
use log::warn;
use rtp_rs::RtpReader;
use rtp_rs::Seq;
use std::collections::VecDeque;
use std::iter;

/// Receives media packets as they leave the decoder's reordering window, in sequence order.
pub trait Receiver<P: Packet> {
    fn receive(&mut self, packets: impl Iterator<Item = (P, PacketStatus)>);
}

pub trait Packet: Sized {
    fn payload(&self) -> &[u8];
    fn payload_mut(&mut self) -> &mut [u8];

    /// reduce the size of the underlying buffer to the given value
    ///
    /// ##Panics
    ///
    /// Will panic if the given size is larger than the current packet size.
    fn truncate(&mut self, size: usize);
}

pub trait BufferPool {
    type P: Packet;

    fn allocate(&self) -> Option<Self::P>;
}

#[derive(Debug, PartialEq)]
pub enum PacketStatus {
    Received,
    Recovered,
}

/// Errors which may occur while validating interleave matrix dimensions
#[derive(Debug)]
pub enum FecGeometryError {
    BadNumberOfColumns(u8),
    BadNumberOfRows(u8),
    BadMatrixSize(u16),
}

/// Dimensions of the interleave matrix.
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct FecGeometry {
    /// Number of interleaved groups ('columns'); also the sequence-number stride within a group
    pub columns: u8,
    /// Number of media packets accumulated into each FEC packet
    pub rows: u8,
}
impl FecGeometry {
    /// The maximum overall size of the interleave matrix (rows * columns).
    ///
    /// A receiver buffers around two matrices worth of packets, and the reordering comparisons
    /// only remain transitive while the buffered span stays well inside half the 16-bit
    /// sequence space.
    pub const MAX_AREA: u16 = 0x2000;

    /// Validates the given dimensions.
    pub fn new(columns: u8, rows: u8) -> Result<FecGeometry, FecGeometryError> {
        let area = u16::from(columns) * u16::from(rows);
        if columns == 0 {
            Err(FecGeometryError::BadNumberOfColumns(columns))
        } else if rows == 0 {
            Err(FecGeometryError::BadNumberOfRows(rows))
        } else if area > Self::MAX_AREA {
            Err(FecGeometryError::BadMatrixSize(area))
        } else {
            Ok(FecGeometry { columns, rows })
        }
    }

    fn from_header(header: &FecHeader<'_>) -> Result<FecGeometry, FecGeometryError> {
        Self::new(header.columns(), header.rows())
    }

    fn matches(&self, header: &FecHeader<'_>) -> bool {
        self.columns == header.columns() && self.rows == header.rows()
    }

    /// Number of media packets making up one encoding block.
    pub fn block_len(&self) -> u16 {
        u16::from(self.columns) * u16::from(self.rows)
    }

    /// Reordering depth suggested to receivers for the media-packet queue.
    pub fn media_depth_hint(&self) -> u16 {
        self.block_len().saturating_mul(2)
    }

    /// Reordering depth suggested to receivers for the FEC-packet queue.
    pub fn fec_depth_hint(&self) -> u16 {
        u16::from(self.columns) * 2
    }
}

/// Outcome of [`PacketQueue::insert`].
#[derive(Debug, PartialEq)]
pub enum InsertOutcome {
    Inserted,
    /// An entry with the same sequence number was already queued; the new item has been dropped
    Duplicate,
}

struct QueueEntry<T> {
    seq: Seq,
    item: T,
}

/// A reordering queue: entries are kept in ascending sequence-number order under the
/// signed-16-bit-difference comparison, so a window of up to ±32767 sequence numbers stays
/// correctly ordered across wraparound.
///
/// The queue itself does not cap its depth; the owner is expected to watch [`depth`] and trade
/// the oldest entries away via [`pop`] to keep memory bounded.
///
/// [`depth`]: PacketQueue::depth
/// [`pop`]: PacketQueue::pop
pub struct PacketQueue<T> {
    entries: VecDeque<QueueEntry<T>>,
}
impl<T> PacketQueue<T> {
    pub fn new() -> PacketQueue<T> {
        PacketQueue {
            entries: VecDeque::new(),
        }
    }

    /// Inserts the given item at its position in the sequence order, or rejects it if an entry
    /// with the same sequence number is already queued (the rejected item is dropped).
    pub fn insert(&mut self, seq: Seq, item: T) -> InsertOutcome {
        let res = match self.entries.binary_search_by(|e| (e.seq - seq).cmp(&0)) {
            Ok(_) => InsertOutcome::Duplicate,
            Err(index) => {
                self.entries.insert(index, QueueEntry { seq, item });
                InsertOutcome::Inserted
            }
        };
        #[cfg(debug_assertions)]
        self.check();
        res
    }

    /// Removes and returns the entry with the lowest sequence number.
    pub fn pop(&mut self) -> Option<(Seq, T)> {
        self.entries.pop_front().map(|e| (e.seq, e.item))
    }

    /// Removes and returns the entry with the given sequence number, or `None` if no such entry
    /// is queued.
    pub fn remove(&mut self, seq: Seq) -> Option<T> {
        match self.entries.binary_search_by(|e| (e.seq - seq).cmp(&0)) {
            Ok(index) => self.entries.remove(index).map(|e| e.item),
            Err(_) => None,
        }
    }

    pub fn get(&self, seq: Seq) -> Option<&T> {
        match self.entries.binary_search_by(|e| (e.seq - seq).cmp(&0)) {
            Ok(index) => Some(&self.entries[index].item),
            Err(_) => None,
        }
    }

    pub fn contains(&self, seq: Seq) -> bool {
        self.get(seq).is_some()
    }

    /// The number of entries currently queued.
    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    pub fn front_seq(&self) -> Option<Seq> {
        self.entries.front().map(|e| e.seq)
    }

    pub fn back_seq(&self) -> Option<Seq> {
        self.entries.back().map(|e| e.seq)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Seq, &T)> + '_ {
        self.entries.iter().map(|e| (e.seq, &e.item))
    }

    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.entries.drain(..).map(|e| e.item)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(debug_assertions)]
    fn check(&self) {
        let mut last: Option<Seq> = None;
        for (i, e) in self.entries.iter().enumerate() {
            if let Some(prev) = last {
                assert!(e.seq - prev > 0, "entries out of order at index {}", i);
            }
            last = Some(e.seq);
        }
    }
}
impl<T> Default for PacketQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// How a buffered FEC packet's group currently stands against the media queue.
enum GroupStatus {
    /// More than one member is still absent but may yet arrive
    Waiting,
    /// Every member is present, so nothing was lost and the FEC packet has no work to do
    Complete,
    /// Exactly one member is absent and can be reconstructed
    Resolvable(Seq),
    /// An absent member has already left the window and can never be folded in
    Expired,
}

/// The rolling reassembly window: media and FEC packets buffered in sequence order, with lost
/// media packets reconstructed as soon as a FEC packet's group is one short of complete.
///
/// ```plain
///  media queue   P P P . P P P P . P   (ascending sequence order, gaps where packets are lost)
///  FEC queue     R R                   (each covers `rows` media packets, `columns` apart)
/// ```
struct FecWindow<BP: BufferPool, Recv: Receiver<BP::P>> {
    buffer_pool: BP,
    media: PacketQueue<(BP::P, PacketStatus)>,
    fec: PacketQueue<BP::P>,
    recv: Recv,
    limits: DepthLimits,
    /// The highest sequence number handed to the receiver so far; packets at or before this
    /// point are beyond recovery and beyond delivery
    delivered: Option<Seq>,
    seq_gone_backwards_count: usize,
}
impl<BP: BufferPool, Recv: Receiver<BP::P>> FecWindow<BP, Recv> {
    const SEQ_GONE_BACKWARDS_LIMIT: usize = 64;

    fn new(buffer_pool: BP, limits: DepthLimits, recv: Recv) -> FecWindow<BP, Recv> {
        FecWindow {
            buffer_pool,
            media: PacketQueue::new(),
            fec: PacketQueue::new(),
            recv,
            limits,
            delivered: None,
            seq_gone_backwards_count: 0,
        }
    }

    /// Hands all buffered media packets to the receiver and drops all buffered FEC packets.
    fn flush(&mut self) {
        if let Some(back) = self.media.back_seq() {
            self.delivered = Some(back);
        }
        let drained: Vec<_> = self.media.drain().collect();
        self.recv.receive(drained.into_iter());
        self.fec.clear();
    }

    fn dispose(mut self) -> (BP, Recv) {
        self.flush();
        (self.buffer_pool, self.recv)
    }

    fn insert_media(
        &mut self,
        seq: Seq,
        pk: BP::P,
        pk_status: PacketStatus,
        recovered: &mut arrayvec::ArrayVec<[BP::P; 10]>,
    ) -> Result<(), FecDecodeError> {
        if let Some(delivered) = self.delivered {
            if seq - delivered <= 0 {
                // Packets arriving behind the delivery point will be dropped, however that alone
                // could mean that if the sequence numbers are reset by the sender (e.g. the
                // sender is restarted), then we would drop all packets sent until we get to this
                // point in the sequence again.  Therefore, after SEQ_GONE_BACKWARDS_LIMIT such
                // packets in a row, we assume that the sender was restarted and reset all our
                // state, so that we can start successfully processing received packets in the
                // new sequence.
                self.seq_gone_backwards_count += 1;
                if self.seq_gone_backwards_count >= Self::SEQ_GONE_BACKWARDS_LIMIT {
                    warn!(
                        "packets already delivered up to {:?}, but received {} packets with \
                         earlier sequence numbers (most recently {:?}), resetting window",
                        self.delivered, self.seq_gone_backwards_count, seq
                    );
                    self.flush();
                    self.delivered = None;
                    self.seq_gone_backwards_count = 0;
                } else {
                    return Ok(());
                }
            }
        }
        // a packet recovered moments before its real copy arrived gets replaced by that copy
        let upgrade = pk_status == PacketStatus::Received
            && matches!(self.media.get(seq), Some((_, PacketStatus::Recovered)));
        if upgrade {
            self.media.remove(seq);
        }
        if let InsertOutcome::Duplicate = self.media.insert(seq, (pk, pk_status)) {
            debug!("dropping duplicate media packet {:?}", seq);
            return Ok(());
        }
        self.seq_gone_backwards_count = 0;

        // if we already have a FEC packet covering this media packet (because things arrived out
        // of sequence) then this arrival may be the one that makes a correction possible, or may
        // show that the covered group suffered no loss after all,
        if let Some(fec_seq) = self.find_associated_fec(seq) {
            self.try_correct(fec_seq, recovered)?;
        }
        self.evict();
        Ok(())
    }

    fn insert_fec(
        &mut self,
        seq: Seq,
        pk: BP::P,
        recovered: &mut arrayvec::ArrayVec<[BP::P; 10]>,
    ) -> Result<(), FecDecodeError> {
        if let InsertOutcome::Duplicate = self.fec.insert(seq, pk) {
            debug!("dropping duplicate FEC packet {:?}", seq);
            return Ok(());
        }
        self.try_correct(seq, recovered)?;
        self.evict();
        Ok(())
    }

    fn find_associated_fec(&self, media_seq: Seq) -> Option<Seq> {
        self.fec
            .iter()
            .filter_map(|(seq, pk)| RtpReader::new(pk.payload()).ok().map(|rtp| (seq, rtp)))
            .filter_map(|(seq, rtp)| FecHeader::from_bytes(rtp.payload()).ok().map(|h| (seq, h)))
            .find(|(_seq, hdr)| hdr.associates_with(media_seq))
            .map(|(seq, _hdr)| seq)
    }

    fn try_correct(
        &mut self,
        fec_seq: Seq,
        recovered: &mut arrayvec::ArrayVec<[BP::P; 10]>,
    ) -> Result<(), FecDecodeError> {
        let status = {
            let pk = match self.fec.get(fec_seq) {
                Some(pk) => pk,
                None => return Ok(()),
            };
            let rtp = match RtpReader::new(pk.payload()) {
                Ok(rtp) => rtp,
                Err(e) => {
                    warn!("FEC packet {:?} has a bad RTP header: {:?}", fec_seq, e);
                    return Ok(());
                }
            };
            match FecHeader::from_bytes(rtp.payload()) {
                Ok(header) => self.classify_group(&header),
                Err(e) => {
                    warn!("FEC packet {:?} has bad FEC headers: {:?}", fec_seq, e);
                    return Ok(());
                }
            }
        };
        match status {
            GroupStatus::Waiting => {}
            GroupStatus::Complete => {
                debug!("group of FEC packet {:?} complete, nothing lost", fec_seq);
                self.fec.remove(fec_seq);
            }
            GroupStatus::Expired => {
                debug!(
                    "group of FEC packet {:?} extends behind the reordering window",
                    fec_seq
                );
                self.fec.remove(fec_seq);
            }
            GroupStatus::Resolvable(missing_seq) => {
                if let Some(pk) = self.fec.remove(fec_seq) {
                    if let Some(out) = self.resolve(pk, missing_seq) {
                        recovered
                            .try_push(out)
                            .map_err(|_e| FecDecodeError::NoSpaceForRecovered)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn classify_group(&self, header: &FecHeader<'_>) -> GroupStatus {
        let mut missing = None;
        for seq in header.member_seqs() {
            if self.media.contains(seq) {
                continue;
            }
            // an absent member that was already passed to the receiver can neither be folded in
            // nor delivered again
            if let Some(delivered) = self.delivered {
                if seq - delivered <= 0 {
                    return GroupStatus::Expired;
                }
            }
            match missing {
                Some(_) => return GroupStatus::Waiting,
                None => missing = Some(seq),
            }
        }
        match missing {
            None => GroupStatus::Complete,
            Some(seq) => GroupStatus::Resolvable(seq),
        }
    }

    /// Folds every present group member into the (owned) FEC packet, leaving the recovery
    /// fields holding the missing packet's values, then builds that packet in a freshly
    /// allocated buffer.
    fn resolve(&mut self, mut fec_pk: BP::P, missing_seq: Seq) -> Option<BP::P> {
        let header_offset = {
            let rtp = RtpReader::new(fec_pk.payload()).ok()?;
            fec_pk.payload().len() - rtp.payload().len()
        };
        let members: Vec<Seq> = {
            let header = FecHeader::from_bytes(&fec_pk.payload()[header_offset..]).ok()?;
            header.member_seqs().collect()
        };
        for seq in members {
            if seq == missing_seq {
                continue;
            }
            if let Some((member, _)) = self.media.get(seq) {
                let mut fec = FecPacketMut::new(&mut fec_pk.payload_mut()[header_offset..]);
                fec.fold_source(seq, member.payload());
            }
        }
        {
            let header = FecHeader::from_bytes(&fec_pk.payload()[header_offset..]).ok()?;
            if Seq::from(header.sn_recovery()) != missing_seq {
                warn!(
                    "group algebra recovered sequence number {}, but was aiming for {:?}",
                    header.sn_recovery(),
                    missing_seq
                );
                return None;
            }
        }
        reconstruct(&self.buffer_pool, fec_pk.payload())
    }

    fn evict(&mut self) {
        if self.media.depth() > self.limits.media {
            let n = self.media.depth() - self.limits.media;
            let mut drained = Vec::with_capacity(n);
            for _ in 0..n {
                if let Some((seq, entry)) = self.media.pop() {
                    self.delivered = Some(seq);
                    drained.push(entry);
                }
            }
            self.recv.receive(drained.into_iter());
        }
        while self.fec.depth() > self.limits.fec {
            self.fec.pop();
        }
    }
}

/// Builds the media packet whose fields a FEC packet's recovery fields currently describe.
///
/// Once every group member but one has been folded into the FEC packet (see
/// [`FecPacketMut::fold_source`]), the recovery fields *are* the missing packet's original
/// field values, so this allocates a packet of `12 + length_recovery` bytes and populates it:
/// version 2, the recovered CSRC count, marker, payload type, sequence number, timestamp and
/// payload, with the SSRC copied from the FEC packet itself (it is invariant across a group).
///
/// The FEC packet is only read.  Returns `None` if the FEC packet's headers do not parse, if
/// the recovered length is implausible for the packet, or if the pool has no buffer to spare.
pub fn reconstruct<BP: BufferPool>(buffer_pool: &BP, fec_packet: &[u8]) -> Option<BP::P> {
    let rtp = match RtpReader::new(fec_packet) {
        Ok(rtp) => rtp,
        Err(e) => {
            warn!("{:?}", e);
            return None;
        }
    };
    let ssrc = rtp.ssrc();
    let (header, recovery) = match FecHeader::split_from_bytes(rtp.payload()) {
        Ok(res) => res,
        Err(e) => {
            warn!("{:?}", e);
            return None;
        }
    };
    let seq = Seq::from(header.sn_recovery());
    let len = usize::from(header.length_recovery());
    if len == 0 || len > recovery.len() {
        warn!(
            "recovered payload length {} implausible after attempt to recover {:?}",
            len, seq
        );
        return None;
    }
    let recovered = buffer_pool.allocate();
    if recovered.is_none() {
        warn!("failed to allocate buffer from pool");
        return None;
    }
    let mut recovered = recovered?;
    recovered.truncate(RtpReader::MIN_HEADER_LEN + len);
    let buf = recovered.payload_mut();
    buf[RtpReader::MIN_HEADER_LEN..].copy_from_slice(&recovery[..len]);
    let mut out = RtpHeaderMut::new(buf);
    // The version field is not part of the recovery; pretend it is '2' in the reconstructed
    // packet, so that downstream code can check versions without needing to know whether a
    // packet was subject to recovery.  The padding and extension flags are likewise cleared.
    out.set_version(2);
    out.set_padding(false);
    out.set_extension(false);
    out.set_csrc_count(header.cc_recovery());
    out.set_marker(header.marker_recovery());
    out.set_payload_type(header.pt_recovery());
    out.set_sequence(seq);
    out.set_timestamp(header.ts_recovery());
    out.set_ssrc(ssrc);
    Some(recovered)
}

/// Reordering-queue depth ceilings for a decode session.
#[derive(Debug, Clone, Copy)]
pub struct DepthLimits {
    pub media: usize,
    pub fec: usize,
}

#[derive(Debug)]
pub enum FecDecodeError {
    Rtp(rtp_rs::RtpHeaderError),
    Fec(FecHeaderError),
    /// Ran out of space trying to queue a recovered packet for further recovery processing
    NoSpaceForRecovered,
}
impl From<rtp_rs::RtpHeaderError> for FecDecodeError {
    fn from(v: rtp_rs::RtpHeaderError) -> Self {
        FecDecodeError::Rtp(v)
    }
}
impl From<FecHeaderError> for FecDecodeError {
    fn from(v: FecHeaderError) -> Self {
        FecDecodeError::Fec(v)
    }
}

enum State<BP: BufferPool, Recv: Receiver<BP::P>> {
    /// This state just exists so that we can overwrite some other state during the transition
    /// from one state to another.
    Init,
    Start(BP, Recv),
    Running {
        geometry: FecGeometry,
        window: FecWindow<BP, Recv>,
    },
}
impl<BP: BufferPool, Recv: Receiver<BP::P>> State<BP, Recv> {
    fn running(&mut self, geometry: FecGeometry, limits: DepthLimits) {
        *self = match std::mem::replace(self, State::Init) {
            State::Start(buffer_pool, recv) => State::Running {
                geometry,
                window: FecWindow::new(buffer_pool, limits, recv),
            },
            _ => panic!("Only State::Start is supported by running()"),
        }
    }

    fn reconfigure(&mut self, geometry: FecGeometry, limits: DepthLimits) {
        *self = match std::mem::replace(self, State::Init) {
            State::Running { window, .. } => {
                let (buffer_pool, recv) = window.dispose();
                State::Running {
                    geometry,
                    window: FecWindow::new(buffer_pool, limits, recv),
                }
            }
            _ => panic!("Only State::Running is supported by reconfigure()"),
        }
    }

    fn insert_main_packet(
        &mut self,
        seq: Seq,
        pk: BP::P,
        recovered: &mut arrayvec::ArrayVec<[BP::P; 10]>,
        pk_status: PacketStatus,
    ) -> Result<(), FecDecodeError> {
        match self {
            State::Init => panic!("self.state is State::Init"),
            // until a FEC packet has told us the interleave geometry there is no window to
            // buffer in; media packets pass straight through
            State::Start(_, recv) => {
                recv.receive(iter::once((pk, pk_status)));
                Ok(())
            }
            State::Running { window, .. } => window.insert_media(seq, pk, pk_status, recovered),
        }
    }

    fn insert_fec_packet(
        &mut self,
        seq: Seq,
        pk: BP::P,
        recovered: &mut arrayvec::ArrayVec<[BP::P; 10]>,
    ) -> Result<(), FecDecodeError> {
        match self {
            State::Init => panic!("self.state is State::Init"),
            State::Start(..) => Ok(()),
            State::Running { window, .. } => window.insert_fec(seq, pk, recovered),
        }
    }
}

/// Decoder state-machine for interleaved FEC.
///
/// The decoder owns the storage for all RTP packets being processed.  An application receiving
/// data from the network will borrow buffers from the decoder's [`BufferPool`] and arrange for
/// UDP packet payloads to be written into these; the pool's packets must be at least as large
/// as the largest packet the network can deliver.
///
/// Media packets are buffered in a reordering window sized from the FEC stream's interleave
/// geometry (or from [`Decoder::with_depth_limits`]) and handed to the [`Receiver`] in sequence
/// order as they leave the window; a lost packet whose group becomes one-short-of-complete is
/// reconstructed and delivered in its place, marked [`PacketStatus::Recovered`].  Note that this
/// does not attempt pacing: packets are passed on as soon as the window slides past them,
/// without regard for the timestamps they carry.
pub struct Decoder<BP: BufferPool, Recv: Receiver<BP::P>> {
    state: State<BP, Recv>,
    depth_limits: Option<DepthLimits>,
}
impl<BP: BufferPool, Recv: Receiver<BP::P>> Decoder<BP, Recv> {
    /// Creates a decoder which sizes its reordering window from the depth hints in the FEC
    /// stream's headers (falling back to twice the interleave matrix size).
    pub fn new(buffer_pool: BP, receiver: Recv) -> Decoder<BP, Recv> {
        Decoder {
            state: State::Start(buffer_pool, receiver),
            depth_limits: None,
        }
    }

    /// Creates a decoder with explicit reordering-window depth ceilings, ignoring the depth
    /// hints carried by the FEC stream.
    pub fn with_depth_limits(
        buffer_pool: BP,
        receiver: Recv,
        limits: DepthLimits,
    ) -> Decoder<BP, Recv> {
        Decoder {
            state: State::Start(buffer_pool, receiver),
            depth_limits: Some(limits),
        }
    }

    pub fn add_main_packets<T: Iterator<Item = BP::P>>(
        &mut self,
        pk: T,
    ) -> Result<(), FecDecodeError> {
        for p in pk {
            let seq = RtpReader::new(p.payload())?.sequence_number();
            let mut recovered = arrayvec::ArrayVec::<[_; 10]>::new();
            self.state
                .insert_main_packet(seq, p, &mut recovered, PacketStatus::Received)?;
            self.process_recovered(&mut recovered)?;
        }
        Ok(())
    }

    pub fn add_fec_packets<T: Iterator<Item = BP::P>>(
        &mut self,
        pk: T,
    ) -> Result<(), FecDecodeError> {
        for p in pk {
            let (seq, geometry_ok) = {
                let rtp = RtpReader::new(p.payload())?;
                let header = FecHeader::from_bytes(rtp.payload())?;
                let seq = rtp.sequence_number();
                (seq, self.merge_fec_parameters(&header))
            };
            if !geometry_ok {
                continue;
            }
            let mut recovered = arrayvec::ArrayVec::<[_; 10]>::new();
            self.state.insert_fec_packet(seq, p, &mut recovered)?;
            self.process_recovered(&mut recovered)?;
        }
        Ok(())
    }

    /// Hands every buffered media packet to the receiver and discards buffered FEC packets,
    /// e.g. because the input is stopped or paused.
    pub fn flush(&mut self) {
        if let State::Running { window, .. } = &mut self.state {
            window.flush();
        }
    }

    // the fixed capacity of the `recovered` list places an upper limit on the backlog of
    // recovered packets that can build up when one insertion makes further groups resolvable
    // in turn
    fn process_recovered(
        &mut self,
        recovered: &mut arrayvec::ArrayVec<[BP::P; 10]>,
    ) -> Result<(), FecDecodeError> {
        while let Some(pk) = recovered.pop() {
            let seq = RtpReader::new(pk.payload())?.sequence_number();
            self.state
                .insert_main_packet(seq, pk, recovered, PacketStatus::Recovered)?;
        }
        Ok(())
    }

    fn limits_for(&self, geometry: &FecGeometry, header: &FecHeader<'_>) -> DepthLimits {
        if let Some(limits) = self.depth_limits {
            return limits;
        }
        let media = if header.media_depth_hint() > 0 {
            header.media_depth_hint()
        } else {
            geometry.media_depth_hint()
        };
        let fec = if header.fec_depth_hint() > 0 {
            header.fec_depth_hint()
        } else {
            geometry.fec_depth_hint()
        };
        DepthLimits {
            media: usize::from(media),
            fec: usize::from(fec),
        }
    }

    fn merge_fec_parameters(&mut self, header: &FecHeader<'_>) -> bool {
        match self.state {
            State::Init => panic!("self.state is State::Init"),
            State::Start(..) => match FecGeometry::from_header(header) {
                Ok(geometry) => {
                    let limits = self.limits_for(&geometry, header);
                    self.state.running(geometry, limits);
                    true
                }
                Err(e) => {
                    debug!("ignoring FEC packet with unusable geometry: {:?}", e);
                    false
                }
            },
            State::Running { ref geometry, .. } => {
                if geometry.matches(header) {
                    true
                } else {
                    match FecGeometry::from_header(header) {
                        Ok(geom) => {
                            warn!(
                                "needed to reset FEC geometry from {:?} to {:?}",
                                geometry, geom
                            );
                            let limits = self.limits_for(&geom, header);
                            self.state.reconfigure(geom, limits);
                            true
                        }
                        Err(e) => {
                            warn!("ignoring FEC packet with unusable geometry: {:?}", e);
                            false
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::Encoder;
    use crate::heap_pool::HeapPacket;
    use crate::heap_pool::HeapPool;
    use std::cell;
    use std::rc::Rc;

    struct CollectingReceiver {
        packets: Rc<cell::RefCell<Vec<(HeapPacket, PacketStatus)>>>,
    }
    impl Receiver<HeapPacket> for CollectingReceiver {
        fn receive(&mut self, packets: impl Iterator<Item = (HeapPacket, PacketStatus)>) {
            self.packets.borrow_mut().extend(packets);
        }
    }

    type Collected = Rc<cell::RefCell<Vec<(HeapPacket, PacketStatus)>>>;

    fn collector() -> (CollectingReceiver, Collected) {
        let packets = Rc::new(cell::RefCell::new(Vec::new()));
        (
            CollectingReceiver {
                packets: packets.clone(),
            },
            packets,
        )
    }

    fn media_packet(seq: u16, ts: u32, payload: &[u8]) -> Vec<u8> {
        let mut pk = vec![0u8; RtpReader::MIN_HEADER_LEN + payload.len()];
        {
            let mut rtp = RtpHeaderMut::new(&mut pk[..]);
            rtp.set_version(2);
            rtp.set_payload_type(96);
            rtp.set_sequence(Seq::from(seq));
            rtp.set_timestamp(ts);
            rtp.set_ssrc(0x4242_4242);
        }
        pk[RtpReader::MIN_HEADER_LEN..].copy_from_slice(payload);
        pk
    }

    fn pool_packet(pool: &HeapPool, bytes: &[u8]) -> HeapPacket {
        let mut pk = pool.allocate().expect("pool exhausted");
        pk.payload_mut()[..bytes.len()].copy_from_slice(bytes);
        pk.truncate(bytes.len());
        pk
    }

    fn encode_stream(
        encoder: &mut Encoder,
        originals: &[Vec<u8>],
    ) -> Vec<Vec<u8>> {
        let mut fec_packets = Vec::new();
        for pk in originals {
            if let Some(fec) = encoder.push(&pk[..]).unwrap() {
                fec_packets.push(fec);
            }
        }
        fec_packets
    }

    #[test]
    fn ordered_insert_with_duplicate_rejection() {
        let mut queue = PacketQueue::new();
        for &seq in &[5u16, 3, 3, 7, 1] {
            queue.insert(Seq::from(seq), seq);
        }
        assert_eq!(queue.depth(), 4);
        let seqs: Vec<u16> = queue.iter().map(|(s, _)| u16::from(s)).collect();
        assert_eq!(seqs, vec![1, 3, 5, 7]);
    }

    #[test]
    fn depth_bookkeeping() {
        let mut queue = PacketQueue::new();
        assert_eq!(
            queue.insert(Seq::from(10u16), "ten"),
            InsertOutcome::Inserted
        );
        assert_eq!(
            queue.insert(Seq::from(30u16), "thirty"),
            InsertOutcome::Inserted
        );
        assert_eq!(
            queue.insert(Seq::from(20u16), "twenty"),
            InsertOutcome::Inserted
        );
        assert_eq!(queue.depth(), 3);
        assert_eq!(queue.pop(), Some((Seq::from(10u16), "ten")));
        assert_eq!(queue.depth(), 2);
        assert_eq!(queue.remove(Seq::from(20u16)), Some("twenty"));
        assert_eq!(queue.depth(), 1);
        assert_eq!(queue.remove(Seq::from(20u16)), None);
        assert_eq!(queue.depth(), 1);
    }

    #[test]
    fn ordering_across_wraparound() {
        let mut queue = PacketQueue::new();
        for &seq in &[65534u16, 1, 65535, 0] {
            queue.insert(Seq::from(seq), seq);
        }
        let seqs: Vec<u16> = queue.iter().map(|(s, _)| u16::from(s)).collect();
        assert_eq!(seqs, vec![65534, 65535, 0, 1]);
        assert_eq!(queue.front_seq(), Some(Seq::from(65534u16)));
        assert_eq!(queue.back_seq(), Some(Seq::from(1u16)));
    }

    #[test]
    fn media_passes_through_before_geometry_is_known() {
        let pool = HeapPool::new(4, 1500);
        let (recv, collected) = collector();
        let mut decoder = Decoder::new(pool.clone(), recv);
        let pk = pool_packet(&pool, &media_packet(1, 100, b"hello")[..]);
        decoder.add_main_packets(vec![pk].into_iter()).unwrap();
        let collected = collected.borrow();
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].1, PacketStatus::Received);
    }

    /// Runs a 2-column, 3-row stream of six media packets through encoder and decoder, dropping
    /// the media packet with the given sequence number on the way, and requires the receiver to
    /// see the whole stream in order with the lost packet rebuilt byte-for-byte.
    fn round_trip_with_loss(lost_seq: u16) {
        let mut encoder = Encoder::new(2, 3, 97, 0x4242_4242).unwrap();
        let originals: Vec<Vec<u8>> = (0u16..6)
            .map(|seq| {
                media_packet(
                    seq,
                    90_000 + u32::from(seq),
                    format!("payload {}", seq).as_bytes(),
                )
            })
            .collect();
        let fec_packets = encode_stream(&mut encoder, &originals);
        assert_eq!(fec_packets.len(), 2);

        let pool = HeapPool::new(16, 1500);
        let (recv, collected) = collector();
        let mut decoder = Decoder::new(pool.clone(), recv);
        decoder
            .add_fec_packets(
                fec_packets
                    .iter()
                    .map(|pk| pool_packet(&pool, &pk[..]))
                    .collect::<Vec<_>>()
                    .into_iter(),
            )
            .unwrap();
        decoder
            .add_main_packets(
                originals
                    .iter()
                    .filter(|pk| {
                        RtpReader::new(&pk[..]).unwrap().sequence_number() != Seq::from(lost_seq)
                    })
                    .map(|pk| pool_packet(&pool, &pk[..]))
                    .collect::<Vec<_>>()
                    .into_iter(),
            )
            .unwrap();
        decoder.flush();

        let collected = collected.borrow();
        assert_eq!(collected.len(), 6);
        for (i, (pk, status)) in collected.iter().enumerate() {
            let rtp = RtpReader::new(pk.payload()).unwrap();
            assert_eq!(rtp.sequence_number(), Seq::from(i as u16));
            if i as u16 == lost_seq {
                assert_eq!(*status, PacketStatus::Recovered, "packet {}", i);
            } else {
                assert_eq!(*status, PacketStatus::Received, "packet {}", i);
            }
            assert_eq!(pk.payload(), &originals[i][..], "packet {}", i);
        }
    }

    #[test]
    fn recovers_a_lost_packet_wherever_it_sits_in_its_column() {
        // mid-column, end-of-column, and the very first packet of the block
        round_trip_with_loss(2);
        round_trip_with_loss(5);
        round_trip_with_loss(0);
    }

    #[test]
    fn lossless_group_leaves_nothing_recovered() {
        let mut encoder = Encoder::new(1, 3, 97, 7).unwrap();
        let originals: Vec<Vec<u8>> = (0u16..3).map(|s| media_packet(s, 100, b"data")).collect();
        let fec_packets = encode_stream(&mut encoder, &originals);
        let pool = HeapPool::new(8, 1500);
        let (recv, collected) = collector();
        let mut decoder = Decoder::new(pool.clone(), recv);
        decoder
            .add_fec_packets(
                fec_packets
                    .iter()
                    .map(|pk| pool_packet(&pool, &pk[..]))
                    .collect::<Vec<_>>()
                    .into_iter(),
            )
            .unwrap();
        decoder
            .add_main_packets(
                originals
                    .iter()
                    .map(|pk| pool_packet(&pool, &pk[..]))
                    .collect::<Vec<_>>()
                    .into_iter(),
            )
            .unwrap();
        decoder.flush();
        let collected = collected.borrow();
        assert_eq!(collected.len(), 3);
        assert!(collected
            .iter()
            .all(|(_, status)| *status == PacketStatus::Received));
    }

    #[test]
    fn two_losses_in_one_group_are_unrecoverable() {
        let mut encoder = Encoder::new(1, 4, 97, 7).unwrap();
        let originals: Vec<Vec<u8>> = (0u16..4).map(|s| media_packet(s, 100, b"data")).collect();
        let fec_packets = encode_stream(&mut encoder, &originals);
        let pool = HeapPool::new(8, 1500);
        let (recv, collected) = collector();
        let mut decoder = Decoder::new(pool.clone(), recv);
        decoder
            .add_fec_packets(
                fec_packets
                    .iter()
                    .map(|pk| pool_packet(&pool, &pk[..]))
                    .collect::<Vec<_>>()
                    .into_iter(),
            )
            .unwrap();
        // lose seqs 1 and 2: a single-parity group cannot rebuild two packets
        decoder
            .add_main_packets(
                vec![
                    pool_packet(&pool, &originals[0][..]),
                    pool_packet(&pool, &originals[3][..]),
                ]
                .into_iter(),
            )
            .unwrap();
        decoder.flush();
        let collected = collected.borrow();
        assert_eq!(collected.len(), 2);
        assert!(collected
            .iter()
            .all(|(_, status)| *status == PacketStatus::Received));
    }

    #[test]
    fn pool_exhaustion_skips_recovery() {
        let mut encoder = Encoder::new(1, 2, 97, 7).unwrap();
        let originals: Vec<Vec<u8>> = (0u16..2).map(|s| media_packet(s, 100, b"data")).collect();
        let fec_packets = encode_stream(&mut encoder, &originals);
        // room for the two input packets and nothing else
        let pool = HeapPool::new(2, 1500);
        let (recv, collected) = collector();
        let mut decoder = Decoder::new(pool.clone(), recv);
        let fec_pk = pool_packet(&pool, &fec_packets[0][..]);
        let media_pk = pool_packet(&pool, &originals[0][..]);
        decoder.add_fec_packets(vec![fec_pk].into_iter()).unwrap();
        decoder
            .add_main_packets(vec![media_pk].into_iter())
            .unwrap();
        decoder.flush();
        let collected = collected.borrow();
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].1, PacketStatus::Received);
    }

    #[test]
    fn window_evicts_in_sequence_order() {
        let mut encoder = Encoder::new(1, 2, 97, 7).unwrap();
        let originals: Vec<Vec<u8>> = (0u16..8).map(|s| media_packet(s, 100, b"data")).collect();
        let fec_packets = encode_stream(&mut encoder, &originals);
        let pool = HeapPool::new(16, 1500);
        let (recv, collected) = collector();
        let mut decoder =
            Decoder::with_depth_limits(pool.clone(), recv, DepthLimits { media: 2, fec: 2 });
        decoder
            .add_fec_packets(vec![pool_packet(&pool, &fec_packets[0][..])].into_iter())
            .unwrap();
        decoder
            .add_main_packets(
                originals
                    .iter()
                    .map(|pk| pool_packet(&pool, &pk[..]))
                    .collect::<Vec<_>>()
                    .into_iter(),
            )
            .unwrap();
        decoder.flush();
        let collected = collected.borrow();
        assert_eq!(collected.len(), 8);
        for (i, (pk, _)) in collected.iter().enumerate() {
            let rtp = RtpReader::new(pk.payload()).unwrap();
            assert_eq!(rtp.sequence_number(), Seq::from(i as u16));
        }
    }

    #[test]
    fn late_copy_of_delivered_packet_is_dropped() {
        let mut encoder = Encoder::new(1, 2, 97, 7).unwrap();
        let originals: Vec<Vec<u8>> = (0u16..4).map(|s| media_packet(s, 100, b"data")).collect();
        let fec_packets = encode_stream(&mut encoder, &originals);
        let pool = HeapPool::new(16, 1500);
        let (recv, collected) = collector();
        let mut decoder =
            Decoder::with_depth_limits(pool.clone(), recv, DepthLimits { media: 1, fec: 1 });
        decoder
            .add_fec_packets(vec![pool_packet(&pool, &fec_packets[0][..])].into_iter())
            .unwrap();
        decoder
            .add_main_packets(
                originals
                    .iter()
                    .map(|pk| pool_packet(&pool, &pk[..]))
                    .collect::<Vec<_>>()
                    .into_iter(),
            )
            .unwrap();
        // seq 0 has already been handed to the receiver; a straggling copy must not re-enter
        let straggler = pool_packet(&pool, &originals[0][..]);
        decoder.add_main_packets(vec![straggler].into_iter()).unwrap();
        decoder.flush();
        let collected = collected.borrow();
        assert_eq!(collected.len(), 4);
        for (i, (pk, _)) in collected.iter().enumerate() {
            let rtp = RtpReader::new(pk.payload()).unwrap();
            assert_eq!(rtp.sequence_number(), Seq::from(i as u16));
        }
    }
}
