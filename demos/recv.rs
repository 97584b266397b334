//! Receives an RTP stream on one UDP port and its interleaved-FEC stream on a second port,
//! reporting packet loss and recovery statistics every couple of seconds.

use rtp_interleave_fec::heap_pool::HeapPacket;
use rtp_interleave_fec::heap_pool::HeapPool;
use rtp_interleave_fec::*;
use socket2::{Domain, Protocol, Socket, Type};
use std::cell;
use std::io;
use std::net::SocketAddr;
use std::rc;
use std::time;

const MAIN: mio::Token = mio::Token(0);
const FEC: mio::Token = mio::Token(1);

const PACKET_SIZE_MAX: usize = 1500;
const PACKET_COUNT_MAX: usize = 10 * 10 * 2;
const MAX_PACKET_BATCH: usize = 10;
const STATS_PERIOD: time::Duration = time::Duration::from_millis(2000);

struct Stats {
    packets: u64,
    losses: u64,
    recovered: u64,
}
impl Stats {
    fn dump(&self) {
        println!(
            "RTP: received={} uncorrectable={} corrected={}",
            self.packets, self.losses, self.recovered
        );
    }
}

struct MyReceiver {
    last_seq: Option<rtp_rs::Seq>,
    stats: rc::Rc<cell::RefCell<Stats>>,
}
impl Receiver<HeapPacket> for MyReceiver {
    fn receive(&mut self, packets: impl Iterator<Item = (HeapPacket, PacketStatus)>) {
        let mut stats = self.stats.borrow_mut();
        for (pk, pk_status) in packets {
            stats.packets += 1;
            if pk_status == PacketStatus::Recovered {
                stats.recovered += 1;
            }
            match rtp_rs::RtpReader::new(pk.payload()) {
                Ok(header) => {
                    let this_seq = header.sequence_number();
                    if let Some(last) = self.last_seq {
                        if !last.precedes(this_seq) {
                            let diff = this_seq - last;
                            if diff > 0 {
                                // if this_seq = 5, and last = 3, then diff will be '2', but
                                // actually we only lost a single packet (the one with seq=4),
                                // hence we subtract 1 here,
                                stats.losses += diff as u64 - 1;
                                println!(
                                    "Lost {} packets between {:?} and {:?}",
                                    diff - 1,
                                    last,
                                    this_seq
                                );
                            } else {
                                // A very large gap in sequence numbers could well mean that the
                                // sender has reset its sequence, or that the source has been down
                                // for so long that there may have been sequence number
                                // wrap-arounds (and without knowledge of the packet-rate we
                                // can't estimate this).  Therefore we just don't update the
                                // packet loss counter in this case.
                                println!(
                                    "Sequence number change of {} from {:?} to {:?}",
                                    diff, last, this_seq
                                );
                            }
                        }
                    }
                    self.last_seq = Some(this_seq);
                }
                Err(e) => println!("packet error {:?}", e),
            }
        }
    }
}

fn create_source(port: u16) -> Result<mio::net::UdpSocket, io::Error> {
    let s = Socket::new(Domain::ipv4(), Type::dgram(), Some(Protocol::udp()))?;
    s.set_recv_buffer_size(2 * 1024 * 1024)?;
    let addr = SocketAddr::new(
        "127.0.0.1"
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("{:?}", e)))?,
        port,
    );
    s.bind(&addr.into())?;
    let std_sock = s.into_udp_socket();
    std_sock.set_nonblocking(true)?;
    Ok(mio::net::UdpSocket::from_std(std_sock))
}

fn drain_socket(
    sock: &mio::net::UdpSocket,
    buffer_pool: &HeapPool,
    pk_buf: &mut Vec<HeapPacket>,
    mut submit: impl FnMut(&mut Vec<HeapPacket>),
) {
    loop {
        let mut pk = buffer_pool.allocate().expect("allocating buffer");
        let size = match sock.recv(pk.payload_mut()) {
            Ok(s) => s,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                break;
            }
            e => panic!("err={:?}", e),
        };
        pk.truncate(size);
        pk_buf.push(pk);
        if pk_buf.len() > MAX_PACKET_BATCH {
            submit(pk_buf);
        }
    }
    submit(pk_buf);
}

fn main() -> Result<(), std::io::Error> {
    env_logger::init();

    let stats = rc::Rc::new(cell::RefCell::new(Stats {
        packets: 0,
        losses: 0,
        recovered: 0,
    }));
    let base_port = 5000;
    let mut main_sock = create_source(base_port)?;
    let mut fec_sock = create_source(base_port + 2)?;

    let buffer_pool = HeapPool::new(PACKET_COUNT_MAX, PACKET_SIZE_MAX);
    let recv = MyReceiver {
        last_seq: None,
        stats: stats.clone(),
    };
    let mut decoder = Decoder::new(buffer_pool.clone(), recv);

    let mut poll = mio::Poll::new()?;
    poll.registry()
        .register(&mut main_sock, MAIN, mio::Interest::READABLE)?;
    poll.registry()
        .register(&mut fec_sock, FEC, mio::Interest::READABLE)?;

    let mut events = mio::Events::with_capacity(1024);
    let mut pk_buf = Vec::new();
    let mut last_dump = time::Instant::now();
    loop {
        poll.poll(&mut events, Some(STATS_PERIOD))?;
        for event in events.iter() {
            match event.token() {
                MAIN => {
                    drain_socket(&main_sock, &buffer_pool, &mut pk_buf, |batch| {
                        decoder
                            .add_main_packets(batch.drain(..))
                            .expect("decoding media packet");
                    });
                }
                FEC => {
                    drain_socket(&fec_sock, &buffer_pool, &mut pk_buf, |batch| {
                        decoder
                            .add_fec_packets(batch.drain(..))
                            .expect("decoding FEC packet");
                    });
                }
                t => panic!("unexpected {:?}", t),
            }
        }
        if last_dump.elapsed() >= STATS_PERIOD {
            stats.borrow().dump();
            last_dump = time::Instant::now();
        }
    }
}
