//! Relays an RTP stream received on one UDP port, adding an interleaved-FEC stream alongside
//! it: media packets are forwarded unchanged, and each completed FEC packet is sent to a
//! second port.

use log::info;
use rtp_interleave_fec::encode::Encoder;
use std::net::UdpSocket;

const COLUMNS: u8 = 5;
const ROWS: u8 = 4;
const FEC_PAYLOAD_TYPE: u8 = 97;

const PACKET_SIZE_MAX: usize = 1500;

fn main() -> Result<(), std::io::Error> {
    env_logger::init();

    let input = UdpSocket::bind("127.0.0.1:6000")?;
    let output = UdpSocket::bind("127.0.0.1:0")?;
    let media_out = "127.0.0.1:5000";
    let fec_out = "127.0.0.1:5002";

    let mut encoder = None;
    let mut buf = [0u8; PACKET_SIZE_MAX];
    let mut media_count = 0u64;
    let mut fec_count = 0u64;
    loop {
        let size = input.recv(&mut buf)?;
        let pk = &buf[..size];
        output.send_to(pk, media_out)?;
        media_count += 1;

        let rtp = match rtp_rs::RtpReader::new(pk) {
            Ok(rtp) => rtp,
            Err(e) => {
                info!("ignoring non-RTP packet: {:?}", e);
                continue;
            }
        };
        // the FEC stream shares the media stream's SSRC
        let enc = encoder.get_or_insert_with(|| {
            Encoder::new(COLUMNS, ROWS, FEC_PAYLOAD_TYPE, rtp.ssrc())
                .expect("interleave geometry invalid")
        });
        match enc.push(pk) {
            Ok(Some(fec_pk)) => {
                output.send_to(&fec_pk[..], fec_out)?;
                fec_count += 1;
                if fec_count % 100 == 0 {
                    info!("relayed {} media packets, sent {} FEC packets", media_count, fec_count);
                }
            }
            Ok(None) => {}
            Err(e) => info!("packet not added to FEC matrix: {:?}", e),
        }
    }
}
