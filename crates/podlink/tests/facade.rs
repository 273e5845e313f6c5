use std::time::Duration;

use podlink::exchange::{Exchange, ExchangeConfig, ExchangeRequest, RadioCounters};
use podlink::frame::{PacketType, PdmMessage, RadioPacket};
use podlink::transport::{ScriptedRadio, TransmitParams};

const ADDR: u32 = 0x1f01_482a;

#[test]
fn status_exchange_through_reexports() {
    let radio = ScriptedRadio::new();
    let log = radio.log();

    let mut reply = PdmMessage::single(0x02, vec![0x08, 0x00])
        .get_radio_packets(ADDR, 1, ADDR, 1, false)
        .expect("reply should encode");
    reply[0].packet_type = PacketType::Pod;
    log.push_packet(&reply[0].serialize());

    let config = ExchangeConfig {
        exchange_params: TransmitParams {
            timeout: Duration::from_millis(1),
            ..TransmitParams::exchange()
        },
        final_ack_params: TransmitParams {
            timeout: Duration::from_millis(1),
            ..TransmitParams::final_ack()
        },
        final_ack_silence: Duration::from_millis(1),
        ..ExchangeConfig::default()
    };
    let mut exchange = Exchange::new(radio, RadioCounters::new(ADDR), config);
    let response = exchange
        .exchange(&ExchangeRequest::new(PdmMessage::single(0x0e, vec![0x00])))
        .expect("exchange should succeed");

    assert_eq!(response.part(0x02).expect("status part").payload.as_ref(), &[0x08, 0x00]);
    let last = log.transmissions().pop().expect("final ack sent");
    assert!(RadioPacket::parse(&last.data).expect("valid ack").is_final());
}
