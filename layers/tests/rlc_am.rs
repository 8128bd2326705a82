//! RLC scenario tests
//!
//! Two engines exchange PDUs through their bearers' MAC queues; timers are
//! ticked by hand.

use bytes::Bytes;
use interfaces::{message_queue, BearerRef, LayerMessage, MessageReceiver};
use layers::rb::{RadioBearer, AM_WINDOW_SIZE};
use layers::rlc::pdu::{AmdHeader, AmdPdu, FramingInfo, PollBit, StatusPdu};
use layers::rlc::sn::{sn_add, sn_offset, SN_MODULUS_10};
use layers::rlc::{RlcConfig, RlcEngine, RlcMode};
use layers::timer::TimerManager;
use layers::user::{User, UserConfig};
use layers::user_mgr::UserManager;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

struct Side {
    timer_mgr: Arc<TimerManager>,
    users: Arc<UserManager>,
    engine: RlcEngine,
    mac_rx: MessageReceiver,
    pdcp_rx: MessageReceiver,
    _rrc_rx: MessageReceiver,
    user: Arc<User>,
    rb: Arc<RadioBearer>,
}

impl Side {
    fn new(rlc: RlcConfig, max_dl: u32, mode: RlcMode) -> Self {
        let timer_mgr = Arc::new(TimerManager::new());
        let (rrc_tx, rrc_rx) = message_queue("rrc");
        let (mac_tx, mac_rx) = message_queue("mac");
        let (pdcp_tx, pdcp_rx) = message_queue("pdcp");

        let user_config = UserConfig {
            max_dl_bytes_per_subframe: max_dl,
            inactivity_timer_ms: u32::MAX,
            c_rnti_reservation_ms: u32::MAX,
            ..Default::default()
        };
        let users = UserManager::new(user_config, rlc.clone(), timer_mgr.clone(), rrc_tx);
        let engine = RlcEngine::new(rlc, mac_tx, pdcp_tx).unwrap();

        let user = users.add_user().unwrap();
        let rb = match mode {
            RlcMode::Am => user.setup_srb1().unwrap(),
            _ => user.setup_drb(1).unwrap(),
        };
        rb.set_rlc_config(mode);

        Self {
            timer_mgr,
            users,
            engine,
            mac_rx,
            pdcp_rx,
            _rrc_rx: rrc_rx,
            user,
            rb,
        }
    }

    fn bearer(&self) -> BearerRef {
        BearerRef::new(self.user.c_rnti().unwrap(), self.rb.id())
    }

    fn send_sdu(&self, sdu: Bytes) {
        self.rb.rlc_sdu_queue().push(sdu);
        self.engine
            .handle_msg(&LayerMessage::RlcSduReady(self.bearer()), &self.users);
    }

    fn receive_pdu(&self, pdu: Bytes) {
        self.rb.rlc_pdu_queue().push(pdu);
        self.engine
            .handle_msg(&LayerMessage::RlcPduReady(self.bearer()), &self.users);
    }

    fn delivered(&mut self) -> Vec<Bytes> {
        self.pdcp_rx
            .drain()
            .into_iter()
            .map(|msg| {
                assert_eq!(msg, LayerMessage::PdcpPduReady(self.bearer()));
                self.rb.pdcp_pdu_queue().pop().unwrap()
            })
            .collect()
    }

    fn tick(&self) {
        self.timer_mgr.handle_msg(&LayerMessage::TimerTick);
    }
}

/// Carry every MAC SDU queued on `from` to `to`, unless `lose` drops it
fn transfer(from: &mut Side, to: &Side, lose: &mut dyn FnMut(&Bytes) -> bool) -> usize {
    let signals = from.mac_rx.drain();
    for signal in &signals {
        assert_eq!(*signal, LayerMessage::MacSduReady(from.bearer()));
        let pdu = from.rb.mac_sdu_queue().pop().unwrap();
        if !lose(&pdu) {
            to.receive_pdu(pdu);
        }
    }
    signals.len()
}

/// Exchange PDUs in both directions until neither side has anything queued
fn pump(a: &mut Side, b: &mut Side, lose: &mut dyn FnMut(&Bytes) -> bool) {
    loop {
        let carried = transfer(a, b, lose) + transfer(b, a, lose);
        if carried == 0 {
            break;
        }
    }
}

fn lossless(_: &Bytes) -> bool {
    false
}

/// VT(S) may run past VT(MS), but only while units beyond the window are held
fn assert_windows(rb: &RadioBearer) {
    let stats = rb.stats();
    assert!(sn_offset(stats.vr_h, stats.vr_r, SN_MODULUS_10) <= AM_WINDOW_SIZE);
    assert_eq!(stats.vr_mr, sn_add(stats.vr_r, AM_WINDOW_SIZE, SN_MODULUS_10));
    let outstanding = sn_offset(stats.vt_s, stats.vt_a, SN_MODULUS_10);
    assert!(stats.am_tx_buffered <= outstanding as usize);
    assert!(outstanding <= AM_WINDOW_SIZE || stats.am_tx_buffered > 0);
    assert_eq!(stats.vt_ms, sn_add(stats.vt_a, AM_WINDOW_SIZE, SN_MODULUS_10));
    assert_eq!(stats.t_poll_retransmit_running, stats.am_tx_buffered > 0);
}

/// Pop every PDU signalled on the MAC queue of `side`
fn take_mac_pdus(side: &mut Side) -> Vec<Bytes> {
    let signals = side.mac_rx.drain();
    signals
        .iter()
        .map(|_| side.rb.mac_sdu_queue().pop().unwrap())
        .collect()
}

fn sn_of(pdu: &Bytes) -> u16 {
    AmdPdu::unpack(pdu).unwrap()[0].sn()
}

fn random_sdu(rng: &mut StdRng, max_len: usize) -> Bytes {
    let len = rng.gen_range(1..=max_len);
    Bytes::from((0..len).map(|_| rng.gen::<u8>()).collect::<Vec<u8>>())
}

#[test]
fn test_single_full_sdu() {
    let mut a = Side::new(RlcConfig::default(), 325, RlcMode::Am);
    let mut b = Side::new(RlcConfig::default(), 325, RlcMode::Am);
    let sdu = Bytes::from(vec![0x5A; 100]);

    a.send_sdu(sdu.clone());
    assert_eq!(a.rb.rlc_vts(), 1);
    assert_eq!(a.rb.rlc_transmission_buffer_unit(0).unwrap().fi(), FramingInfo::FullSdu);
    assert_eq!(a.mac_rx.try_recv(), Some(LayerMessage::MacSduReady(a.bearer())));
    b.receive_pdu(a.rb.mac_sdu_queue().pop().unwrap());

    assert_eq!(b.delivered(), vec![sdu]);
    pump(&mut b, &mut a, &mut lossless);

    assert_eq!(a.rb.rlc_vta(), 1);
    assert_eq!(a.rb.rlc_transmission_buffer_len(), 0);
    assert!(!a.rb.rlc_t_poll_retransmit_running());
}

#[test]
fn test_three_segment_sdu() {
    let mut a = Side::new(RlcConfig::default(), 100, RlcMode::Am);
    let mut b = Side::new(RlcConfig::default(), 100, RlcMode::Am);
    let sdu = Bytes::from((0..250).map(|i| i as u8).collect::<Vec<u8>>());

    a.send_sdu(sdu.clone());
    assert_eq!(a.rb.rlc_vts(), 3);
    let framing: Vec<_> = (0..3)
        .map(|sn| {
            let unit = a.rb.rlc_transmission_buffer_unit(sn).unwrap();
            (unit.fi(), unit.data.len())
        })
        .collect();
    assert_eq!(
        framing,
        vec![
            (FramingInfo::FirstSduSegment, 100),
            (FramingInfo::MiddleSduSegment, 100),
            (FramingInfo::LastSduSegment, 50),
        ]
    );

    pump(&mut a, &mut b, &mut lossless);
    assert_eq!(b.delivered(), vec![sdu]);
    assert_eq!(a.rb.rlc_vta(), 3);
    assert!(!a.rb.rlc_t_poll_retransmit_running());
}

#[test]
fn test_status_cleans_up_transmission_buffer() {
    let mut a = Side::new(RlcConfig::default(), 325, RlcMode::Am);
    let mut b = Side::new(RlcConfig::default(), 325, RlcMode::Am);
    a.rb.set_rlc_vta(10);
    a.rb.set_rlc_vts(10);
    b.rb.set_rlc_vrr(10);
    b.rb.set_rlc_vrh(10);

    for i in 0..4u8 {
        a.send_sdu(Bytes::from(vec![i; 20]));
    }
    for sn in 10..14 {
        assert!(a.rb.rlc_transmission_buffer_unit(sn).is_some());
    }
    assert!(a.rb.rlc_t_poll_retransmit_running());

    // Deliver the data but lose every status on the way back
    transfer(&mut a, &b, &mut lossless);
    transfer(&mut b, &a, &mut |_: &Bytes| true);
    assert_eq!(b.delivered().len(), 4);
    assert_eq!(a.rb.rlc_transmission_buffer_len(), 4);

    let status = b.rb.rlc_get_am_reception_buffer_status();
    assert_eq!(status, StatusPdu { ack_sn: 14, nack_sn: vec![] });
    a.receive_pdu(status.pack());

    assert_eq!(a.rb.rlc_transmission_buffer_len(), 0);
    assert_eq!(a.rb.rlc_vta(), 14);
    assert_eq!(a.rb.rlc_vtms(), 14 + AM_WINDOW_SIZE);
    assert!(!a.rb.rlc_t_poll_retransmit_running());
}

#[test]
fn test_out_of_window_rejection() {
    let mut b = Side::new(RlcConfig::default(), 325, RlcMode::Am);

    let stray = AmdPdu::new(
        AmdHeader::new(FramingInfo::FullSdu, 600, PollBit::Requested),
        Bytes::from_static(b"stray"),
    );
    b.receive_pdu(stray.pack().unwrap());
    assert_eq!(b.rb.stats().am_rx_buffered, 0);
    assert_eq!(b.rb.rlc_vrh(), 0);

    // Still answered with a status report
    assert_eq!(b.mac_rx.drain().len(), 1);
    let status = StatusPdu::unpack(&b.rb.mac_sdu_queue().pop().unwrap()).unwrap();
    assert_eq!(status, StatusPdu { ack_sn: 0, nack_sn: vec![] });

    let valid = AmdPdu::new(
        AmdHeader::new(FramingInfo::FullSdu, 0, PollBit::Requested),
        Bytes::from_static(b"valid"),
    );
    b.receive_pdu(valid.pack().unwrap());
    assert_eq!(b.delivered(), vec![Bytes::from_static(b"valid")]);
    assert_eq!(b.rb.stats().am_rx_buffered, 0);
}

#[test]
fn test_held_units_released_as_window_advances() {
    let mut a = Side::new(RlcConfig::default(), 325, RlcMode::Am);
    let mut b = Side::new(RlcConfig::default(), 325, RlcMode::Am);
    let sdus: Vec<Bytes> = (0..600u32).map(|i| Bytes::from(format!("sdu {i}"))).collect();
    for sdu in &sdus {
        a.send_sdu(sdu.clone());
    }

    let stats = a.rb.stats();
    assert_eq!((stats.vt_a, stats.vt_ms, stats.vt_s), (0, 512, 600));
    assert_eq!(stats.am_tx_buffered, 600);
    assert_windows(&a.rb);

    let mut in_flight = take_mac_pdus(&mut a);
    let sns: Vec<u16> = in_flight.iter().map(sn_of).collect();
    assert_eq!(sns, (0..AM_WINDOW_SIZE).collect::<Vec<_>>());

    // The peer sees the first 100 units but its reports never arrive
    for pdu in in_flight.drain(..100) {
        b.receive_pdu(pdu);
    }
    take_mac_pdus(&mut b);
    let status = b.rb.rlc_get_am_reception_buffer_status();
    assert_eq!(status, StatusPdu { ack_sn: 100, nack_sn: vec![] });
    a.receive_pdu(status.pack());

    let stats = a.rb.stats();
    assert_eq!((stats.vt_a, stats.vt_ms, stats.vt_s), (100, 612, 600));
    assert_eq!(stats.am_tx_buffered, 500);
    assert_windows(&a.rb);
    let released = take_mac_pdus(&mut a);
    let sns: Vec<u16> = released.iter().map(sn_of).collect();
    assert_eq!(sns, (512..600).collect::<Vec<_>>());

    for pdu in in_flight.into_iter().chain(released) {
        b.receive_pdu(pdu);
    }
    pump(&mut a, &mut b, &mut lossless);

    assert_eq!(b.delivered(), sdus);
    let stats = a.rb.stats();
    assert_eq!((stats.vt_a, stats.vt_ms, stats.vt_s), (600, 88, 600));
    assert_eq!(stats.am_tx_buffered, 0);
    assert!(!stats.t_poll_retransmit_running);
    assert_windows(&a.rb);
    assert_windows(&b.rb);
}

#[test]
fn test_arq_converges_after_loss() {
    let mut a = Side::new(RlcConfig::default(), 40, RlcMode::Am);
    let mut b = Side::new(RlcConfig::default(), 40, RlcMode::Am);
    let mut rng = StdRng::seed_from_u64(0x5EED_0001);
    let sdus: Vec<Bytes> = (0..40).map(|_| random_sdu(&mut rng, 120)).collect();

    let mut loss = StdRng::seed_from_u64(0x5EED_0002);
    for sdu in &sdus {
        a.send_sdu(sdu.clone());
        pump(&mut a, &mut b, &mut |_: &Bytes| loss.gen_bool(0.3));
        assert_windows(&a.rb);
        assert_windows(&b.rb);
    }

    let mut ticks = 0;
    while a.rb.rlc_transmission_buffer_len() > 0 {
        a.tick();
        b.tick();
        pump(&mut a, &mut b, &mut lossless);
        assert_windows(&a.rb);
        assert_windows(&b.rb);

        ticks += 1;
        assert!(ticks < 50_000, "ARQ did not converge");
    }

    assert_eq!(a.rb.rlc_vta(), a.rb.rlc_vts());
    assert!(!a.rb.rlc_t_poll_retransmit_running());

    let mut delivered = b.delivered();
    let mut expected = sdus.clone();
    delivered.sort();
    expected.sort();
    assert_eq!(delivered, expected);
}

#[test]
fn test_seeded_round_trip_across_sn_wrap() {
    let mut a = Side::new(RlcConfig::default(), 325, RlcMode::Am);
    let mut b = Side::new(RlcConfig::default(), 325, RlcMode::Am);
    let mut rng = StdRng::seed_from_u64(0xA11CE);

    let mut total_sns = 0u32;
    for _ in 0..250 {
        let max_bytes = rng.gen_range(16..=300u32);
        a.user.set_max_dl_bytes_per_subframe(max_bytes);
        let sdu = random_sdu(&mut rng, 1500);
        let expected_sns = (sdu.len() as u32).div_ceil(max_bytes);

        let before = a.rb.rlc_vts();
        a.send_sdu(sdu.clone());
        assert_eq!(
            sn_offset(a.rb.rlc_vts(), before, SN_MODULUS_10) as u32,
            expected_sns
        );
        total_sns += expected_sns;

        pump(&mut a, &mut b, &mut lossless);
        assert_eq!(b.delivered(), vec![sdu]);
        assert_windows(&a.rb);
        assert_windows(&b.rb);
    }

    assert!(total_sns > SN_MODULUS_10 as u32);
    assert_eq!(a.rb.rlc_transmission_buffer_len(), 0);
    assert_eq!(b.rb.stats().am_rx_buffered, 0);
}

#[test]
fn test_um_round_trip_with_short_sn() {
    let config = RlcConfig {
        um_sn_size: 5,
        ..Default::default()
    };
    let mut a = Side::new(config.clone(), 50, RlcMode::Um);
    let mut b = Side::new(config, 50, RlcMode::Um);
    assert_eq!(b.rb.rlc_um_window_size(), 16);
    let mut rng = StdRng::seed_from_u64(0xB0B);

    for _ in 0..60 {
        let sdu = random_sdu(&mut rng, 200);
        a.send_sdu(sdu.clone());
        pump(&mut a, &mut b, &mut lossless);
        assert_eq!(b.delivered(), vec![sdu]);
    }
    assert_eq!(b.rb.stats().um_rx_buffered, 0);
}
