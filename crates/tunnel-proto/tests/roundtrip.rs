//! Messages in at a gateway, through a three-hop outbound tunnel's
//! layers, and out of an endpoint's reassembly.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use tunnel_cell::cell::RawCell;
use tunnel_cell::delivery::Delivery;
use tunnel_cell::ids::{MessageId, RouterHash, TunnelId};
use tunnel_proto::batch::{BatchOutcome, BatchingEngine, CellSink, PendingMessage};
use tunnel_proto::config::{BatchConfig, ReassemblyConfig};
use tunnel_proto::hop::{HopKeys, HopRecord};
use tunnel_proto::pool::BufferPool;
use tunnel_proto::reassembly::ReassemblyEngine;
use tunnel_proto::route::{Direction, TunnelRoute};
use tunnel_rtcompat::Clock;
use tunnel_rtmock::MockRuntime;

type Delivered = Arc<Mutex<Vec<(Vec<u8>, Delivery)>>>;

fn three_hop_route() -> TunnelRoute {
    let mut rng = rand::thread_rng();
    let hops = (0..3_u32)
        .map(|i| {
            let keys = HopKeys::generate(&mut rng);
            let recv = if i == 0 { 0 } else { 100 + i };
            let send = if i == 2 { 0 } else { 101 + i };
            Arc::new(HopRecord::new(recv.into(), send.into(), &keys))
        })
        .collect();
    let peers = (0..3).map(|i| RouterHash::new([i as u8; 32])).collect();
    TunnelRoute::new(Direction::Outbound, hops, peers).unwrap()
}

struct Harness {
    rt: MockRuntime,
    route: TunnelRoute,
    endpoint: ReassemblyEngine<MockRuntime>,
    pool: Arc<BufferPool>,
    delivered: Delivered,
}

impl Harness {
    fn new() -> Self {
        let rt = MockRuntime::start();
        let pool = Arc::new(BufferPool::new());
        let delivered: Delivered = Arc::default();
        let d2 = Arc::clone(&delivered);
        let endpoint = ReassemblyEngine::new(
            rt.clone(),
            ReassemblyConfig::default(),
            Arc::clone(&pool),
            Arc::new(move |m: &[u8], d: Delivery| d2.lock().push((m.to_vec(), d))),
            Arc::default(),
        );
        Harness {
            rt,
            route: three_hop_route(),
            endpoint,
            pool,
            delivered,
        }
    }
}

/// Carries each cell through every relay's layer to the endpoint.
struct Tunnel<'a> {
    h: &'a Harness,
    cells: Vec<Box<RawCell>>,
}

impl<'a> CellSink for Tunnel<'a> {
    fn send_cell(&mut self, mut cell: Box<RawCell>) {
        assert!(self.h.route.encrypt_outbound(&mut cell[..]));
        for i in 1..self.h.route.len() {
            assert!(self.h.route.hop(i).unwrap().peel_one_hop(&mut cell[..]));
        }
        self.cells.push(cell);
    }
}

fn random_delivery(rng: &mut StdRng) -> Delivery {
    match rng.gen_range(0..3) {
        0 => Delivery::Local,
        1 => Delivery::Router(RouterHash::new(rng.gen())),
        _ => Delivery::Tunnel {
            router: RouterHash::new(rng.gen()),
            tunnel: TunnelId::from(rng.gen_range(1..=u32::MAX)),
        },
    }
}

#[test]
fn random_messages_survive() {
    let h = Harness::new();
    let mut rng = StdRng::seed_from_u64(0x7e57);
    let mut engine = BatchingEngine::new(BatchConfig::default(), Arc::default());
    let mut queue = VecDeque::new();
    let mut sent = Vec::new();
    let mut n_cells = 0;

    for _ in 0..60 {
        for _ in 0..rng.gen_range(1..=4) {
            let len = rng.gen_range(1..=6000);
            let mut data = vec![0_u8; len];
            rng.fill(&mut data[..]);
            let delivery = random_delivery(&mut rng);
            let id = MessageId::from(sent.len() as u32 + 1);
            let m = PendingMessage::new(
                Bytes::from(data.clone()),
                delivery,
                id,
                u64::MAX,
                h.rt.now(),
            )
            .unwrap();
            queue.push_back(m);
            sent.push((data, delivery));
        }
        loop {
            let mut t = Tunnel {
                h: &h,
                cells: Vec::new(),
            };
            let outcome = engine.preprocess(&mut queue, h.rt.now(), &mut t).unwrap();
            for c in &t.cells {
                assert!(h.endpoint.receive(&c[..]));
            }
            n_cells += t.cells.len();
            match outcome {
                BatchOutcome::Drained => break,
                BatchOutcome::Delay(d) => {
                    if rng.gen_bool(0.5) {
                        break;
                    }
                    h.rt.advance(d);
                }
                _ => unreachable!(),
            }
        }
    }
    // Flush what's left.
    while !queue.is_empty() {
        h.rt.advance(Duration::from_millis(50));
        let mut t = Tunnel {
            h: &h,
            cells: Vec::new(),
        };
        engine.preprocess(&mut queue, h.rt.now(), &mut t).unwrap();
        for c in &t.cells {
            assert!(h.endpoint.receive(&c[..]));
        }
        n_cells += t.cells.len();
    }

    let got = h.delivered.lock();
    assert_eq!(got.len(), sent.len());
    for (g, s) in got.iter().zip(sent.iter()) {
        assert_eq!(g, s);
    }
    assert!(n_cells > 0);
    assert_eq!(h.endpoint.pending_count(), 0);
    assert_eq!(h.pool.stats().outstanding(), 0);
    assert_eq!(h.endpoint.stats().corrupt.get(), 0);
}

#[test]
fn abandoned_message_frees_buffers_once() {
    let h = Harness::new();
    let mut engine = BatchingEngine::new(BatchConfig::default(), Arc::default());
    let m = PendingMessage::new(
        Bytes::from(vec![0x42; 2500]),
        Delivery::Local,
        MessageId::from(77),
        u64::MAX,
        h.rt.now(),
    )
    .unwrap();
    let mut queue: VecDeque<_> = vec![m].into();
    let mut t = Tunnel {
        h: &h,
        cells: Vec::new(),
    };
    let r = engine.preprocess(&mut queue, h.rt.now(), &mut t).unwrap();
    assert_eq!(r, BatchOutcome::Delay(Duration::from_millis(50)));
    assert_eq!(t.cells.len(), 2);
    for c in &t.cells {
        assert!(h.endpoint.receive(&c[..]));
    }
    // The third cell is never sent.
    assert_eq!(h.endpoint.pending_count(), 1);
    assert_eq!(h.pool.stats().outstanding(), 2);

    h.rt.advance(Duration::from_secs(45));
    assert_eq!(h.endpoint.pending_count(), 0);
    assert_eq!(h.endpoint.stats().failed.get(), 1);
    assert_eq!(h.pool.stats().released.get(), 2);

    h.rt.advance(Duration::from_secs(120));
    h.endpoint.clear();
    assert_eq!(h.pool.stats().released.get(), 2);
    assert!(h.delivered.lock().is_empty());
}

#[test]
fn tampered_cell_is_dropped() {
    let h = Harness::new();
    let mut engine = BatchingEngine::new(BatchConfig::default(), Arc::default());
    let m = PendingMessage::new(
        Bytes::from_static(b"hello through the tunnel"),
        Delivery::Local,
        MessageId::from(1),
        u64::MAX,
        h.rt.now(),
    )
    .unwrap();
    let mut queue: VecDeque<_> = vec![m].into();
    h.rt.advance(Duration::from_millis(1));
    let mut t = Tunnel {
        h: &h,
        cells: Vec::new(),
    };
    assert!(matches!(
        engine.preprocess(&mut queue, h.rt.now(), &mut t).unwrap(),
        BatchOutcome::Delay(_)
    ));
    h.rt.advance(Duration::from_millis(50));
    engine.preprocess(&mut queue, h.rt.now(), &mut t).unwrap();
    assert_eq!(t.cells.len(), 1);

    let mut bad = t.cells[0].clone();
    bad[1000] ^= 0x01;
    assert!(!h.endpoint.receive(&bad[..]));
    assert!(h.endpoint.receive(&t.cells[0][..]));
    assert_eq!(h.delivered.lock().len(), 1);
    assert_eq!(h.endpoint.stats().corrupt.get(), 1);
}
