//! Behavioral tests for the propagation protocol, over a mock chain

use util::TestChain;

mod util;

#[test]
fn payload_flows_when_transport_drains() {
    let t = TestChain::new(1 << 20);
    t.open();
    assert_eq!(t.source().establishes.get(), 1);
    t.send(b"hello");
    t.send(b" world");
    assert_eq!(&*t.sink().wire.borrow(), b"hello world");
    assert_eq!(t.source().pauses.get(), 0);
    assert_eq!(t.in_flight(), 0);
}

#[test]
fn backpressure_pauses_exactly_once_per_cycle() {
    let t = TestChain::new(10);
    t.open();

    t.send(b"aaaaaaaa"); // 8 bytes, fits
    assert_eq!(t.source().pauses.get(), 0);

    t.send(b"bbbbbbbb"); // 2 accepted, 6 parked -> one pause
    assert_eq!(t.source().pauses.get(), 1);

    t.send(b"cccc"); // parked behind the pending write, still one pause
    assert_eq!(t.source().pauses.get(), 1);
    assert_eq!(t.source().resumes.get(), 0);

    t.complete_writes(1 << 20);
    assert_eq!(t.source().resumes.get(), 1);
    assert_eq!(t.source().pauses.get(), 1);
    assert_eq!(&*t.sink().wire.borrow(), b"aaaaaaaabbbbbbbbcccc");
    assert_eq!(t.in_flight(), 0);

    // a second cycle gets its own pause/resume pair
    t.sink().budget.set(1);
    t.send(b"dddd");
    assert_eq!(t.source().pauses.get(), 2);
    t.complete_writes(1 << 20);
    assert_eq!(t.source().resumes.get(), 2);
}

#[test]
fn queued_payloads_flush_in_arrival_order() {
    let t = TestChain::new(0); // transport accepts nothing at first
    t.open();

    let first: Vec<u8> = (0..4000u32).map(|i| i as u8).collect();
    let second = [0xEEu8; 50];
    t.send(&first);
    t.send(&second);
    assert!(t.sink().wire.borrow().is_empty());
    assert_eq!(t.source().pauses.get(), 1);

    t.complete_writes(1 << 20);
    let mut expected = first;
    expected.extend_from_slice(&second);
    assert_eq!(*t.sink().wire.borrow(), expected);
    assert_eq!(t.source().resumes.get(), 1);
    assert_eq!(t.in_flight(), 0);
}

#[test]
fn partial_drain_keeps_the_producer_paused() {
    let t = TestChain::new(0);
    t.open();
    t.send(b"0123456789");
    assert_eq!(t.source().pauses.get(), 1);

    // the transport wakes up but only takes half
    t.complete_writes(5);
    assert_eq!(&*t.sink().wire.borrow(), b"01234");
    assert_eq!(t.source().resumes.get(), 0);

    t.complete_writes(1 << 20);
    assert_eq!(&*t.sink().wire.borrow(), b"0123456789");
    assert_eq!(t.source().resumes.get(), 1);
}

#[test]
fn finish_is_idempotent() {
    let t = TestChain::new(1 << 20);
    t.open();
    assert_eq!(t.sink().open_resources.get(), 1);

    t.finish_from_head();
    assert_eq!(t.sink().open_resources.get(), 0);

    // racing close paths can finish the same line again
    t.finish_from_head();
    assert_eq!(t.sink().open_resources.get(), 0);
}

#[test]
fn payload_after_finish_is_dropped_and_recycled() {
    let t = TestChain::new(1 << 20);
    t.open();
    t.finish_from_head();

    t.send(b"late");
    assert!(t.sink().wire.borrow().is_empty());
    assert_eq!(t.in_flight(), 0);
}

#[test]
fn queued_payloads_recycle_on_finish() {
    let t = TestChain::new(0);
    t.open();
    t.send(b"stuck");
    assert_eq!(t.in_flight(), 1);

    t.finish_from_head();
    assert_eq!(t.in_flight(), 0);
    assert!(t.sink().wire.borrow().is_empty());
}

#[test]
fn failed_init_finishes_upstream_without_establish() {
    let t = TestChain::failing();
    t.open();
    assert_eq!(t.source().finishes.get(), 1);
    assert_eq!(t.source().establishes.get(), 0);
    assert!(!t.line.is_alive());

    // anything still in flight toward the dead line is dropped
    t.send(b"ping");
    assert!(t.sink().wire.borrow().is_empty());
    assert_eq!(t.in_flight(), 0);
}

#[test]
fn tail_initiated_finish_reaches_the_head() {
    let t = TestChain::new(1 << 20);
    t.open();
    {
        let _guard = t.line.guard();
        t.chain.ctx(2).send_finish_up(&t.line);
    }
    assert_eq!(t.source().finishes.get(), 1);
    assert!(!t.line.is_alive());
}

#[test]
fn upstream_payload_reaches_the_head() {
    let t = TestChain::new(1 << 20);
    t.open();
    let mut buf = t.pool.borrow_mut().get_small();
    buf.extend_from_slice(b"pong");
    {
        let _guard = t.line.guard();
        t.chain.ctx(2).send_payload_up(&t.line, buf);
    }
    assert_eq!(&*t.source().client_wire.borrow(), b"pong");
    assert_eq!(t.in_flight(), 0);
}
